//! The command-resolution pipeline.
//!
//! `resolve` turns a message text plus sender identity into a routing
//! outcome by walking a strictly ordered sequence of stages:
//!
//! A. reserved meta-commands (`/help`, `/status`, `/list`, `/style`)
//! B. forced dispatch by command-set name or prefix token
//! C. candidate assembly (public sets + the user's style per category)
//! D. prefix matching against the ordered candidates
//! E. command match with enablement / access / privilege / time guards
//! F. the configured final rule
//!
//! The router performs no I/O.  Everything it consults — config snapshot,
//! user record, the set of currently connected upstreams, and the local
//! wall-clock time — is passed in by the caller, which keeps resolution a
//! pure function and lets tests pin the clock and connectivity.

use crate::config::{CommandSet, Config, FinalAction};
use crate::db::UserRecord;
use chrono::NaiveTime;
use std::collections::HashSet;

pub const REPLY_SET_DISABLED: &str = "指令集已禁用";
pub const REPLY_NO_ACCESS: &str = "无权使用";
pub const REPLY_NEED_PRIVILEGE: &str = "该指令需要特权";
pub const REPLY_OUTSIDE_WINDOW: &str = "不在可用时间";
pub const REPLY_TARGET_DOWN: &str = "目标连接不可用";

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// The final routing decision for a message event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Forward the event to the named upstream connection.  `text` is the
    /// rewritten message text when a prefix was stripped, `None` when the
    /// event goes out unmodified.
    Forward {
        connection_id: String,
        text: Option<String>,
    },
    /// Answer the originating frontend with a synthesized text reply.
    Reply { text: String },
    /// Silently ignore the event.
    Drop,
}

/// What `resolve` hands back: either a committed decision, or a reserved
/// meta-command for the style manager to execute (the router itself never
/// touches the repository).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Meta(MetaCommand),
    Decision(Decision),
}

/// A parsed built-in invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaCommand {
    Help,
    Status,
    List { category: Option<String> },
    StyleList,
    StyleCurrent,
    StyleSelect { category: String, set: String },
    /// Bare `/style` or an unrecognized subcommand: answer with usage.
    StyleUsage,
}

/// The routed fields of one inbound message event.
#[derive(Debug, Clone)]
pub struct RouteRequest<'a> {
    pub text: &'a str,
    pub sender_id: i64,
    pub group_id: Option<i64>,
    /// Effective privilege (config admins ∪ persisted flag).
    pub is_privileged: bool,
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

pub fn resolve(
    cfg: &Config,
    user: &UserRecord,
    connected: &HashSet<String>,
    now: NaiveTime,
    req: &RouteRequest<'_>,
) -> RouteOutcome {
    // Stage A — reserved meta-commands win over everything.
    if let Some(meta) = parse_meta(req.text) {
        return RouteOutcome::Meta(meta);
    }

    // Stage B — forced dispatch: `<token> <rest>` where the token names a
    // command set (by name or prefix, case-sensitive).  The token is always
    // consumed; matching and forwarding both see `rest`.
    if let Some((token, rest)) = req.text.split_once(' ') {
        let rest = rest.trim_start_matches(' ');
        if !rest.is_empty() {
            if let Some(set) = cfg
                .command_sets
                .iter()
                .find(|s| s.name == token || s.prefix.as_deref() == Some(token))
            {
                if !set.enabled {
                    return reply(REPLY_SET_DISABLED);
                }
                return match match_commands(cfg, connected, now, req, &[set], rest) {
                    RouteOutcome::Decision(Decision::Drop) => {
                        RouteOutcome::Decision(apply_final_rule(cfg))
                    }
                    committed => committed,
                };
            }
        }
    }

    // Stage C — candidate assembly.
    let candidate_ids = assemble_candidates(cfg, user);
    let mut candidates: Vec<&CommandSet> = cfg
        .sets_by_priority()
        .filter(|s| candidate_ids.contains(s.id.as_str()))
        .collect();

    // Stage D — prefix matching.  The first candidate (in priority order)
    // whose prefix matches restricts the list to itself; its `strip_prefix`
    // decides whether stage E sees the remainder or the original text.
    let mut text = req.text;
    let mut promoted = None;
    for (i, set) in candidates.iter().enumerate() {
        let Some(prefix) = set.prefix.as_deref() else {
            continue;
        };
        let Some(remainder) = strip_prefix_token(req.text, prefix) else {
            continue;
        };
        if set.strip_prefix {
            text = remainder;
        }
        promoted = Some(i);
        break;
    }
    if let Some(i) = promoted {
        candidates = vec![candidates[i]];
    }

    // Stage E — command match with guards.
    match match_commands(cfg, connected, now, req, &candidates, text) {
        RouteOutcome::Decision(Decision::Drop) => {}
        committed => return committed,
    }

    // Stage F — final rule.
    RouteOutcome::Decision(apply_final_rule(cfg))
}

fn reply(text: &str) -> RouteOutcome {
    RouteOutcome::Decision(Decision::Reply {
        text: text.to_owned(),
    })
}

/// Stage C: public enabled sets, plus per enabled category the user's
/// selection, falling back to the category default, falling back (for
/// non-mutex categories) to every enabled member set.
fn assemble_candidates<'a>(cfg: &'a Config, user: &UserRecord) -> HashSet<&'a str> {
    let mut ids: HashSet<&str> = HashSet::new();
    for set in &cfg.command_sets {
        if set.is_public && set.enabled {
            ids.insert(&set.id);
        }
    }
    for cat in &cfg.categories {
        if !cat.enabled {
            continue;
        }
        let selected = user
            .selected_styles
            .get(&cat.id)
            .and_then(|id| cfg.command_set(id))
            .filter(|s| s.enabled && s.category.as_deref() == Some(cat.id.as_str()));
        if let Some(set) = selected {
            ids.insert(&set.id);
            continue;
        }
        if let Some(def) = default_set_of(cfg, &cat.id, cat.default_command_set.as_deref()) {
            ids.insert(&def.id);
            continue;
        }
        if !cat.is_mutex {
            for set in cfg.sets_in_category(&cat.id) {
                if set.enabled {
                    ids.insert(&set.id);
                }
            }
        }
    }
    ids
}

/// The category default: the explicitly configured set, or the first member
/// flagged `is_default`.
fn default_set_of<'a>(
    cfg: &'a Config,
    category_id: &str,
    configured: Option<&str>,
) -> Option<&'a CommandSet> {
    if let Some(set) = configured.and_then(|id| cfg.command_set(id)).filter(|s| s.enabled) {
        return Some(set);
    }
    cfg.sets_in_category(category_id)
        .find(|s| s.is_default && s.enabled)
}

/// `text` starts with `prefix` followed by an ASCII space or end-of-string.
/// Returns the remainder after the separator.
fn strip_prefix_token<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix(' ')
    }
}

/// Stage E over an ordered candidate list.  Returns `Drop` to mean "no
/// candidate matched" (the caller falls through to the final rule); any
/// other outcome is committed.
fn match_commands(
    cfg: &Config,
    connected: &HashSet<String>,
    now: NaiveTime,
    req: &RouteRequest<'_>,
    candidates: &[&CommandSet],
    text: &str,
) -> RouteOutcome {
    for set in candidates {
        // Guard 1: a disabled set is a miss, not a denial.
        if !set.enabled {
            continue;
        }
        let Some(command) = set.match_order().find_map(|(token, cmd)| {
            let matched = text == token
                || text
                    .strip_prefix(token)
                    .is_some_and(|rest| rest.starts_with(char::is_whitespace));
            matched.then_some(cmd)
        }) else {
            continue;
        };

        // Guard 2: access lists.  Deny is sticky once a command is named —
        // falling through here would leak which sets the caller may use.
        if let Some(list) = set.user_access_list.as_deref().and_then(|id| cfg.access_list(id)) {
            if !list.permits(req.sender_id) {
                return reply(REPLY_NO_ACCESS);
            }
        }
        if let (Some(list), Some(group_id)) = (
            set.group_access_list.as_deref().and_then(|id| cfg.access_list(id)),
            req.group_id,
        ) {
            if !list.permits(group_id) {
                return reply(REPLY_NO_ACCESS);
            }
        }

        // Guard 3: privilege.
        if command.is_privileged && !req.is_privileged {
            return reply(REPLY_NEED_PRIVILEGE);
        }

        // Guard 4: time window.
        if let Some(window) = &command.time_restriction {
            if !window.contains(now) {
                return reply(REPLY_OUTSIDE_WINDOW);
            }
        }

        let Some(target) = set.target_ws.as_deref() else {
            return reply(REPLY_TARGET_DOWN);
        };
        if !connected.contains(target) {
            return reply(REPLY_TARGET_DOWN);
        }
        return RouteOutcome::Decision(Decision::Forward {
            connection_id: target.to_owned(),
            text: (text != req.text).then(|| text.to_owned()),
        });
    }
    RouteOutcome::Decision(Decision::Drop)
}

fn apply_final_rule(cfg: &Config) -> Decision {
    let rule = &cfg.final_rule;
    match rule.action {
        FinalAction::Reject => {
            if rule.send_message {
                if let Some(message) = &rule.message {
                    return Decision::Reply {
                        text: message.clone(),
                    };
                }
            }
            Decision::Drop
        }
        FinalAction::Allow => Decision::Drop,
        FinalAction::Forward => match &rule.target_ws {
            Some(target) => Decision::Forward {
                connection_id: target.clone(),
                text: None,
            },
            // Unreachable after validation; dropping is the safe default.
            None => Decision::Drop,
        },
    }
}

// ---------------------------------------------------------------------------
// Meta-command parsing (stage A)
// ---------------------------------------------------------------------------

fn parse_meta(text: &str) -> Option<MetaCommand> {
    let mut parts = text.split_whitespace();
    match parts.next()? {
        "/help" => Some(MetaCommand::Help),
        "/status" => Some(MetaCommand::Status),
        "/list" => Some(MetaCommand::List {
            category: parts.next().map(str::to_owned),
        }),
        "/style" => match parts.next() {
            Some("list") => Some(MetaCommand::StyleList),
            Some("current") => Some(MetaCommand::StyleCurrent),
            Some("select") => match (parts.next(), parts.next()) {
                (Some(category), Some(set)) => Some(MetaCommand::StyleSelect {
                    category: category.to_owned(),
                    set: set.to_owned(),
                }),
                _ => Some(MetaCommand::StyleUsage),
            },
            _ => Some(MetaCommand::StyleUsage),
        },
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;

    const FIXTURE: &str = r#"
schema_version = 1

[[connections]]
id = "c1"
url = "ws://127.0.0.1:9001/ws"

[[connections]]
id = "c2"
url = "ws://127.0.0.1:9002/ws"

[[connections]]
id = "cF"
url = "ws://127.0.0.1:9003/ws"

[[categories]]
id = "pjsk"
display_name = "PJSK"
is_mutex = true
default_command_set = "A"

[[categories]]
id = "misc"
display_name = "Misc"
is_mutex = false

[[command_sets]]
id = "A"
name = "bot1"
prefix = "bot1"
category = "pjsk"
target_ws = "c1"
strip_prefix = true
priority = 10

  [[command_sets.commands]]
  name = "/info"

  [[command_sets.commands]]
  name = "/sing"

  [[command_sets.commands]]
  name = "/vip"

  [[command_sets.commands]]
  name = "/admin"
  is_privileged = true

  [[command_sets.commands]]
  name = "/night"
  time_restriction = { start = "22:00", end = "06:00" }

[[command_sets]]
id = "B"
name = "bot2"
category = "pjsk"
target_ws = "c2"
priority = 5

  [[command_sets.commands]]
  name = "/sing"

[[command_sets]]
id = "pub"
name = "pubset"
is_public = true
target_ws = "c2"
priority = 20
user_access_list = "vips"
group_access_list = "groups"

  [[command_sets.commands]]
  name = "/vip"

[[access_lists]]
id = "vips"
name = "VIP users"
type = "user"
mode = "whitelist"
items = [111]

[[access_lists]]
id = "groups"
name = "blocked groups"
type = "group"
mode = "blacklist"
items = [666]

[final_rule]
action = "reject"
message = "未知指令"
send_message = true
"#;

    fn cfg() -> Config {
        load_config_from_str(FIXTURE).expect("fixture config must validate")
    }

    fn all_connected() -> HashSet<String> {
        ["c1", "c2", "cF"].iter().map(|s| (*s).to_owned()).collect()
    }

    fn noon() -> NaiveTime {
        NaiveTime::parse_from_str("12:00", "%H:%M").unwrap()
    }

    fn request(text: &str) -> RouteRequest<'_> {
        RouteRequest {
            text,
            sender_id: 1000,
            group_id: None,
            is_privileged: false,
        }
    }

    fn decide(cfg: &Config, user: &UserRecord, now: NaiveTime, req: &RouteRequest<'_>) -> Decision {
        match resolve(cfg, user, &all_connected(), now, req) {
            RouteOutcome::Decision(d) => d,
            RouteOutcome::Meta(m) => panic!("expected a decision, got meta {m:?}"),
        }
    }

    #[test]
    fn s1_forced_dispatch_strips_token() {
        let cfg = cfg();
        let user = UserRecord::new(1000);
        let d = decide(&cfg, &user, noon(), &request("bot1 /info hello"));
        assert_eq!(
            d,
            Decision::Forward {
                connection_id: "c1".to_owned(),
                text: Some("/info hello".to_owned()),
            }
        );
    }

    #[test]
    fn s2_forced_disabled_set_is_reported() {
        let toml = FIXTURE.replace("id = \"A\"\nname = \"bot1\"", "id = \"A\"\nname = \"bot1\"\nenabled = false");
        let cfg = load_config_from_str(&toml).unwrap();
        let user = UserRecord::new(1000);
        let d = decide(&cfg, &user, noon(), &request("bot1 /info"));
        assert_eq!(
            d,
            Decision::Reply {
                text: REPLY_SET_DISABLED.to_owned()
            }
        );
    }

    #[test]
    fn forced_dispatch_without_command_match_hits_final_rule() {
        let cfg = cfg();
        let user = UserRecord::new(1000);
        let d = decide(&cfg, &user, noon(), &request("bot1 /unknown"));
        assert_eq!(
            d,
            Decision::Reply {
                text: "未知指令".to_owned()
            }
        );
    }

    #[test]
    fn s3_privileged_command_denied_to_plain_user() {
        let cfg = cfg();
        let user = UserRecord::new(1000);
        let d = decide(&cfg, &user, noon(), &request("/admin"));
        assert_eq!(
            d,
            Decision::Reply {
                text: REPLY_NEED_PRIVILEGE.to_owned()
            }
        );

        let mut privileged = request("/admin");
        privileged.is_privileged = true;
        let d = decide(&cfg, &user, noon(), &privileged);
        assert!(matches!(d, Decision::Forward { connection_id, .. } if connection_id == "c1"));
    }

    #[test]
    fn s4_time_window_wraps_midnight() {
        let cfg = cfg();
        let user = UserRecord::new(1000);
        let at = |s: &str| NaiveTime::parse_from_str(s, "%H:%M").unwrap();

        let d = decide(&cfg, &user, at("23:30"), &request("/night"));
        assert!(matches!(d, Decision::Forward { .. }));

        let d = decide(&cfg, &user, at("10:00"), &request("/night"));
        assert_eq!(
            d,
            Decision::Reply {
                text: REPLY_OUTSIDE_WINDOW.to_owned()
            }
        );
    }

    #[test]
    fn s5_mutex_category_follows_selection() {
        let cfg = cfg();
        let mut user = UserRecord::new(1000);

        // No selection: the category default (A) wins.
        let d = decide(&cfg, &user, noon(), &request("/sing"));
        assert!(matches!(d, Decision::Forward { connection_id, .. } if connection_id == "c1"));

        // After selecting B, the same message routes to B's target.
        user.selected_styles
            .insert("pjsk".to_owned(), "B".to_owned());
        let d = decide(&cfg, &user, noon(), &request("/sing"));
        assert!(matches!(d, Decision::Forward { connection_id, .. } if connection_id == "c2"));
    }

    #[test]
    fn s6_final_rule_forwards_unmatched() {
        let toml = FIXTURE.replace(
            "action = \"reject\"",
            "action = \"forward\"\ntarget_ws = \"cF\"",
        );
        let cfg = load_config_from_str(&toml).unwrap();
        let user = UserRecord::new(1000);
        let d = decide(&cfg, &user, noon(), &request("anything else"));
        assert_eq!(
            d,
            Decision::Forward {
                connection_id: "cF".to_owned(),
                text: None,
            }
        );
    }

    #[test]
    fn final_reject_replies_with_configured_message() {
        let cfg = cfg();
        let user = UserRecord::new(1000);
        let d = decide(&cfg, &user, noon(), &request("no such command"));
        assert_eq!(
            d,
            Decision::Reply {
                text: "未知指令".to_owned()
            }
        );
    }

    #[test]
    fn access_deny_is_sticky() {
        let cfg = cfg();
        let user = UserRecord::new(222);
        // `pub` (priority 20) outranks A; its whitelist denies 222.  The
        // resolution must NOT fall through to A, which also knows /vip.
        let d = decide(&cfg, &user, noon(), &request("/vip"));
        assert_eq!(
            d,
            Decision::Reply {
                text: REPLY_NO_ACCESS.to_owned()
            }
        );

        // A whitelisted caller routes through the public set.
        let mut req = request("/vip");
        req.sender_id = 111;
        let d = decide(&cfg, &UserRecord::new(111), noon(), &req);
        assert!(matches!(d, Decision::Forward { connection_id, .. } if connection_id == "c2"));
    }

    #[test]
    fn group_blacklist_denies_listed_group() {
        let cfg = cfg();
        let mut req = request("/vip");
        req.sender_id = 111;
        req.group_id = Some(666);
        let d = decide(&cfg, &UserRecord::new(111), noon(), &req);
        assert_eq!(
            d,
            Decision::Reply {
                text: REPLY_NO_ACCESS.to_owned()
            }
        );
    }

    #[test]
    fn priority_renumbering_flips_the_winner() {
        let toml = FIXTURE.replace("priority = 10", "priority = 1");
        // With A demoted below pub, a whitelisted /vip still goes to pub
        // (20 > 1); demote pub instead and A must win.
        let cfg = load_config_from_str(&toml).unwrap();
        let mut req = request("/vip");
        req.sender_id = 111;
        let d = decide(&cfg, &UserRecord::new(111), noon(), &req);
        assert!(matches!(d, Decision::Forward { connection_id, .. } if connection_id == "c2"));

        let toml = FIXTURE.replace("priority = 20", "priority = 2");
        let cfg = load_config_from_str(&toml).unwrap();
        let mut req = request("/vip");
        req.sender_id = 111;
        let d = decide(&cfg, &UserRecord::new(111), noon(), &req);
        assert!(matches!(d, Decision::Forward { connection_id, .. } if connection_id == "c1"));
    }

    #[test]
    fn forward_requires_live_connection() {
        let cfg = cfg();
        let user = UserRecord::new(1000);
        let connected: HashSet<String> = HashSet::new();
        let outcome = resolve(&cfg, &user, &connected, noon(), &request("/info"));
        assert_eq!(
            outcome,
            RouteOutcome::Decision(Decision::Reply {
                text: REPLY_TARGET_DOWN.to_owned()
            })
        );
    }

    #[test]
    fn meta_commands_shadow_user_commands() {
        let cfg = cfg();
        let user = UserRecord::new(1000);
        let outcome = resolve(&cfg, &user, &all_connected(), noon(), &request("/list pjsk"));
        assert_eq!(
            outcome,
            RouteOutcome::Meta(MetaCommand::List {
                category: Some("pjsk".to_owned())
            })
        );
    }

    #[test]
    fn meta_parsing_covers_style_forms() {
        assert_eq!(parse_meta("/help"), Some(MetaCommand::Help));
        assert_eq!(parse_meta("/status"), Some(MetaCommand::Status));
        assert_eq!(parse_meta("/list"), Some(MetaCommand::List { category: None }));
        assert_eq!(parse_meta("/style"), Some(MetaCommand::StyleUsage));
        assert_eq!(parse_meta("/style list"), Some(MetaCommand::StyleList));
        assert_eq!(parse_meta("/style current"), Some(MetaCommand::StyleCurrent));
        assert_eq!(
            parse_meta("/style select pjsk B"),
            Some(MetaCommand::StyleSelect {
                category: "pjsk".to_owned(),
                set: "B".to_owned(),
            })
        );
        assert_eq!(parse_meta("/style select pjsk"), Some(MetaCommand::StyleUsage));
        // A longer token is not a meta-command.
        assert_eq!(parse_meta("/helpless"), None);
        assert_eq!(parse_meta("/listen"), None);
    }

    #[test]
    fn longest_command_name_wins_within_a_set() {
        let toml = FIXTURE.replace(
            "  [[command_sets.commands]]\n  name = \"/info\"",
            "  [[command_sets.commands]]\n  name = \"/info\"\n\n  [[command_sets.commands]]\n  name = \"/informal\"",
        );
        let cfg = load_config_from_str(&toml).unwrap();
        let user = UserRecord::new(1000);
        // "/informal now" must match /informal, not /info + "rmal now".
        let d = decide(&cfg, &user, noon(), &request("/informal now"));
        assert!(matches!(d, Decision::Forward { .. }));
        // "/infoX" matches neither (no whitespace boundary after /info).
        let d = decide(&cfg, &user, noon(), &request("/infoX"));
        assert_eq!(
            d,
            Decision::Reply {
                text: "未知指令".to_owned()
            }
        );
    }

    #[test]
    fn selection_of_disabled_set_falls_back_to_default() {
        let toml = FIXTURE.replace("id = \"B\"\nname = \"bot2\"", "id = \"B\"\nname = \"bot2\"\nenabled = false");
        let cfg = load_config_from_str(&toml).unwrap();
        let mut user = UserRecord::new(1000);
        user.selected_styles
            .insert("pjsk".to_owned(), "B".to_owned());
        // B is disabled: the category default (A) takes over.
        let d = decide(&cfg, &user, noon(), &request("/sing"));
        assert!(matches!(d, Decision::Forward { connection_id, .. } if connection_id == "c1"));
    }

    #[test]
    fn resolution_is_deterministic() {
        let cfg = cfg();
        let user = UserRecord::new(1000);
        let first = resolve(&cfg, &user, &all_connected(), noon(), &request("bot1 /sing x"));
        for _ in 0..10 {
            let again = resolve(&cfg, &user, &all_connected(), noon(), &request("bot1 /sing x"));
            assert_eq!(first, again);
        }
    }
}
