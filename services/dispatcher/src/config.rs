//! Dispatcher configuration loading.
//!
//! TOML is the sole config source.  Default config path:
//! `/etc/ob-dispatch/dispatcher.toml`.
//!
//! Loading is two-phase: raw serde deserialization into `Raw*` structs,
//! then an explicit validation pass that checks every cross-reference
//! (category defaults, target connections, access-list types) and produces
//! the immutable [`Config`] the router consumes.  A running dispatcher never
//! mutates a `Config`; reload builds a fresh one and swaps the `Arc`.

use chrono::NaiveTime;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub schema_version: u32,
    pub listen: ListenConfig,
    pub storage: StorageConfig,
    /// Senders that are privileged regardless of their user record.
    pub admins: HashSet<i64>,
    pub categories: Vec<Category>,
    pub command_sets: Vec<CommandSet>,
    pub access_lists: Vec<AccessList>,
    pub connections: Vec<Connection>,
    pub final_rule: FinalRule,

    category_index: HashMap<String, usize>,
    set_index: HashMap<String, usize>,
    access_index: HashMap<String, usize>,
    connection_index: HashMap<String, usize>,
    /// Command-set indices sorted by descending priority, then config order.
    routing_order: Vec<usize>,
    /// Category id -> member set indices, in config order.
    category_members: HashMap<String, Vec<usize>>,
}

#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub bind: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
}

#[derive(Debug, Clone)]
pub struct Category {
    pub id: String,
    pub display_name: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub order: i32,
    pub enabled: bool,
    pub allow_user_switch: bool,
    pub is_mutex: bool,
    pub default_command_set: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommandSet {
    pub id: String,
    pub name: String,
    pub prefix: Option<String>,
    pub category: Option<String>,
    pub target_ws: Option<String>,
    pub is_public: bool,
    pub strip_prefix: bool,
    pub priority: i32,
    pub enabled: bool,
    pub is_default: bool,
    pub user_access_list: Option<String>,
    pub group_access_list: Option<String>,
    pub commands: Vec<Command>,
    /// `(token, command index)` over names and aliases, longest token first,
    /// so `/list` never shadows `/listen`.
    match_order: Vec<(String, usize)>,
}

#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub aliases: Vec<String>,
    pub description: Option<String>,
    pub is_privileged: bool,
    pub time_restriction: Option<TimeWindow>,
}

/// A daily wall-clock window, inclusive start, exclusive end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    /// Windows with `end < start` wrap midnight.  `start == end` is empty.
    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= now && now < self.end
        } else {
            now >= self.start || now < self.end
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    User,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Whitelist,
    Blacklist,
}

#[derive(Debug, Clone)]
pub struct AccessList {
    pub id: String,
    pub name: String,
    pub kind: AccessKind,
    pub mode: AccessMode,
    pub items: HashSet<i64>,
}

impl AccessList {
    /// Whether `id` passes this list.
    pub fn permits(&self, id: i64) -> bool {
        match self.mode {
            AccessMode::Whitelist => self.items.contains(&id),
            AccessMode::Blacklist => !self.items.contains(&id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: String,
    pub name: String,
    pub url: String,
    pub token: Option<String>,
    pub auto_reconnect: bool,
    pub reconnect_interval_s: u64,
    pub allow_forward: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalAction {
    Reject,
    Allow,
    Forward,
}

#[derive(Debug, Clone)]
pub struct FinalRule {
    pub action: FinalAction,
    pub target_ws: Option<String>,
    pub message: Option<String>,
    pub send_message: bool,
}

// ---------------------------------------------------------------------------
// Lookup helpers
// ---------------------------------------------------------------------------

impl Config {
    pub fn category(&self, id: &str) -> Option<&Category> {
        self.category_index.get(id).map(|&i| &self.categories[i])
    }

    pub fn command_set(&self, id: &str) -> Option<&CommandSet> {
        self.set_index.get(id).map(|&i| &self.command_sets[i])
    }

    pub fn access_list(&self, id: &str) -> Option<&AccessList> {
        self.access_index.get(id).map(|&i| &self.access_lists[i])
    }

    pub fn connection(&self, id: &str) -> Option<&Connection> {
        self.connection_index
            .get(id)
            .map(|&i| &self.connections[i])
    }

    /// Command sets in descending priority, then config order.
    pub fn sets_by_priority(&self) -> impl Iterator<Item = &CommandSet> {
        self.routing_order.iter().map(|&i| &self.command_sets[i])
    }

    /// Member sets of a category, in config order.
    pub fn sets_in_category(&self, category_id: &str) -> impl Iterator<Item = &CommandSet> {
        self.category_members
            .get(category_id)
            .into_iter()
            .flatten()
            .map(|&i| &self.command_sets[i])
    }

    /// Categories sorted by their `order` field, then config order.
    pub fn categories_in_order(&self) -> Vec<&Category> {
        let mut cats: Vec<&Category> = self.categories.iter().collect();
        cats.sort_by_key(|c| c.order);
        cats
    }
}

impl CommandSet {
    /// Match tokens (names and aliases) longest-first.
    pub fn match_order(&self) -> impl Iterator<Item = (&str, &Command)> {
        self.match_order
            .iter()
            .map(|(token, idx)| (token.as_str(), &self.commands[*idx]))
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    listen: Option<RawListen>,
    storage: Option<RawStorage>,
    #[serde(default)]
    admins: Vec<i64>,
    #[serde(default)]
    categories: Vec<RawCategory>,
    #[serde(default)]
    command_sets: Vec<RawCommandSet>,
    #[serde(default)]
    access_lists: Vec<RawAccessList>,
    #[serde(default)]
    connections: Vec<RawConnection>,
    final_rule: Option<RawFinalRule>,
}

#[derive(Debug, Deserialize)]
struct RawListen {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStorage {
    sqlite_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCategory {
    id: Option<String>,
    display_name: Option<String>,
    description: Option<String>,
    icon: Option<String>,
    order: Option<i32>,
    enabled: Option<bool>,
    allow_user_switch: Option<bool>,
    is_mutex: Option<bool>,
    default_command_set: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCommandSet {
    id: Option<String>,
    name: Option<String>,
    prefix: Option<String>,
    category: Option<String>,
    target_ws: Option<String>,
    is_public: Option<bool>,
    strip_prefix: Option<bool>,
    priority: Option<i32>,
    enabled: Option<bool>,
    is_default: Option<bool>,
    user_access_list: Option<String>,
    group_access_list: Option<String>,
    #[serde(default)]
    commands: Vec<RawCommand>,
}

#[derive(Debug, Deserialize)]
struct RawCommand {
    name: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
    description: Option<String>,
    is_privileged: Option<bool>,
    time_restriction: Option<RawTimeWindow>,
}

#[derive(Debug, Deserialize)]
struct RawTimeWindow {
    start: Option<String>,
    end: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAccessList {
    id: Option<String>,
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    mode: Option<String>,
    #[serde(default)]
    items: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct RawConnection {
    id: Option<String>,
    name: Option<String>,
    url: Option<String>,
    token: Option<String>,
    auto_reconnect: Option<bool>,
    reconnect_interval_s: Option<u64>,
    allow_forward: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawFinalRule {
    action: Option<String>,
    target_ws: Option<String>,
    message: Option<String>,
    send_message: Option<bool>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config at {path}: {reason}")]
    Invalid { path: String, reason: String },
}

fn invalid(path: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        path: path.into(),
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from_path(Path::new("/etc/ob-dispatch/dispatcher.toml"))
}

pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(raw)
}

// ---------------------------------------------------------------------------
// Validation pass
// ---------------------------------------------------------------------------

fn validate(raw: RawConfig) -> Result<Config, ConfigError> {
    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(invalid(
            "schema_version",
            format!("must be 1, got {schema_version}"),
        ));
    }

    let listen = ListenConfig {
        bind: raw
            .listen
            .and_then(|l| l.bind)
            .unwrap_or_else(|| "0.0.0.0:6700".to_owned()),
    };
    let storage = StorageConfig {
        sqlite_path: raw
            .storage
            .and_then(|s| s.sqlite_path)
            .unwrap_or_else(|| "/var/lib/ob-dispatch/users.sqlite3".to_owned()),
    };

    // Connections first: command sets and the final rule reference them.
    let mut connections = Vec::with_capacity(raw.connections.len());
    let mut connection_index = HashMap::new();
    for (i, c) in raw.connections.into_iter().enumerate() {
        let path = format!("connections[{i}]");
        let id = c
            .id
            .ok_or_else(|| ConfigError::MissingField(format!("{path}.id")))?;
        if connection_index.insert(id.clone(), i).is_some() {
            return Err(invalid(path, format!("duplicate connection id '{id}'")));
        }
        let url = c
            .url
            .ok_or_else(|| ConfigError::MissingField(format!("{path}.url")))?;
        connections.push(Connection {
            name: c.name.unwrap_or_else(|| id.clone()),
            id,
            url,
            token: c.token,
            auto_reconnect: c.auto_reconnect.unwrap_or(true),
            reconnect_interval_s: c.reconnect_interval_s.unwrap_or(5).max(1),
            allow_forward: c.allow_forward.unwrap_or(true),
        });
    }

    let mut access_lists = Vec::with_capacity(raw.access_lists.len());
    let mut access_index = HashMap::new();
    for (i, a) in raw.access_lists.into_iter().enumerate() {
        let path = format!("access_lists[{i}]");
        let id = a
            .id
            .ok_or_else(|| ConfigError::MissingField(format!("{path}.id")))?;
        if access_index.insert(id.clone(), i).is_some() {
            return Err(invalid(path, format!("duplicate access list id '{id}'")));
        }
        let kind = match a.kind.as_deref() {
            Some("user") => AccessKind::User,
            Some("group") => AccessKind::Group,
            Some(other) => {
                return Err(invalid(
                    format!("{path}.type"),
                    format!("expected 'user' or 'group', got '{other}'"),
                ));
            }
            None => return Err(ConfigError::MissingField(format!("{path}.type"))),
        };
        let mode = match a.mode.as_deref() {
            Some("whitelist") => AccessMode::Whitelist,
            Some("blacklist") => AccessMode::Blacklist,
            Some(other) => {
                return Err(invalid(
                    format!("{path}.mode"),
                    format!("expected 'whitelist' or 'blacklist', got '{other}'"),
                ));
            }
            None => return Err(ConfigError::MissingField(format!("{path}.mode"))),
        };
        access_lists.push(AccessList {
            name: a.name.unwrap_or_else(|| id.clone()),
            id,
            kind,
            mode,
            items: a.items.into_iter().collect(),
        });
    }

    let mut categories = Vec::with_capacity(raw.categories.len());
    let mut category_index = HashMap::new();
    for (i, c) in raw.categories.into_iter().enumerate() {
        let path = format!("categories[{i}]");
        let id = c
            .id
            .ok_or_else(|| ConfigError::MissingField(format!("{path}.id")))?;
        if category_index.insert(id.clone(), i).is_some() {
            return Err(invalid(path, format!("duplicate category id '{id}'")));
        }
        categories.push(Category {
            display_name: c.display_name.unwrap_or_else(|| id.clone()),
            id,
            description: c.description,
            icon: c.icon,
            order: c.order.unwrap_or(0),
            enabled: c.enabled.unwrap_or(true),
            allow_user_switch: c.allow_user_switch.unwrap_or(true),
            is_mutex: c.is_mutex.unwrap_or(false),
            default_command_set: c.default_command_set,
        });
    }

    let mut command_sets = Vec::with_capacity(raw.command_sets.len());
    let mut set_index = HashMap::new();
    for (i, s) in raw.command_sets.into_iter().enumerate() {
        let path = format!("command_sets[{i}]");
        let id = s
            .id
            .ok_or_else(|| ConfigError::MissingField(format!("{path}.id")))?;
        if set_index.insert(id.clone(), i).is_some() {
            return Err(invalid(path, format!("duplicate command set id '{id}'")));
        }
        let is_public = s.is_public.unwrap_or(false);
        if is_public && s.category.is_some() {
            return Err(invalid(
                path,
                "a public command set cannot belong to a category",
            ));
        }
        if let Some(cat) = &s.category {
            if !category_index.contains_key(cat) {
                return Err(invalid(
                    format!("{path}.category"),
                    format!("unknown category '{cat}'"),
                ));
            }
        }
        if let Some(conn) = &s.target_ws {
            if !connection_index.contains_key(conn) {
                return Err(invalid(
                    format!("{path}.target_ws"),
                    format!("unknown connection '{conn}'"),
                ));
            }
        }
        for (field, list_id, want) in [
            ("user_access_list", &s.user_access_list, AccessKind::User),
            ("group_access_list", &s.group_access_list, AccessKind::Group),
        ] {
            if let Some(list_id) = list_id {
                match access_index.get(list_id) {
                    None => {
                        return Err(invalid(
                            format!("{path}.{field}"),
                            format!("unknown access list '{list_id}'"),
                        ));
                    }
                    Some(&ai) if access_lists[ai].kind != want => {
                        return Err(invalid(
                            format!("{path}.{field}"),
                            format!("access list '{list_id}' has the wrong type"),
                        ));
                    }
                    Some(_) => {}
                }
            }
        }

        let mut commands = Vec::with_capacity(s.commands.len());
        for (j, c) in s.commands.into_iter().enumerate() {
            let cpath = format!("{path}.commands[{j}]");
            let name = c
                .name
                .ok_or_else(|| ConfigError::MissingField(format!("{cpath}.name")))?;
            let time_restriction = match c.time_restriction {
                Some(w) => Some(parse_time_window(&cpath, w)?),
                None => None,
            };
            commands.push(Command {
                name,
                aliases: c.aliases,
                description: c.description,
                is_privileged: c.is_privileged.unwrap_or(false),
                time_restriction,
            });
        }
        let match_order = build_match_order(&commands);

        command_sets.push(CommandSet {
            name: s.name.unwrap_or_else(|| id.clone()),
            id,
            prefix: s.prefix.filter(|p| !p.is_empty()),
            category: s.category,
            target_ws: s.target_ws,
            is_public,
            strip_prefix: s.strip_prefix.unwrap_or(true),
            priority: s.priority.unwrap_or(0),
            enabled: s.enabled.unwrap_or(true),
            is_default: s.is_default.unwrap_or(false),
            user_access_list: s.user_access_list,
            group_access_list: s.group_access_list,
            commands,
            match_order,
        });
    }

    // default_command_set must name a member of its own category.
    for (i, cat) in categories.iter().enumerate() {
        if let Some(def) = &cat.default_command_set {
            match set_index.get(def) {
                None => {
                    return Err(invalid(
                        format!("categories[{i}].default_command_set"),
                        format!("unknown command set '{def}'"),
                    ));
                }
                Some(&si) if command_sets[si].category.as_deref() != Some(cat.id.as_str()) => {
                    return Err(invalid(
                        format!("categories[{i}].default_command_set"),
                        format!("command set '{def}' does not belong to category '{}'", cat.id),
                    ));
                }
                Some(_) => {}
            }
        }
    }

    let final_rule = {
        let r = raw.final_rule.unwrap_or(RawFinalRule {
            action: None,
            target_ws: None,
            message: None,
            send_message: None,
        });
        let action = match r.action.as_deref() {
            None | Some("reject") => FinalAction::Reject,
            Some("allow") => FinalAction::Allow,
            Some("forward") => FinalAction::Forward,
            Some(other) => {
                return Err(invalid(
                    "final_rule.action",
                    format!("expected 'reject', 'allow' or 'forward', got '{other}'"),
                ));
            }
        };
        if action == FinalAction::Forward {
            match &r.target_ws {
                None => {
                    return Err(invalid(
                        "final_rule.target_ws",
                        "required when action is 'forward'",
                    ));
                }
                Some(conn) if !connection_index.contains_key(conn) => {
                    return Err(invalid(
                        "final_rule.target_ws",
                        format!("unknown connection '{conn}'"),
                    ));
                }
                Some(_) => {}
            }
        }
        FinalRule {
            action,
            target_ws: r.target_ws,
            message: r.message,
            send_message: r.send_message.unwrap_or(true),
        }
    };

    // Precomputed routing order: descending priority, stable on config order.
    let mut routing_order: Vec<usize> = (0..command_sets.len()).collect();
    routing_order.sort_by_key(|&i| std::cmp::Reverse(command_sets[i].priority));

    let mut category_members: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, set) in command_sets.iter().enumerate() {
        if let Some(cat) = &set.category {
            category_members.entry(cat.clone()).or_default().push(i);
        }
    }

    Ok(Config {
        schema_version,
        listen,
        storage,
        admins: raw.admins.into_iter().collect(),
        categories,
        command_sets,
        access_lists,
        connections,
        final_rule,
        category_index,
        set_index,
        access_index,
        connection_index,
        routing_order,
        category_members,
    })
}

fn build_match_order(commands: &[Command]) -> Vec<(String, usize)> {
    let mut order = Vec::new();
    for (i, cmd) in commands.iter().enumerate() {
        order.push((cmd.name.clone(), i));
        for alias in &cmd.aliases {
            order.push((alias.clone(), i));
        }
    }
    // Longest token first; ties broken lexicographically for determinism.
    order.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    order
}

fn parse_time_window(path: &str, raw: RawTimeWindow) -> Result<TimeWindow, ConfigError> {
    let parse = |field: &str, value: Option<String>| -> Result<NaiveTime, ConfigError> {
        let s = value
            .ok_or_else(|| ConfigError::MissingField(format!("{path}.time_restriction.{field}")))?;
        NaiveTime::parse_from_str(&s, "%H:%M").map_err(|_| {
            invalid(
                format!("{path}.time_restriction.{field}"),
                format!("expected HH:MM, got '{s}'"),
            )
        })
    };
    Ok(TimeWindow {
        start: parse("start", raw.start)?,
        end: parse("end", raw.end)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
