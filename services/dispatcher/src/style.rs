//! Built-in meta-commands: `/help`, `/status`, `/list` and the `/style`
//! family.
//!
//! The style manager holds no state of its own.  It renders replies from the
//! config snapshot, the user record, and the runtime counters, and persists
//! style selections through the user store.  In dry-run mode (`persist =
//! false`, used by the admin resolve endpoint) `/style select` validates and
//! renders its confirmation without writing.

use crate::config::{Category, Config};
use crate::db::UserRecord;
use crate::router::MetaCommand;
use crate::users::UserStore;
use std::fmt::Write as _;

pub struct StyleContext<'a> {
    pub cfg: &'a Config,
    pub users: &'a UserStore,
    pub user: &'a UserRecord,
    /// `(connected, total)` upstream connection counts.
    pub connections: (usize, usize),
    pub messages_today: u64,
    pub persist: bool,
}

pub async fn handle_meta(ctx: StyleContext<'_>, meta: &MetaCommand) -> String {
    match meta {
        MetaCommand::Help => render_help(ctx.cfg),
        MetaCommand::Status => {
            let (connected, total) = ctx.connections;
            format!(
                "连接状态: {connected}/{total}\n今日消息: {}",
                ctx.messages_today
            )
        }
        MetaCommand::List { category: None } => render_categories(ctx.cfg, false),
        MetaCommand::List {
            category: Some(cat),
        } => render_category_sets(ctx.cfg, ctx.user, cat),
        MetaCommand::StyleList => render_categories(ctx.cfg, true),
        MetaCommand::StyleCurrent => render_current(ctx.cfg, ctx.user),
        MetaCommand::StyleSelect { category, set } => select(ctx, category, set).await,
        MetaCommand::StyleUsage => {
            "用法: /style list | current | select <分类> <指令集>".to_owned()
        }
    }
}

fn render_help(cfg: &Config) -> String {
    let mut out = String::from(
        "可用指令:\n\
         /help - 显示本帮助\n\
         /status - 查看运行状态\n\
         /list [分类] - 查看分类与指令集\n\
         /style current - 查看当前风格\n\
         /style select <分类> <指令集> - 切换风格",
    );
    let switchable: Vec<&Category> = cfg
        .categories_in_order()
        .into_iter()
        .filter(|c| c.enabled && c.allow_user_switch)
        .collect();
    if !switchable.is_empty() {
        out.push_str("\n可切换分类: ");
        out.push_str(
            &switchable
                .iter()
                .map(|c| c.id.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        );
    }
    out
}

fn render_categories(cfg: &Config, switchable_only: bool) -> String {
    let cats: Vec<&Category> = cfg
        .categories_in_order()
        .into_iter()
        .filter(|c| c.enabled && (!switchable_only || c.allow_user_switch))
        .collect();
    if cats.is_empty() {
        return "暂无可用分类".to_owned();
    }
    let header = if switchable_only {
        "可切换分类:"
    } else {
        "可用分类:"
    };
    let mut out = String::from(header);
    for cat in cats {
        let _ = write!(out, "\n{} - {}", cat.id, cat.display_name);
    }
    out
}

fn render_category_sets(cfg: &Config, user: &UserRecord, category_id: &str) -> String {
    let Some(cat) = cfg.category(category_id).filter(|c| c.enabled) else {
        return "未知分类".to_owned();
    };
    let current = user
        .selected_styles
        .get(&cat.id)
        .map(String::as_str)
        .or(cat.default_command_set.as_deref());
    let sets: Vec<_> = cfg
        .sets_in_category(&cat.id)
        .filter(|s| s.enabled)
        .collect();
    if sets.is_empty() {
        return format!("{} 下暂无可用指令集", cat.display_name);
    }
    let mut out = format!("{} 的指令集:", cat.display_name);
    for set in sets {
        let marker = if current == Some(set.id.as_str()) {
            " (当前)"
        } else {
            ""
        };
        let _ = write!(out, "\n{} - {}{}", set.id, set.name, marker);
    }
    out
}

fn render_current(cfg: &Config, user: &UserRecord) -> String {
    if user.selected_styles.is_empty() {
        return "尚未选择任何风格".to_owned();
    }
    let mut entries: Vec<(&str, &str)> = user
        .selected_styles
        .iter()
        .map(|(cat, set)| (cat.as_str(), set.as_str()))
        .collect();
    entries.sort_unstable();
    let mut out = String::from("当前风格:");
    for (cat_id, set_id) in entries {
        let cat_name = cfg
            .category(cat_id)
            .map_or(cat_id, |c| c.display_name.as_str());
        let set_name = cfg.command_set(set_id).map_or(set_id, |s| s.name.as_str());
        let _ = write!(out, "\n{cat_name} → {set_name}");
    }
    out
}

async fn select(ctx: StyleContext<'_>, category_id: &str, set_id: &str) -> String {
    let Some(cat) = ctx.cfg.category(category_id).filter(|c| c.enabled) else {
        return "未知分类".to_owned();
    };
    if !cat.allow_user_switch {
        return "该分类不允许切换".to_owned();
    }
    let Some(set) = ctx
        .cfg
        .command_set(set_id)
        .filter(|s| s.enabled && s.category.as_deref() == Some(cat.id.as_str()))
    else {
        return "指令集不存在或未启用".to_owned();
    };
    if ctx.persist {
        if let Err(e) = ctx.users.select_style(ctx.user.qq_id, &cat.id, &set.id).await {
            tracing::error!(qq_id = ctx.user.qq_id, error = %e, "style selection not persisted");
            return "保存失败，请稍后再试".to_owned();
        }
    }
    format!("已切换 {} 为 {}", cat.display_name, set.name)
}
