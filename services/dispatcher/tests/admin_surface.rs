//! The admin boundary: dry-run resolution, connection toggles, reload
//! diff-apply, and the stats snapshot.
//!
//! No live backends here: connections point at closed ports with
//! `auto_reconnect = false` so links rest in the disconnected state.

use dispatcher::config::load_config_from_str;
use dispatcher::db::Db;
use dispatcher::dispatcher::Dispatcher;
use dispatcher::router::Decision;
use std::sync::Arc;
use tokio::sync::watch;

const CONFIG: &str = r#"
schema_version = 1

admins = [900]

[[connections]]
id = "c1"
url = "ws://127.0.0.1:1/ws"
auto_reconnect = false

[[connections]]
id = "c2"
url = "ws://127.0.0.1:2/ws"
auto_reconnect = false

[[command_sets]]
id = "A"
name = "bot1"
is_public = true
target_ws = "c1"

  [[command_sets.commands]]
  name = "/info"

  [[command_sets.commands]]
  name = "/admin"
  is_privileged = true

[final_rule]
action = "reject"
message = "未知指令"
send_message = true
"#;

fn build() -> (Arc<Dispatcher>, watch::Sender<bool>) {
    let cfg = load_config_from_str(CONFIG).expect("config");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (dispatcher, _events) = Dispatcher::new(cfg, Db::open_in_memory().expect("db"), shutdown_rx);
    (dispatcher, shutdown_tx)
}

#[tokio::test]
async fn dry_run_resolution_matches_router_semantics() {
    let (dispatcher, _shutdown) = build();
    dispatcher.start().await;

    // Target down (nothing is listening on c1).
    let d = dispatcher.resolve("/info", 1, None).await;
    assert_eq!(
        d,
        Decision::Reply {
            text: "目标连接不可用".to_owned()
        }
    );

    // Unmatched input falls to the final rule.
    let d = dispatcher.resolve("hello there", 1, None).await;
    assert_eq!(
        d,
        Decision::Reply {
            text: "未知指令".to_owned()
        }
    );

    // Config admins are privileged without a user-record flag.
    let d = dispatcher.resolve("/admin", 1, None).await;
    assert_eq!(
        d,
        Decision::Reply {
            text: "该指令需要特权".to_owned()
        }
    );
    let d = dispatcher.resolve("/admin", 900, None).await;
    assert_eq!(
        d,
        Decision::Reply {
            text: "目标连接不可用".to_owned()
        },
        "the admin passes the privilege guard and stops at the dead link"
    );

    // Meta-commands render through the style manager, read-only.
    let d = dispatcher.resolve("/help", 1, None).await;
    match d {
        Decision::Reply { text } => assert!(text.contains("/style"), "got: {text}"),
        other => panic!("expected reply, got {other:?}"),
    }
}

#[tokio::test]
async fn connect_and_disconnect_toggle_known_links_only() {
    let (dispatcher, _shutdown) = build();
    dispatcher.start().await;

    assert!(dispatcher.connect("c1").await);
    assert!(dispatcher.disconnect("c1").await);
    assert!(!dispatcher.connect("missing").await);
    assert!(!dispatcher.disconnect("missing").await);
}

#[tokio::test]
async fn reload_applies_connection_diff_and_swaps_snapshot() {
    let (dispatcher, _shutdown) = build();
    dispatcher.start().await;
    assert_eq!(dispatcher.snapshot_stats().await.connections.total, 2);

    // Drop c2, add c3, and change the final rule.
    let reloaded = r#"
schema_version = 1

[[connections]]
id = "c1"
url = "ws://127.0.0.1:1/ws"
auto_reconnect = false

[[connections]]
id = "c3"
url = "ws://127.0.0.1:3/ws"
auto_reconnect = false

[final_rule]
action = "reject"
message = "重载之后"
send_message = true
"#;
    dispatcher.reload_from_str(reloaded).await.expect("reload");

    let stats = dispatcher.snapshot_stats().await;
    assert_eq!(stats.connections.total, 2);
    assert!(dispatcher.connect("c3").await, "added link exists");
    assert!(!dispatcher.connect("c2").await, "removed link is gone");

    let d = dispatcher.resolve("whatever", 1, None).await;
    assert_eq!(
        d,
        Decision::Reply {
            text: "重载之后".to_owned()
        },
        "the router sees the new snapshot"
    );
}

#[tokio::test]
async fn invalid_reload_keeps_the_old_snapshot() {
    let (dispatcher, _shutdown) = build();
    dispatcher.start().await;

    let err = dispatcher
        .reload_from_str("schema_version = 7")
        .await
        .expect_err("invalid config must be rejected");
    assert!(err.to_string().contains("schema_version"), "got: {err}");

    // The running config is untouched.
    let d = dispatcher.resolve("whatever", 1, None).await;
    assert_eq!(
        d,
        Decision::Reply {
            text: "未知指令".to_owned()
        }
    );
    assert_eq!(dispatcher.snapshot_stats().await.connections.total, 2);
}
