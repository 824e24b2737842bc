//! The dispatcher glue layer.
//!
//! Owns the upstream pool, the frontend session registry, the correlation
//! table, and the config snapshot; runs the router on every inbound message
//! event and executes the resulting decision.  Also carries the admin
//! surface consumed by the external management layer: dry-run resolution,
//! connect/disconnect, config reload, and stats.

use crate::config::{Config, ConfigError};
use crate::correlation::{CorrelationTable, DEFAULT_TTL, Origin};
use crate::db::Db;
use crate::frontend::FrontendHandle;
use crate::router::{self, Decision, RouteOutcome, RouteRequest};
use crate::style::{self, StyleContext};
use crate::upstream::{LinkState, UpstreamEvent, UpstreamPool};
use crate::users::UserStore;
use chrono::{Local, NaiveDate};
use ob_protocol::{FrameKind, MessageEvent};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tracing::{debug, info, warn};

const UPSTREAM_EVENT_QUEUE: usize = 1024;

// ---------------------------------------------------------------------------
// Traffic counter
// ---------------------------------------------------------------------------

/// Message-event counter for the current local day.
struct TrafficStats {
    inner: Mutex<(NaiveDate, u64)>,
}

impl TrafficStats {
    fn new(today: NaiveDate) -> Self {
        TrafficStats {
            inner: Mutex::new((today, 0)),
        }
    }

    async fn record(&self, today: NaiveDate) {
        let mut inner = self.inner.lock().await;
        if inner.0 != today {
            *inner = (today, 0);
        }
        inner.1 += 1;
    }

    async fn today(&self, today: NaiveDate) -> u64 {
        let inner = self.inner.lock().await;
        if inner.0 == today { inner.1 } else { 0 }
    }
}

// ---------------------------------------------------------------------------
// Stats snapshot (admin boundary)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotStats {
    pub connections: ConnectionStats,
    pub messages: MessageStats,
    pub correlation: CorrelationStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total: usize,
    pub connected: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageStats {
    pub today: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorrelationStats {
    pub in_flight: usize,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    config: RwLock<Arc<Config>>,
    users: UserStore,
    pool: UpstreamPool,
    correlation: Arc<CorrelationTable>,
    frontends: RwLock<HashMap<String, Arc<FrontendHandle>>>,
    stats: TrafficStats,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    /// Build the dispatcher.  The returned receiver carries upstream events;
    /// the caller spawns [`Dispatcher::run_upstream_events`] with it.
    pub fn new(
        cfg: Config,
        db: Db,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, mpsc::Receiver<UpstreamEvent>) {
        let (event_tx, event_rx) = mpsc::channel(UPSTREAM_EVENT_QUEUE);
        let dispatcher = Arc::new(Dispatcher {
            config: RwLock::new(Arc::new(cfg)),
            users: UserStore::new(db),
            pool: UpstreamPool::new(event_tx, shutdown.clone()),
            correlation: Arc::new(CorrelationTable::new(DEFAULT_TTL)),
            frontends: RwLock::new(HashMap::new()),
            stats: TrafficStats::new(Local::now().date_naive()),
            shutdown,
        });
        (dispatcher, event_rx)
    }

    /// Open the configured upstream connections.
    pub async fn start(&self) {
        let cfg = self.config_snapshot().await;
        for conn in &cfg.connections {
            self.pool.insert(conn.clone()).await;
        }
    }

    pub async fn config_snapshot(&self) -> Arc<Config> {
        Arc::clone(&*self.config.read().await)
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    pub fn correlation(&self) -> Arc<CorrelationTable> {
        Arc::clone(&self.correlation)
    }

    // -----------------------------------------------------------------------
    // Frontend session registry
    // -----------------------------------------------------------------------

    pub async fn register_frontend(&self, handle: Arc<FrontendHandle>) {
        self.frontends
            .write()
            .await
            .insert(handle.session_id.clone(), handle);
    }

    /// Unregister a closed session and mark its in-flight calls dead.
    pub async fn unregister_frontend(&self, session_id: &str) {
        self.frontends.write().await.remove(session_id);
        self.correlation.mark_frontend_gone(session_id).await;
    }

    async fn broadcast_to_frontends(&self, json: &str) {
        let frontends = self.frontends.read().await;
        for handle in frontends.values() {
            let _ = handle.send(json.to_owned());
        }
    }

    // -----------------------------------------------------------------------
    // Frontend -> upstream direction
    // -----------------------------------------------------------------------

    /// Handle one raw frame from a frontend session.
    pub async fn handle_frontend_frame(&self, handle: &Arc<FrontendHandle>, raw: &str) {
        let frame: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(session_id = %handle.session_id, error = %e, "malformed frame from frontend");
                return;
            }
        };
        match ob_protocol::classify(&frame) {
            FrameKind::MessageEvent => self.handle_message_event(handle, frame).await,
            FrameKind::ApiCall => {
                let mut frame = frame;
                let echo = match ob_protocol::echo_of(&frame) {
                    Some(echo) => echo,
                    None => {
                        let echo = ob_protocol::generate_echo();
                        ob_protocol::set_echo(&mut frame, &echo);
                        echo
                    }
                };
                self.correlation
                    .insert(&echo, Origin::Frontend(handle.session_id.clone()))
                    .await;
                self.forward_to_upstreams(&frame.to_string()).await;
            }
            FrameKind::ApiResponse => {
                // A response from the frontend answers an upstream-originated
                // call; route it back to that upstream when known.
                let origin = match ob_protocol::echo_of(&frame) {
                    Some(echo) => self.correlation.take(&echo).await,
                    None => None,
                };
                match origin {
                    Some(Origin::Upstream(conn_id)) => {
                        if let Err(e) = self.pool.send(&conn_id, frame.to_string()).await {
                            debug!(error = %e, "response dropped, upstream unavailable");
                        }
                    }
                    Some(Origin::Synthetic) => {
                        debug!(session_id = %handle.session_id, "synthesized-call response swallowed");
                    }
                    Some(Origin::Frontend(_)) | None => {
                        self.forward_to_upstreams(&frame.to_string()).await;
                    }
                }
            }
            FrameKind::MetaEvent | FrameKind::Other => {
                self.forward_to_upstreams(raw).await;
            }
        }
    }

    async fn handle_message_event(&self, handle: &Arc<FrontendHandle>, frame: Value) {
        let today = Local::now().date_naive();
        self.stats.record(today).await;

        let event = match MessageEvent::parse(&frame) {
            Ok(event) => event,
            Err(e) => {
                warn!(session_id = %handle.session_id, error = %e, "unroutable message event");
                return;
            }
        };
        if let Some(nickname) = &event.nickname {
            self.users.note_nickname(event.user_id, nickname).await;
        }

        let cfg = self.config_snapshot().await;
        let user = self.users.get_or_create(event.user_id).await;
        let request = RouteRequest {
            text: &event.text,
            sender_id: event.user_id,
            group_id: event.group_id,
            is_privileged: user.is_privileged || cfg.admins.contains(&event.user_id),
        };
        let connected = self.pool.connected_ids().await;
        let outcome = router::resolve(&cfg, &user, &connected, Local::now().time(), &request);

        let decision = match outcome {
            RouteOutcome::Meta(meta) => {
                let text = style::handle_meta(
                    StyleContext {
                        cfg: &cfg,
                        users: &self.users,
                        user: &user,
                        connections: self.pool.counts().await,
                        messages_today: self.stats.today(today).await,
                        persist: true,
                    },
                    &meta,
                )
                .await;
                Decision::Reply { text }
            }
            RouteOutcome::Decision(decision) => decision,
        };

        match decision {
            Decision::Forward {
                connection_id,
                text,
            } => {
                let mut payload = frame;
                if let Some(text) = &text {
                    ob_protocol::set_message_text(&mut payload, text);
                }
                if let Err(e) = self.pool.send(&connection_id, payload.to_string()).await {
                    // The router saw the link up, but it went away since.
                    debug!(error = %e, "forward failed after resolution");
                    self.reply_to(handle, &event, router::REPLY_TARGET_DOWN).await;
                }
            }
            Decision::Reply { text } => {
                self.reply_to(handle, &event, &text).await;
            }
            Decision::Drop => {}
        }
    }

    /// Synthesize a text reply to `event` on its originating session.  The
    /// generated echo is recorded as synthetic so the frontend's response to
    /// our own call is swallowed instead of forwarded.
    async fn reply_to(&self, handle: &Arc<FrontendHandle>, event: &MessageEvent, text: &str) {
        let (frame, echo) = ob_protocol::reply_frame(event, text);
        self.correlation.insert(&echo, Origin::Synthetic).await;
        let _ = handle.send(frame.to_string());
    }

    /// Fan a frame out to every upstream connection with `allow_forward`.
    async fn forward_to_upstreams(&self, json: &str) {
        for conn_id in self.pool.forward_ids().await {
            if let Err(e) = self.pool.send(&conn_id, json.to_owned()).await {
                debug!(error = %e, "transparent forward skipped");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Upstream -> frontend direction
    // -----------------------------------------------------------------------

    /// Drain the upstream event channel until the pool shuts down.
    pub async fn run_upstream_events(self: Arc<Self>, mut events: mpsc::Receiver<UpstreamEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                UpstreamEvent::StateChanged { conn_id, state } => {
                    if state == LinkState::Connected {
                        info!(conn_id = %conn_id, "upstream available");
                    } else {
                        debug!(conn_id = %conn_id, ?state, "upstream state changed");
                    }
                }
                UpstreamEvent::Frame { conn_id, frame } => {
                    self.handle_upstream_frame(&conn_id, frame).await;
                }
            }
        }
    }

    async fn handle_upstream_frame(&self, conn_id: &str, frame: Value) {
        match ob_protocol::classify(&frame) {
            FrameKind::ApiResponse => {
                let origin = match ob_protocol::echo_of(&frame) {
                    Some(echo) => self.correlation.take(&echo).await,
                    None => None,
                };
                match origin {
                    Some(Origin::Frontend(session_id)) => {
                        let frontends = self.frontends.read().await;
                        match frontends.get(&session_id) {
                            Some(handle) => {
                                let _ = handle.send(frame.to_string());
                            }
                            None => {
                                debug!(session_id = %session_id, "response dropped, caller gone");
                            }
                        }
                    }
                    Some(Origin::Synthetic) => {
                        debug!(conn_id, "synthesized-call response swallowed");
                    }
                    Some(Origin::Upstream(_)) | None => {
                        // Unknown or expired echo: best-effort contract, drop.
                        debug!(conn_id, "response without live correlation entry dropped");
                    }
                }
            }
            FrameKind::ApiCall => {
                let mut frame = frame;
                let echo = match ob_protocol::echo_of(&frame) {
                    Some(echo) => echo,
                    None => {
                        let echo = ob_protocol::generate_echo();
                        ob_protocol::set_echo(&mut frame, &echo);
                        echo
                    }
                };
                self.correlation
                    .insert(&echo, Origin::Upstream(conn_id.to_owned()))
                    .await;
                self.broadcast_to_frontends(&frame.to_string()).await;
            }
            _ => {
                self.broadcast_to_frontends(&frame.to_string()).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Admin surface
    // -----------------------------------------------------------------------

    /// Dry-run resolution for the management layer.  Never writes: style
    /// selection validates and renders without persisting.
    pub async fn resolve(&self, text: &str, sender_id: i64, group_id: Option<i64>) -> Decision {
        let cfg = self.config_snapshot().await;
        let user = self.users.get_or_create(sender_id).await;
        let request = RouteRequest {
            text,
            sender_id,
            group_id,
            is_privileged: user.is_privileged || cfg.admins.contains(&sender_id),
        };
        let connected = self.pool.connected_ids().await;
        match router::resolve(&cfg, &user, &connected, Local::now().time(), &request) {
            RouteOutcome::Decision(decision) => decision,
            RouteOutcome::Meta(meta) => {
                let today = Local::now().date_naive();
                let text = style::handle_meta(
                    StyleContext {
                        cfg: &cfg,
                        users: &self.users,
                        user: &user,
                        connections: self.pool.counts().await,
                        messages_today: self.stats.today(today).await,
                        persist: false,
                    },
                    &meta,
                )
                .await;
                Decision::Reply { text }
            }
        }
    }

    pub async fn connect(&self, conn_id: &str) -> bool {
        self.pool.connect(conn_id).await
    }

    pub async fn disconnect(&self, conn_id: &str) -> bool {
        self.pool.disconnect(conn_id).await
    }

    /// Diff-apply a validated config: connection changes go to the pool, the
    /// router-relevant parts swap in as a fresh snapshot.  In-flight
    /// decisions keep the snapshot they started with.
    pub async fn reload_config(&self, new: Config) {
        self.pool.apply(&new.connections).await;
        *self.config.write().await = Arc::new(new);
        info!("config reloaded");
    }

    /// Parse-and-reload convenience; an invalid config leaves the running
    /// snapshot untouched.
    pub async fn reload_from_str(&self, toml_str: &str) -> Result<(), ConfigError> {
        let new = crate::config::load_config_from_str(toml_str)?;
        self.reload_config(new).await;
        Ok(())
    }

    pub async fn snapshot_stats(&self) -> SnapshotStats {
        let (connected, total) = self.pool.counts().await;
        SnapshotStats {
            connections: ConnectionStats { total, connected },
            messages: MessageStats {
                today: self.stats.today(Local::now().date_naive()).await,
            },
            correlation: CorrelationStats {
                in_flight: self.correlation.in_flight().await,
            },
        }
    }
}
