//! Supervised upstream WebSocket clients.
//!
//! One supervisor task per configured connection.  The supervisor reconciles
//! toward a desired-state flag: administrative `connect`/`disconnect` only
//! flip the flag, the supervisor does the dialing, and session failures feed
//! an exponential back-off that is capped and reset on success.
//!
//! Outbound frames go through a bounded queue per connection.  The queue is
//! preserved across reconnects for a grace period; frames still queued after
//! that are dropped (the send contract is fire-and-fail-fast, never block).

use crate::config::Connection as ConnectionConfig;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

pub const WRITE_DEADLINE: Duration = Duration::from_secs(5);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// How long the outbound queue survives a disconnect before being drained.
const QUEUE_GRACE: Duration = Duration::from_secs(30);
const OUTBOUND_QUEUE: usize = 256;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Dialing,
    Connected,
}

/// Events delivered from the pool to the dispatcher.
#[derive(Debug)]
pub enum UpstreamEvent {
    /// A parsed JSON frame received from an upstream.
    Frame {
        conn_id: String,
        frame: serde_json::Value,
    },
    /// A connectivity transition (used for logging and stats).
    StateChanged { conn_id: String, state: LinkState },
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection '{0}' unavailable")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

struct Link {
    cfg: Arc<RwLock<ConnectionConfig>>,
    desired: watch::Sender<bool>,
    out_tx: mpsc::Sender<String>,
    state: Arc<RwLock<LinkState>>,
    task: tokio::task::JoinHandle<()>,
}

pub struct UpstreamPool {
    links: RwLock<HashMap<String, Link>>,
    event_tx: mpsc::Sender<UpstreamEvent>,
    shutdown: watch::Receiver<bool>,
}

impl UpstreamPool {
    pub fn new(event_tx: mpsc::Sender<UpstreamEvent>, shutdown: watch::Receiver<bool>) -> Self {
        UpstreamPool {
            links: RwLock::new(HashMap::new()),
            event_tx,
            shutdown,
        }
    }

    /// Register a connection and start its supervisor.  The link starts in
    /// the connecting-desired state only when `auto_reconnect` is set;
    /// otherwise it waits for an administrative `connect`.
    pub async fn insert(&self, cfg: ConnectionConfig) {
        let mut links = self.links.write().await;
        self.insert_locked(&mut links, cfg.auto_reconnect, cfg);
    }

    fn insert_locked(
        &self,
        links: &mut HashMap<String, Link>,
        desired: bool,
        cfg: ConnectionConfig,
    ) {
        let conn_id = cfg.id.clone();
        let (desired_tx, desired_rx) = watch::channel(desired);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let state = Arc::new(RwLock::new(LinkState::Disconnected));
        let shared_cfg = Arc::new(RwLock::new(cfg));
        let task = tokio::spawn(supervise(
            conn_id.clone(),
            Arc::clone(&shared_cfg),
            Arc::clone(&state),
            desired_tx.clone(),
            desired_rx,
            out_rx,
            self.event_tx.clone(),
            self.shutdown.clone(),
        ));
        links.insert(
            conn_id,
            Link {
                cfg: shared_cfg,
                desired: desired_tx,
                out_tx,
                state,
                task,
            },
        );
    }

    pub async fn remove(&self, conn_id: &str) -> bool {
        let mut links = self.links.write().await;
        match links.remove(conn_id) {
            Some(link) => {
                let _ = link.desired.send(false);
                link.task.abort();
                info!(conn_id, "upstream connection removed");
                true
            }
            None => false,
        }
    }

    /// Flip the desired state to connected.  Returns false for unknown ids.
    pub async fn connect(&self, conn_id: &str) -> bool {
        let links = self.links.read().await;
        match links.get(conn_id) {
            Some(link) => {
                let _ = link.desired.send(true);
                true
            }
            None => false,
        }
    }

    /// Flip the desired state to disconnected.  Returns false for unknown ids.
    pub async fn disconnect(&self, conn_id: &str) -> bool {
        let links = self.links.read().await;
        match links.get(conn_id) {
            Some(link) => {
                let _ = link.desired.send(false);
                true
            }
            None => false,
        }
    }

    /// Enqueue a frame for an upstream.  Fails fast when the connection is
    /// unknown, administratively disconnected, or its queue is full.
    pub async fn send(&self, conn_id: &str, frame: String) -> Result<(), SendError> {
        let links = self.links.read().await;
        let link = links
            .get(conn_id)
            .ok_or_else(|| SendError::Unavailable(conn_id.to_owned()))?;
        if !*link.desired.borrow() {
            return Err(SendError::Unavailable(conn_id.to_owned()));
        }
        link.out_tx
            .try_send(frame)
            .map_err(|_| SendError::Unavailable(conn_id.to_owned()))
    }

    pub async fn connected_ids(&self) -> HashSet<String> {
        let links = self.links.read().await;
        let mut ids = HashSet::new();
        for (id, link) in links.iter() {
            if *link.state.read().await == LinkState::Connected {
                ids.insert(id.clone());
            }
        }
        ids
    }

    /// Connections whose config allows transparent forwarding.
    pub async fn forward_ids(&self) -> Vec<String> {
        let links = self.links.read().await;
        let mut ids = Vec::new();
        for (id, link) in links.iter() {
            if link.cfg.read().await.allow_forward {
                ids.push(id.clone());
            }
        }
        ids.sort();
        ids
    }

    /// `(connected, total)` counts for `/status` and stats.
    pub async fn counts(&self) -> (usize, usize) {
        let links = self.links.read().await;
        let total = links.len();
        let mut connected = 0;
        for link in links.values() {
            if *link.state.read().await == LinkState::Connected {
                connected += 1;
            }
        }
        (connected, total)
    }

    /// Diff-apply a new connection list: open added links, tear down removed
    /// ones, reconnect links whose `url` or `token` changed, and update the
    /// shared config of links that changed in other ways only.
    pub async fn apply(&self, new_configs: &[ConnectionConfig]) {
        let mut links = self.links.write().await;

        let new_ids: HashSet<&str> = new_configs.iter().map(|c| c.id.as_str()).collect();
        let removed: Vec<String> = links
            .keys()
            .filter(|id| !new_ids.contains(id.as_str()))
            .cloned()
            .collect();
        for id in removed {
            if let Some(link) = links.remove(&id) {
                let _ = link.desired.send(false);
                link.task.abort();
                info!(conn_id = %id, "upstream connection removed on reload");
            }
        }

        for nc in new_configs {
            let recreate_desired = match links.get(&nc.id) {
                None => {
                    info!(conn_id = %nc.id, "upstream connection added on reload");
                    self.insert_locked(&mut links, nc.auto_reconnect, nc.clone());
                    continue;
                }
                Some(link) => {
                    let old = link.cfg.read().await.clone();
                    if old == *nc {
                        continue;
                    }
                    if old.url == nc.url && old.token == nc.token {
                        *link.cfg.write().await = nc.clone();
                        continue;
                    }
                    *link.desired.borrow()
                }
            };
            if let Some(link) = links.remove(&nc.id) {
                let _ = link.desired.send(false);
                link.task.abort();
            }
            info!(conn_id = %nc.id, "endpoint changed, reconnecting");
            self.insert_locked(&mut links, recreate_desired, nc.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn supervise(
    conn_id: String,
    cfg: Arc<RwLock<ConnectionConfig>>,
    state: Arc<RwLock<LinkState>>,
    desired_tx: watch::Sender<bool>,
    mut desired_rx: watch::Receiver<bool>,
    mut out_rx: mpsc::Receiver<String>,
    event_tx: mpsc::Sender<UpstreamEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff: Option<Duration> = None;
    let mut disconnected_since = Instant::now();
    loop {
        if *shutdown.borrow() {
            return;
        }

        // Reconcile: idle until the desired state asks for a connection.
        if !*desired_rx.borrow() {
            tokio::select! {
                r = desired_rx.changed() => { if r.is_err() { return; } }
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
            drain_stale_queue(&conn_id, &mut out_rx, disconnected_since);
            backoff = None;
            continue;
        }

        let (url, token, base_interval) = {
            let c = cfg.read().await;
            (
                c.url.clone(),
                c.token.clone(),
                Duration::from_secs(c.reconnect_interval_s),
            )
        };

        set_state(&state, &event_tx, &conn_id, LinkState::Dialing).await;
        let dialed = tokio::time::timeout(DIAL_TIMEOUT, dial(&url, token.as_deref())).await;
        match dialed {
            Ok(Ok(ws)) => {
                backoff = None;
                info!(conn_id = %conn_id, url = %url, "upstream connected");
                set_state(&state, &event_tx, &conn_id, LinkState::Connected).await;
                let reason = run_link(
                    ws,
                    &conn_id,
                    &mut out_rx,
                    &mut desired_rx,
                    &mut shutdown,
                    &event_tx,
                )
                .await;
                info!(conn_id = %conn_id, reason, "upstream session ended");
                set_state(&state, &event_tx, &conn_id, LinkState::Disconnected).await;
                disconnected_since = Instant::now();
            }
            Ok(Err(e)) => {
                warn!(conn_id = %conn_id, url = %url, error = %e, "dial failed");
                set_state(&state, &event_tx, &conn_id, LinkState::Disconnected).await;
            }
            Err(_) => {
                warn!(conn_id = %conn_id, url = %url, "dial timed out");
                set_state(&state, &event_tx, &conn_id, LinkState::Disconnected).await;
            }
        }

        if *shutdown.borrow() {
            return;
        }
        let auto_reconnect = cfg.read().await.auto_reconnect;
        if !auto_reconnect {
            // Without auto-reconnect the link goes back to rest until the
            // next administrative connect.
            let _ = desired_tx.send(false);
            continue;
        }
        if !*desired_rx.borrow() {
            continue;
        }

        // Exponential back-off: base, 2x, 4x ... capped, reset on success.
        let delay = match backoff {
            None => base_interval,
            Some(prev) => (prev * 2).min(MAX_BACKOFF),
        };
        backoff = Some(delay);
        debug!(conn_id = %conn_id, delay_s = delay.as_secs(), "reconnect back-off");
        let wake = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => break,
                r = desired_rx.changed() => { if r.is_err() || !*desired_rx.borrow() { break; } }
                _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
            }
            drain_stale_queue(&conn_id, &mut out_rx, disconnected_since);
        }
        drain_stale_queue(&conn_id, &mut out_rx, disconnected_since);
    }
}

async fn set_state(
    state: &Arc<RwLock<LinkState>>,
    event_tx: &mpsc::Sender<UpstreamEvent>,
    conn_id: &str,
    new: LinkState,
) {
    {
        let mut s = state.write().await;
        if *s == new {
            return;
        }
        *s = new;
    }
    let _ = event_tx
        .send(UpstreamEvent::StateChanged {
            conn_id: conn_id.to_owned(),
            state: new,
        })
        .await;
}

fn drain_stale_queue(conn_id: &str, out_rx: &mut mpsc::Receiver<String>, since: Instant) {
    if since.elapsed() < QUEUE_GRACE {
        return;
    }
    let mut dropped = 0usize;
    while out_rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        warn!(conn_id, dropped, "outbound frames expired while disconnected");
    }
}

/// One connected session: writer drains the outbound queue in order, reader
/// hands frames to the dispatcher, keep-alive pings police the link.
async fn run_link(
    mut ws: WsStream,
    conn_id: &str,
    out_rx: &mut mpsc::Receiver<String>,
    desired_rx: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
    event_tx: &mpsc::Sender<UpstreamEvent>,
) -> &'static str {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;
    let mut last_rx = Instant::now();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = ws.close(None).await;
                    return "shutdown";
                }
            }
            r = desired_rx.changed() => {
                if r.is_err() || !*desired_rx.borrow() {
                    let _ = ws.close(None).await;
                    return "disconnect requested";
                }
            }
            frame = out_rx.recv() => {
                let Some(json) = frame else { return "queue closed"; };
                match tokio::time::timeout(WRITE_DEADLINE, ws.send(Message::Text(json.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(conn_id, error = %e, "write failed");
                        return "write failed";
                    }
                    Err(_) => {
                        warn!(conn_id, "write deadline exceeded");
                        return "write deadline";
                    }
                }
            }
            msg = ws.next() => {
                match msg {
                    None => return "closed by peer",
                    Some(Err(e)) => {
                        warn!(conn_id, error = %e, "WS error");
                        return "ws error";
                    }
                    Some(Ok(Message::Text(t))) => {
                        last_rx = Instant::now();
                        match serde_json::from_str::<serde_json::Value>(&t) {
                            Ok(frame) => {
                                let _ = event_tx
                                    .send(UpstreamEvent::Frame {
                                        conn_id: conn_id.to_owned(),
                                        frame,
                                    })
                                    .await;
                            }
                            Err(e) => {
                                // Malformed frame: drop it, keep the session.
                                warn!(conn_id, error = %e, "malformed frame from upstream");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_rx = Instant::now();
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_rx = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => return "closed by peer",
                    Some(Ok(_)) => {
                        last_rx = Instant::now();
                    }
                }
            }
            _ = ping.tick() => {
                if last_rx.elapsed() >= KEEPALIVE_TIMEOUT {
                    let _ = ws.close(None).await;
                    return "keep-alive timeout";
                }
                if ws.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return "ping failed";
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dial
// ---------------------------------------------------------------------------

/// Open the WebSocket, attaching `Authorization: Bearer <token>` when a
/// token is configured.  Delegates to `IntoClientRequest` so the upgrade
/// headers are populated before the auth header is injected.
pub async fn dial(
    url: &str,
    token: Option<&str>,
) -> Result<WsStream, Box<tokio_tungstenite::tungstenite::Error>> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::header;

    let mut request = url.into_client_request().map_err(Box::new)?;
    if let Some(token) = token {
        let value = header::HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
            Box::new(tokio_tungstenite::tungstenite::Error::Http(
                Box::new(tokio_tungstenite::tungstenite::http::Response::new(Some(
                    e.to_string().into(),
                ))),
            ))
        })?;
        request.headers_mut().insert(header::AUTHORIZATION, value);
    }
    let (ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(Box::new)?;
    Ok(ws)
}
