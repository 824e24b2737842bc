//! Inbound WebSocket server for chat frontends.
//!
//! Each accepted session gets a uuid, a bounded outbound queue, and a close
//! signal.  The session loop reads one frame at a time and hands it to the
//! dispatcher before reading the next, so frames from one frontend are
//! always processed in order.  A full outbound queue closes the session:
//! a frontend that stops draining its socket must not pin dispatcher memory.

use crate::dispatcher::Dispatcher;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

const OUTBOUND_QUEUE: usize = 256;
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Session handle
// ---------------------------------------------------------------------------

/// What the dispatcher holds for one connected frontend.
pub struct FrontendHandle {
    pub session_id: String,
    out_tx: mpsc::Sender<String>,
    close_tx: watch::Sender<bool>,
}

impl FrontendHandle {
    /// Enqueue a frame for this session.  On overflow the session is closed
    /// (write backlog) and the frame is dropped.
    pub fn send(&self, frame: String) -> bool {
        match self.out_tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session_id = %self.session_id, "write backlog, closing session");
                let _ = self.close_tx.send(true);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .with_state(dispatcher)
}

/// Serve frontend sessions on `listener` until shutdown flips.
pub async fn serve(
    listener: tokio::net::TcpListener,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = router(dispatcher);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown.borrow() {
                    return;
                }
                if shutdown.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(dispatcher): State<Arc<Dispatcher>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, dispatcher))
}

async fn handle_socket(mut socket: WebSocket, dispatcher: Arc<Dispatcher>) {
    let session_id = Uuid::new_v4().to_string();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let (close_tx, mut close_rx) = watch::channel(false);
    let handle = Arc::new(FrontendHandle {
        session_id: session_id.clone(),
        out_tx,
        close_tx,
    });
    dispatcher.register_frontend(Arc::clone(&handle)).await;
    info!(session_id = %session_id, "frontend connected");

    let mut shutdown = dispatcher.shutdown_signal();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = close_rx.changed() => {
                if *close_rx.borrow() {
                    break;
                }
            }
            frame = out_rx.recv() => {
                let Some(json) = frame else { break; };
                match tokio::time::timeout(WRITE_DEADLINE, socket.send(Message::Text(json.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(session_id = %session_id, error = %e, "write failed");
                        break;
                    }
                    Err(_) => {
                        warn!(session_id = %session_id, "write deadline exceeded");
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    None => break,
                    Some(Err(e)) => {
                        warn!(session_id = %session_id, error = %e, "WS error");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        // One frame at a time: the next read waits until the
                        // dispatcher is done with this one.
                        dispatcher.handle_frontend_frame(&handle, &text).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    dispatcher.unregister_frontend(&session_id).await;
    info!(session_id = %session_id, "frontend disconnected");
}
