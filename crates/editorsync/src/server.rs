//! Editor-facing transport endpoint.
//!
//! One TCP port serves both variants: a WebSocket upgraded from HTTP for
//! editors that can stream, and a CORS-enabled long-poll fallback
//! (`/connect`, `/send`, `/poll`, `/disconnect`) with per-client queues.
//! Both carry the same tagged messages. At most one editor is active at a
//! time; a newer connection closes out whatever came before it.

mod poll;
mod socket;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use crate::error::{Result, SyncError};
use crate::protocol::Outgoing;
use crate::reconciler::Event;

pub(crate) struct EndpointState {
    inbound_tx: mpsc::UnboundedSender<Event>,
    /// Message queued for every newly connected editor: a snapshot request
    /// in daemon mode, a push-config request in push mode, nothing in build
    /// mode.
    greeting: Option<Outgoing>,
    /// Bumped on every connection; older connections are dead.
    generation: AtomicU64,
    socket: Mutex<Option<socket::SocketClient>>,
    poll_clients: Mutex<HashMap<String, poll::PollClient>>,
    /// Wakes parked long-polls when something lands in a queue.
    wake: watch::Sender<()>,
    /// Flips true on the first editor connection of either variant.
    connected: watch::Sender<bool>,
}

impl EndpointState {
    fn next_generation(&self) -> u64 {
        // send_replace updates the value even with no subscriber yet, so a
        // later wait_for_client still observes the connection.
        self.connected.send_replace(true);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drops every live connection (both variants).
    async fn disconnect_all(&self) {
        self.next_generation();
        self.socket.lock().await.take();
        self.poll_clients.lock().await.clear();
        self.wake.send_replace(());
    }
}

/// The daemon's handle for talking back to the editor.
#[derive(Clone)]
pub struct OutboundSender {
    state: Arc<EndpointState>,
}

impl OutboundSender {
    /// Delivers a message over both transport variants: the active socket
    /// (if any) and every poll queue.
    pub async fn send(&self, message: &Outgoing) {
        if let Some(client) = self.state.socket.lock().await.as_ref() {
            client.send(message);
        }
        let mut clients = self.state.poll_clients.lock().await;
        for client in clients.values_mut() {
            client.enqueue(message.clone());
        }
        drop(clients);
        self.state.wake.send_replace(());
    }

    pub async fn disconnect_all(&self) {
        self.state.disconnect_all().await;
    }
}

pub struct Endpoint {
    state: Arc<EndpointState>,
    serve_task: JoinHandle<()>,
    reaper_task: JoinHandle<()>,
    pub local_addr: SocketAddr,
}

impl Endpoint {
    /// Binds the listener and starts serving both variants.
    ///
    /// A bind failure is fatal at startup, so this is the one transport
    /// error that propagates instead of being logged.
    pub async fn bind(
        port: u16,
        greeting: Option<Outgoing>,
        inbound_tx: mpsc::UnboundedSender<Event>,
    ) -> Result<Self> {
        let (wake, _) = watch::channel(());
        let (connected, _) = watch::channel(false);
        let state = Arc::new(EndpointState {
            inbound_tx,
            greeting,
            generation: AtomicU64::new(0),
            socket: Mutex::new(None),
            poll_clients: Mutex::new(HashMap::new()),
            wake,
            connected,
        });

        let app = Router::new()
            .route("/", get(socket::ws_handler))
            .route("/connect", post(poll::connect))
            .route("/send", post(poll::send))
            .route("/poll", get(poll::poll))
            .route("/disconnect", post(poll::disconnect))
            .route("/health", get(health))
            .with_state(state.clone())
            .layer(CorsLayer::permissive());

        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|error| SyncError::Transport(format!("failed to bind port {port}: {error}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|error| SyncError::Transport(error.to_string()))?;

        let serve_task = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app).await {
                tracing::error!(%error, "transport endpoint stopped");
            }
        });
        let reaper_task = tokio::spawn(poll::reap_stale_clients(state.clone()));

        tracing::info!(%local_addr, "listening for editor connections");
        Ok(Self {
            state,
            serve_task,
            reaper_task,
            local_addr,
        })
    }

    pub fn outbound(&self) -> OutboundSender {
        OutboundSender {
            state: self.state.clone(),
        }
    }

    /// Waits until an editor connects over either variant.
    pub async fn wait_for_client(&self) {
        let mut rx = self.state.connected.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn shutdown(self) {
        self.state.disconnect_all().await;
        self.serve_task.abort();
        self.reaper_task.abort();
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
