//! Long-poll transport variant, for editors that cannot hold a socket open.
//!
//! Each client gets a message queue drained on `/poll`; a watch channel
//! wakes parked polls as soon as something is queued. Clients that stop
//! polling are reaped after a stale window and must reconnect with a fresh
//! identifier.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::protocol::{Incoming, Outgoing};
use crate::reconciler::Event;
use crate::server::EndpointState;

/// How long a poll parks before returning an empty batch.
const POLL_WAIT: Duration = Duration::from_secs(15);
/// Clients silent for this long are dropped.
const STALE_CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
const REAP_INTERVAL: Duration = Duration::from_secs(30);

pub(crate) struct PollClient {
    queue: VecDeque<Outgoing>,
    last_poll: Instant,
}

impl PollClient {
    pub fn enqueue(&mut self, message: Outgoing) {
        self.queue.push_back(message);
    }
}

#[derive(Deserialize)]
pub(crate) struct PollParams {
    #[serde(rename = "clientId")]
    client_id: String,
}

pub(crate) async fn connect(
    State(state): State<Arc<EndpointState>>,
) -> Json<serde_json::Value> {
    let client_id = Uuid::new_v4().simple().to_string();
    state.next_generation();

    // Single editor at a time: a fresh connect supersedes both variants.
    state.socket.lock().await.take();
    let mut clients = state.poll_clients.lock().await;
    if !clients.is_empty() {
        tracing::info!("editor reconnected over poll; dropping previous clients");
        clients.clear();
    }
    let mut queue = VecDeque::new();
    if let Some(greeting) = &state.greeting {
        queue.push_back(greeting.clone());
    }
    clients.insert(
        client_id.clone(),
        PollClient {
            queue,
            last_poll: Instant::now(),
        },
    );
    drop(clients);
    state.wake.send_replace(());

    Json(serde_json::json!({ "clientId": client_id }))
}

pub(crate) async fn send(
    State(state): State<Arc<EndpointState>>,
    body: String,
) -> (StatusCode, Json<serde_json::Value>) {
    match serde_json::from_str::<Incoming>(&body) {
        Ok(message) => {
            if state.inbound_tx.send(Event::Editor(message)).is_err() {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(serde_json::json!({ "error": "daemon is shutting down" })),
                );
            }
            (StatusCode::OK, Json(serde_json::json!({ "ok": true })))
        }
        Err(error) => {
            tracing::warn!(%error, "undecodable editor message");
            let reply = Outgoing::Error {
                message: format!("malformed message: {error}"),
            };
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::to_value(&reply).unwrap_or_default()),
            )
        }
    }
}

pub(crate) async fn poll(
    State(state): State<Arc<EndpointState>>,
    Query(params): Query<PollParams>,
) -> (StatusCode, Json<serde_json::Value>) {
    let deadline = Instant::now() + POLL_WAIT;
    let mut wake_rx = state.wake.subscribe();

    loop {
        {
            let mut clients = state.poll_clients.lock().await;
            let Some(client) = clients.get_mut(&params.client_id) else {
                // Reaped or never known; the editor reconnects fresh.
                return (
                    StatusCode::GONE,
                    Json(serde_json::json!({ "error": "unknown client" })),
                );
            };
            client.last_poll = Instant::now();
            if !client.queue.is_empty() {
                let batch: Vec<Outgoing> = client.queue.drain(..).collect();
                return (
                    StatusCode::OK,
                    Json(serde_json::to_value(&batch).unwrap_or_default()),
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                return (StatusCode::OK, Json(serde_json::json!([])));
            }
            changed = wake_rx.changed() => {
                if changed.is_err() {
                    return (StatusCode::OK, Json(serde_json::json!([])));
                }
            }
        }
    }
}

pub(crate) async fn disconnect(
    State(state): State<Arc<EndpointState>>,
    Query(params): Query<PollParams>,
) -> StatusCode {
    let mut clients = state.poll_clients.lock().await;
    if clients.remove(&params.client_id).is_some() {
        tracing::info!(client = %params.client_id, "editor disconnected");
    }
    StatusCode::OK
}

/// Background task: discards queues of clients that stopped polling.
pub(crate) async fn reap_stale_clients(state: Arc<EndpointState>) {
    let mut ticker = tokio::time::interval(REAP_INTERVAL);
    loop {
        ticker.tick().await;
        let mut clients = state.poll_clients.lock().await;
        let now = Instant::now();
        clients.retain(|client_id, client| {
            let live = now.duration_since(client.last_poll) < STALE_CLIENT_TIMEOUT;
            if !live {
                tracing::info!(client = %client_id, "reaping stale poll client");
            }
            live
        });
    }
}
