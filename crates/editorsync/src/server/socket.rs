//! Streaming transport variant: a WebSocket upgraded from HTTP.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::protocol::{Incoming, Outgoing};
use crate::reconciler::Event;
use crate::server::EndpointState;

pub(crate) struct SocketClient {
    tx: mpsc::UnboundedSender<String>,
    pub generation: u64,
}

impl SocketClient {
    pub fn send(&self, message: &Outgoing) {
        let _ = self.tx.send(message.to_json());
    }
}

pub(crate) async fn ws_handler(
    State(state): State<Arc<EndpointState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<EndpointState>, socket: WebSocket) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Taking the active slot closes out any previous connection, of either
    // variant.
    let generation = state.next_generation();
    {
        state.poll_clients.lock().await.clear();
        let mut slot = state.socket.lock().await;
        if slot.is_some() {
            tracing::info!("editor reconnected; dropping previous socket");
        }
        *slot = Some(SocketClient {
            tx: tx.clone(),
            generation,
        });
    }
    if let Some(greeting) = &state.greeting {
        let _ = tx.send(greeting.to_json());
    }

    // Write half: forward queued outbound messages to the socket.
    let write_task = async move {
        while let Some(text) = rx.recv().await {
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    };

    // Read half: decode inbound messages and hand them to the reconciler.
    let inbound_tx = state.inbound_tx.clone();
    let reply_tx = tx.clone();
    let read_task = async move {
        while let Some(Ok(message)) = ws_stream.next().await {
            match message {
                Message::Text(text) => match serde_json::from_str::<Incoming>(&text) {
                    Ok(inbound) => {
                        if inbound_tx.send(Event::Editor(inbound)).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "undecodable editor message");
                        let reply = Outgoing::Error {
                            message: format!("malformed message: {error}"),
                        };
                        let _ = reply_tx.send(reply.to_json());
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = write_task => {}
        _ = read_task => {}
    }

    // Only vacate the slot if it is still ours.
    let mut slot = state.socket.lock().await;
    if slot
        .as_ref()
        .is_some_and(|client| client.generation == generation)
    {
        *slot = None;
    }
    drop(slot);

    if state.generation.load(Ordering::SeqCst) == generation {
        tracing::info!("editor socket closed");
    }
}
