//! WebSocket upgrade for the realtime push channel. Subscriptions are fixed
//! at session setup via the `topics` query parameter; there are no
//! client-to-server application messages.

use std::collections::HashSet;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::AppState;
use crate::auth::Principal;
use crate::realtime::Topic;

#[derive(Debug, Clone, Deserialize)]
pub struct WsQuery {
    /// Comma-separated topics (`readings,alerts,deviceStatus`); all three
    /// when omitted.
    #[serde(default = "default_topics")]
    pub topics: String,
}

fn default_topics() -> String {
    "readings,alerts,deviceStatus".to_string()
}

pub async fn ws_handler(
    State(state): State<AppState>,
    _principal: Principal,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let topics: HashSet<Topic> = query.topics.split(',').filter_map(Topic::parse).collect();
    ws.on_upgrade(move |socket| handle_socket(socket, state, topics))
}

async fn handle_socket(socket: WebSocket, state: AppState, topics: HashSet<Topic>) {
    let (session, mut rx) = state.fanout.subscribe(topics).await;
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        let Ok(text) = serde_json::to_string(&frame) else { continue };
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // Fanout dropped this session (queue overflow).
                    None => break,
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Application messages from clients are not part of the
                    // contract; pings are handled by axum.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.fanout.unsubscribe(session).await;
}
