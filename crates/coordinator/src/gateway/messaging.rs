//! Messaging entry point (`/api/start_messaging`)
//!
//! Agent-only namespace for direct messages between agents. Authentication
//! mirrors the chat route: a valid agent-session token in the
//! `authorization` header, anything else gets `connect_error` and a close.

use axum::{
    extract::{ws::WebSocket, State, WebSocketUpgrade},
    http::HeaderMap,
    response::Response,
};
use futures::StreamExt;

use helpdesk_shared::AgentIdentity;

use crate::messaging::MessagingEvent;
use crate::state::AppState;

use super::connection::spawn_outbound;
use super::events::ClientEvent;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let credential = super::chat::bearer_token(&headers);
    ws.on_upgrade(move |socket| async move {
        match credential.and_then(|token| state.tokens.verify_agent(&token).ok()) {
            Some(agent) => agent_socket(socket, state, agent).await,
            None => reject_socket(socket).await,
        }
    })
}

async fn reject_socket(socket: WebSocket) {
    let (sink, _receiver) = socket.split();
    let (tx, send_task) = spawn_outbound::<MessagingEvent>(sink);
    let _ = tx.send(MessagingEvent::ConnectError {
        message: "auth".to_string(),
    });
    drop(tx);
    let _ = send_task.await;
}

async fn agent_socket(socket: WebSocket, state: AppState, agent: AgentIdentity) {
    let (sink, mut receiver) = socket.split();
    let (tx, send_task) = spawn_outbound::<MessagingEvent>(sink);
    let username = agent.username;

    state.messaging.connect(&username, tx.clone()).await;

    while let Some(Ok(msg)) = receiver.next().await {
        let axum::extract::ws::Message::Text(text) = msg else {
            continue;
        };
        let event = match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(agent = %username, error = ?e, "Unparseable messaging event");
                continue;
            }
        };

        match event {
            ClientEvent::Ping => {
                let _ = tx.send(MessagingEvent::Pong);
            }

            ClientEvent::GetChats => {
                let chats = state.messaging.chats_for(&username).await;
                let _ = tx.send(MessagingEvent::Chats { chats });
            }

            ClientEvent::GetAllUsernames => {
                let usernames = state.messaging.usernames(&username).await;
                let _ = tx.send(MessagingEvent::AllUsernames { usernames });
            }

            ClientEvent::Message {
                to_username: Some(to),
                message,
                ..
            } => {
                state.messaging.send(&username, &to, message).await;
            }

            ClientEvent::RemoveChat { username: peer } => {
                state.messaging.remove_chat(&username, &peer).await;
            }

            other => {
                tracing::debug!(agent = %username, event = ?other, "Ignoring event on messaging connection");
            }
        }
    }

    state.messaging.disconnect(&username).await;
    send_task.abort();
}
