//! Chat entry point (`/api/start_chat`)
//!
//! Both sides of a session connect here. Credentials pick the role: an
//! `authorization` header carrying an agent-session token routes to the
//! agent flow, anything else is a visitor who must present their chat-auth
//! token in a `user-login` event. An invalid agent token still upgrades the
//! socket so the client can receive `connect_error` with message `"auth"`
//! and re-authenticate once.

use axum::{
    extract::{ws::WebSocket, State, WebSocketUpgrade},
    http::HeaderMap,
    response::Response,
};
use base64::Engine;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;

use helpdesk_shared::{AgentIdentity, CoordinatorError, SessionId};

use crate::auth::TokenKind;
use crate::state::AppState;

use super::connection::{spawn_outbound, ConnectionPhase};
use super::events::{ClientEvent, ServerEvent};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let credential = bearer_token(&headers);
    ws.on_upgrade(move |socket| async move {
        match credential {
            Some(token) => match state.tokens.verify_agent(&token) {
                Ok(agent) => agent_socket(socket, state, agent).await,
                Err(e) => {
                    tracing::warn!(error = %e, "Agent token rejected on chat connect");
                    reject_socket(socket).await;
                }
            },
            None => visitor_socket(socket, state).await,
        }
    })
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").unwrap_or(value);
    Some(token.to_string())
}

/// Upgrade completed but the credential is bad: deliver the auth error over
/// the socket, then drop it
async fn reject_socket(socket: WebSocket) {
    let (sink, _receiver) = socket.split();
    let (tx, send_task) = spawn_outbound::<ServerEvent>(sink);
    let _ = tx.send(ServerEvent::ConnectError {
        message: "auth".to_string(),
    });
    drop(tx);
    let _ = send_task.await;
}

// =============================================================================
// Agent side
// =============================================================================

async fn agent_socket(socket: WebSocket, state: AppState, agent: AgentIdentity) {
    let (sink, mut receiver) = socket.split();
    let (tx, send_task) = spawn_outbound::<ServerEvent>(sink);
    let username = agent.username.clone();

    let mut phase = ConnectionPhase::Authenticating;

    while let Some(Ok(msg)) = receiver.next().await {
        let axum::extract::ws::Message::Text(text) = msg else {
            continue;
        };
        let event = match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(agent = %username, error = ?e, "Unparseable chat event");
                let _ = tx.send(ServerEvent::Error {
                    message: "Invalid event format".to_string(),
                });
                continue;
            }
        };

        // Any inbound traffic proves the agent is alive
        if phase == ConnectionPhase::SessionBound {
            state.presence.heartbeat(&username).await;
        }

        match event {
            ClientEvent::AgentLogin => {
                state
                    .presence
                    .mark_online(agent.clone(), tx.clone())
                    .await;
                phase = ConnectionPhase::SessionBound;
                let _ = tx.send(ServerEvent::StartedAgentChat);

                state.broadcast_presence().await;

                // Reconnect case: hand back any sessions still in grace
                state.sessions.reattach_agent(&username, &state.presence).await;
                state.assign_waiting_visitors().await;
            }

            ClientEvent::Message {
                user_id: Some(user_id),
                message,
                ..
            } => {
                if let Err(e) = state
                    .sessions
                    .relay_from_agent(&username, user_id, message, &state.presence)
                    .await
                {
                    let _ = tx.send(ServerEvent::Error {
                        message: e.to_string(),
                    });
                }
            }

            ClientEvent::FileUpload {
                user_id: Some(user_id),
                name,
                file_type,
                file,
                toast_id,
            } => {
                let Some(bytes) = decode_file_payload(&file) else {
                    let _ = tx.send(ServerEvent::UploadFailure {
                        toast_id,
                        file_name: name,
                    });
                    continue;
                };
                // Blob I/O must not stall the recv loop
                let state = state.clone();
                let tx = tx.clone();
                let username = username.clone();
                tokio::spawn(async move {
                    if let Err(e) = state
                        .sessions
                        .upload_from_agent(
                            &username,
                            user_id,
                            name.clone(),
                            file_type,
                            bytes,
                            toast_id.clone(),
                            &state.presence,
                        )
                        .await
                    {
                        tracing::warn!(agent = %username, error = %e, "Agent upload failed");
                        let _ = tx.send(ServerEvent::UploadFailure {
                            toast_id,
                            file_name: name,
                        });
                    }
                });
            }

            ClientEvent::EndChat { user_id } => {
                match state
                    .sessions
                    .end_chat_by_agent(&username, user_id, &state.presence)
                    .await
                {
                    Ok(()) => {
                        // Capacity just freed up
                        state.assign_waiting_visitors().await;
                    }
                    Err(e) => {
                        let _ = tx.send(ServerEvent::Error {
                            message: e.to_string(),
                        });
                    }
                }
            }

            ClientEvent::Transfer {
                user_id,
                to_username,
            } => {
                match state
                    .sessions
                    .transfer(&username, user_id, &to_username, &state.presence)
                    .await
                {
                    Ok(_) => {}
                    Err(CoordinatorError::AgentOffline(agent)) => {
                        let _ = tx.send(ServerEvent::Error {
                            message: format!("agent {agent} is not online"),
                        });
                    }
                    Err(e) => {
                        let _ = tx.send(ServerEvent::Error {
                            message: e.to_string(),
                        });
                    }
                }
            }

            ClientEvent::Ping => {
                let _ = tx.send(ServerEvent::Pong);
            }

            other => {
                tracing::debug!(agent = %username, event = ?other, "Ignoring event on chat connection");
            }
        }
    }

    tracing::info!(agent = %username, "Agent chat connection closed");
    if phase == ConnectionPhase::SessionBound {
        state.presence.mark_offline(&username).await;
        state.broadcast_presence().await;
        state
            .sessions
            .agent_disconnected(
                &username,
                Arc::clone(&state.presence),
                Arc::clone(&state.tokens),
            )
            .await;
    }
    send_task.abort();
}

// =============================================================================
// Visitor side
// =============================================================================

async fn visitor_socket(socket: WebSocket, state: AppState) {
    let (sink, mut receiver) = socket.split();
    let (tx, send_task) = spawn_outbound::<ServerEvent>(sink);

    let mut phase = ConnectionPhase::Authenticating;
    let mut session_id: Option<SessionId> = None;

    while let Some(Ok(msg)) = receiver.next().await {
        let axum::extract::ws::Message::Text(text) = msg else {
            continue;
        };
        let event = match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = ?e, "Unparseable chat event");
                let _ = tx.send(ServerEvent::Error {
                    message: "Invalid event format".to_string(),
                });
                continue;
            }
        };

        match event {
            ClientEvent::UserLogin { token } if phase == ConnectionPhase::Authenticating => {
                if let Some(sid) = visitor_login(&state, &token, &tx).await {
                    session_id = Some(sid);
                    phase = ConnectionPhase::SessionBound;
                }
            }

            ClientEvent::Message { message, .. } if phase == ConnectionPhase::SessionBound => {
                if let Some(sid) = session_id {
                    if let Err(e) = state
                        .sessions
                        .relay_from_visitor(sid, message, &state.presence)
                        .await
                    {
                        let _ = tx.send(ServerEvent::Error {
                            message: e.to_string(),
                        });
                    }
                }
            }

            ClientEvent::FileUpload {
                name,
                file_type,
                file,
                toast_id,
                ..
            } if phase == ConnectionPhase::SessionBound => {
                let Some(sid) = session_id else { continue };
                let Some(bytes) = decode_file_payload(&file) else {
                    let _ = tx.send(ServerEvent::UploadFailure {
                        toast_id,
                        file_name: name,
                    });
                    continue;
                };
                let state = state.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = state
                        .sessions
                        .upload_from_visitor(
                            sid,
                            name.clone(),
                            file_type,
                            bytes,
                            toast_id.clone(),
                            &state.presence,
                        )
                        .await
                    {
                        tracing::warn!(session_id = %sid, error = %e, "Visitor upload failed");
                        let _ = tx.send(ServerEvent::UploadFailure {
                            toast_id,
                            file_name: name,
                        });
                    }
                });
            }

            ClientEvent::Ping => {
                let _ = tx.send(ServerEvent::Pong);
            }

            other => {
                tracing::debug!(phase = %phase, event = ?other, "Ignoring event on chat connection");
            }
        }
    }

    if let Some(sid) = session_id {
        state
            .sessions
            .visitor_disconnected(sid, Arc::clone(&state.presence))
            .await;
    }
    send_task.abort();
}

/// Redeem a chat-auth token and bind the connection to its session.
///
/// A valid token whose session is already gone (agent left, grace expired
/// before the visitor arrived) earns the visitor a fresh bypass token via
/// `enqueue` instead of a dead end.
async fn visitor_login(
    state: &AppState,
    token: &str,
    tx: &mpsc::UnboundedSender<ServerEvent>,
) -> Option<SessionId> {
    let claims = match state.tokens.redeem(token) {
        Ok(claims) if claims.kind == TokenKind::ChatAuth => claims,
        Ok(_) => {
            let _ = tx.send(ServerEvent::AuthFailed);
            return None;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Chat-auth token rejected");
            let _ = tx.send(ServerEvent::AuthFailed);
            return None;
        }
    };
    let identity = match claims.visitor_identity() {
        Ok(identity) => identity,
        Err(_) => {
            let _ = tx.send(ServerEvent::AuthFailed);
            return None;
        }
    };

    match state
        .sessions
        .attach_visitor(identity.visitor_id, tx.clone())
        .await
    {
        Ok((session_id, _agent)) => Some(session_id),
        Err(CoordinatorError::NotFound(_)) => {
            match state.tokens.issue_queue_bypass(&identity) {
                Ok(bypass) => {
                    let _ = tx.send(ServerEvent::Enqueue { token: bypass });
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to mint bypass token");
                    let _ = tx.send(ServerEvent::AuthFailed);
                }
            }
            None
        }
        Err(e) => {
            tracing::error!(error = %e, "Visitor attach failed");
            let _ = tx.send(ServerEvent::AuthFailed);
            None
        }
    }
}

/// Decode a base64 upload payload, tolerating a data-URL prefix
fn decode_file_payload(payload: &str) -> Option<Vec<u8>> {
    let encoded = match payload.split_once(";base64,") {
        Some((_, rest)) => rest,
        None => payload,
    };
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()
}
