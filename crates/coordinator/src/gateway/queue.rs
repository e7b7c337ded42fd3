//! Queue entry point (`/api/start_queue`)
//!
//! Visitors connect here before they have any credentials. The first event
//! must be `join_queue`, either with a name payload (fresh join) or a
//! queue-bypass token (rejoin after an ended session). Once queued the
//! connection just idles on heartbeats until assignment delivers the
//! chat-auth token via `done`.

use axum::{
    extract::{ws::WebSocket, ConnectInfo, State, WebSocketUpgrade},
    response::Response,
};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;

use helpdesk_shared::{CoordinatorError, VisitorId, VisitorIdentity};

use crate::auth::TokenKind;
use crate::state::AppState;

use super::connection::{spawn_outbound, ConnectionPhase};
use super::events::{ClientEvent, ServerEvent};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(socket: WebSocket, state: AppState, addr: SocketAddr) {
    let mut phase = ConnectionPhase::Connecting;
    let (sink, mut receiver) = socket.split();
    let (tx, send_task) = spawn_outbound::<ServerEvent>(sink);
    tracing::debug!(phase = %phase, "Queue socket established");
    phase = ConnectionPhase::Authenticating;
    let mut visitor_id: Option<VisitorId> = None;

    while let Some(Ok(msg)) = receiver.next().await {
        let axum::extract::ws::Message::Text(text) = msg else {
            continue;
        };
        let event = match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = ?e, "Unparseable queue event");
                let _ = tx.send(ServerEvent::Error {
                    message: "Invalid event format".to_string(),
                });
                continue;
            }
        };

        match event {
            ClientEvent::JoinQueue {
                token,
                first_name,
                last_name,
            } if phase == ConnectionPhase::Authenticating => {
                let identity = match resolve_identity(&state, token, first_name, last_name) {
                    Ok(identity) => identity,
                    Err(event) => {
                        let _ = tx.send(event);
                        continue;
                    }
                };

                // A bypass rejoin while the visitor's session still lives
                // (grace period) must not double-book them: hand back a
                // token for the existing session instead of queueing
                if let Some(agent) = state.sessions.assigned_agent(identity.visitor_id).await {
                    match state.tokens.issue_chat_auth(&identity, &agent) {
                        Ok(token) => {
                            let _ = tx.send(ServerEvent::Done { token });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to mint chat-auth token");
                            let _ = tx.send(ServerEvent::Error {
                                message: "Failed to rejoin session".to_string(),
                            });
                        }
                    }
                    continue;
                }

                let fingerprint =
                    visitor_fingerprint(&addr, &identity.first_name, &identity.last_name);
                match state
                    .queue
                    .enqueue(identity.clone(), &fingerprint, tx.clone())
                    .await
                {
                    Ok(()) => {
                        visitor_id = Some(identity.visitor_id);
                        phase = ConnectionPhase::QueueBound;
                        let _ = tx.send(ServerEvent::AgentsOnline {
                            count: state.presence.online_count().await,
                        });
                        state.assign_waiting_visitors().await;
                    }
                    Err(CoordinatorError::RateLimited) => {
                        let _ = tx.send(ServerEvent::RateLimited);
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Queue join failed");
                        let _ = tx.send(ServerEvent::Error {
                            message: "Failed to join queue".to_string(),
                        });
                    }
                }
            }

            ClientEvent::Ping => {
                let _ = tx.send(ServerEvent::Pong);
            }

            other => {
                tracing::debug!(phase = %phase, event = ?other, "Ignoring event on queue connection");
            }
        }
    }

    phase = ConnectionPhase::Disconnected;
    if let Some(visitor_id) = visitor_id {
        // No-op if assignment already consumed the entry
        state.queue.remove(visitor_id).await;
    }
    tracing::info!(phase = %phase, "Queue connection closed");
    send_task.abort();
}

/// Work out who is joining: a bypass token carries a prior identity, a bare
/// join carries the name the visitor just typed.
fn resolve_identity(
    state: &AppState,
    token: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
) -> Result<VisitorIdentity, ServerEvent> {
    if let Some(token) = token {
        let claims = state.tokens.redeem(&token).map_err(|e| {
            tracing::warn!(error = %e, "Bypass token rejected");
            ServerEvent::BadAuth
        })?;
        if claims.kind != TokenKind::QueueBypass {
            return Err(ServerEvent::BadAuth);
        }
        return claims.visitor_identity().map_err(|_| ServerEvent::BadAuth);
    }

    match (first_name, last_name) {
        (Some(first), Some(last)) if !first.trim().is_empty() && !last.trim().is_empty() => {
            Ok(VisitorIdentity::new(first.trim(), last.trim()))
        }
        _ => Err(ServerEvent::Error {
            message: "firstName and lastName are required".to_string(),
        }),
    }
}

/// Rate-limit key: hash of the remote IP and the claimed name. Coarse on
/// purpose, it only needs to slow down queue flooding from one origin.
fn visitor_fingerprint(addr: &SocketAddr, first_name: &str, last_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(addr.ip().to_string().as_bytes());
    hasher.update(first_name.as_bytes());
    hasher.update(last_name.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_per_origin_and_name() {
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let a = visitor_fingerprint(&addr, "Jane", "Doe");
        let b = visitor_fingerprint(&addr, "Jane", "Doe");
        assert_eq!(a, b);

        // Same origin, different port: same fingerprint
        let addr2: SocketAddr = "10.0.0.1:6000".parse().unwrap();
        assert_eq!(a, visitor_fingerprint(&addr2, "Jane", "Doe"));

        // Different name or origin changes it
        assert_ne!(a, visitor_fingerprint(&addr, "John", "Doe"));
        let other: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        assert_ne!(a, visitor_fingerprint(&other, "Jane", "Doe"));
    }
}
