//! Per-connection plumbing shared by the gateway handlers

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Where a connection is in its lifecycle. Tracked per connection for
/// logging and to reject events that arrive out of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Authenticating,
    /// Visitor waiting in the queue
    QueueBound,
    /// Bound to a chat session (visitor) or the agent pool (agent)
    SessionBound,
    Disconnected,
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Authenticating => "authenticating",
            ConnectionPhase::QueueBound => "queue_bound",
            ConnectionPhase::SessionBound => "session_bound",
            ConnectionPhase::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Spawn the send half of a connection: events pushed into the returned
/// channel are serialized and written to the socket until either side
/// closes. One JSON object per text frame.
pub fn spawn_outbound<E>(
    mut sink: SplitSink<WebSocket, Message>,
) -> (mpsc::UnboundedSender<E>, JoinHandle<()>)
where
    E: Serialize + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<E>();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sink.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Failed to serialize outbound event");
                }
            }
        }
    });
    (tx, task)
}
