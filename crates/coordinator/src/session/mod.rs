//! Chat session coordinator
//!
//! Owns the lifecycle of every visitor/agent session: creation at queue
//! assignment, message relay, file uploads, transfer between agents, and
//! termination. Each session's state sits behind its own lock so concurrent
//! messages in one session serialize in arrival order without a global
//! bottleneck. The transcript is the single source of truth for ordering;
//! live relay is a best-effort fast path and reconnect replay is
//! authoritative.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex, RwLock};

use helpdesk_shared::{
    CoordinatorError, CoordinatorResult, FileId, FileRef, Message, SenderKind, SessionId,
    SessionState, VisitorId, VisitorIdentity,
};

use crate::auth::TokenService;
use crate::gateway::events::{ServerEvent, WireMessage};
use crate::presence::PresenceRegistry;
use crate::storage::{BlobStore, TranscriptStore};

/// Session tunables, lifted out of the full [`crate::Config`]
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a session survives a disconnected party before it ends
    pub grace_period: StdDuration,
    pub upload_max_bytes: usize,
    pub blob_timeout: StdDuration,
    pub message_max_chars: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period: StdDuration::from_secs(30),
            upload_max_bytes: 2_000_000,
            blob_timeout: StdDuration::from_secs(10),
            message_max_chars: 1024,
        }
    }
}

/// One live session. The inner mutex serializes all transcript mutation.
pub struct SessionHandle {
    pub id: SessionId,
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    visitor: VisitorIdentity,
    agent_username: String,
    started_at: OffsetDateTime,
    state: SessionState,
    transcript: Vec<Message>,
    visitor_tx: Option<mpsc::UnboundedSender<ServerEvent>>,
    /// Transcript prefix each party has confirmed received; replay resumes here
    visitor_delivered: usize,
    agent_delivered: usize,
    /// Bumped on every attach/detach to invalidate stale grace timers
    visitor_epoch: u64,
    agent_epoch: u64,
}

impl SessionInner {
    fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Created | SessionState::Active)
    }

    /// Append with monotonic non-decreasing timestamps
    fn append(&mut self, mut message: Message) -> Message {
        if let Some(last) = self.transcript.last() {
            if message.timestamp < last.timestamp {
                message.timestamp = last.timestamp;
            }
        }
        self.transcript.push(message.clone());
        message
    }

    /// Transcript slice from a checkpoint, projected for one recipient.
    /// Repeated calls with the same checkpoint yield identical output.
    fn replay_from(&self, checkpoint: usize, correspondent: &str) -> Vec<WireMessage> {
        self.transcript
            .iter()
            .skip(checkpoint)
            .map(|msg| WireMessage::project(msg, correspondent))
            .collect()
    }
}

/// Coordinator over all live sessions
pub struct SessionCoordinator {
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
    by_visitor: RwLock<HashMap<VisitorId, SessionId>>,
    blobs: Arc<dyn BlobStore>,
    transcripts: Arc<dyn TranscriptStore>,
    config: SessionConfig,
}

impl SessionCoordinator {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        transcripts: Arc<dyn TranscriptStore>,
        config: SessionConfig,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            by_visitor: RwLock::new(HashMap::new()),
            blobs,
            transcripts,
            config,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a session pairing a visitor with an agent.
    ///
    /// A visitor holds at most one live session; a second creation attempt
    /// for the same visitor is an invariant violation and is rejected.
    pub async fn create_session(
        &self,
        visitor: VisitorIdentity,
        agent_username: &str,
    ) -> CoordinatorResult<SessionId> {
        let mut by_visitor = self.by_visitor.write().await;
        if by_visitor.contains_key(&visitor.visitor_id) {
            tracing::error!(
                visitor_id = %visitor.visitor_id,
                "Rejected session creation: visitor already in a session"
            );
            return Err(CoordinatorError::InvariantViolation(
                "visitor already has an active session".to_string(),
            ));
        }

        let session_id = SessionId::new();
        let handle = Arc::new(SessionHandle {
            id: session_id,
            inner: Mutex::new(SessionInner {
                visitor: visitor.clone(),
                agent_username: agent_username.to_string(),
                started_at: OffsetDateTime::now_utc(),
                state: SessionState::Created,
                transcript: Vec::new(),
                visitor_tx: None,
                visitor_delivered: 0,
                agent_delivered: 0,
                visitor_epoch: 0,
                agent_epoch: 0,
            }),
        });

        by_visitor.insert(visitor.visitor_id, session_id);
        self.sessions.write().await.insert(session_id, handle);

        tracing::info!(
            session_id = %session_id,
            visitor_id = %visitor.visitor_id,
            agent = %agent_username,
            "Session created"
        );
        Ok(session_id)
    }

    pub async fn session_for_visitor(
        &self,
        visitor_id: VisitorId,
    ) -> Option<Arc<SessionHandle>> {
        let session_id = *self.by_visitor.read().await.get(&visitor_id)?;
        self.sessions.read().await.get(&session_id).cloned()
    }

    /// The agent owning a visitor's live session, if one exists
    pub async fn assigned_agent(&self, visitor_id: VisitorId) -> Option<String> {
        let handle = self.session_for_visitor(visitor_id).await?;
        let inner = handle.inner.lock().await;
        inner.is_open().then(|| inner.agent_username.clone())
    }

    async fn handle(&self, session_id: SessionId) -> CoordinatorResult<Arc<SessionHandle>> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::NotFound(format!("session {session_id}")))
    }

    /// Resolve the agent's session for a visitor, verifying ownership
    async fn handle_for_agent(
        &self,
        agent_username: &str,
        visitor_id: VisitorId,
    ) -> CoordinatorResult<Arc<SessionHandle>> {
        let handle = self
            .session_for_visitor(visitor_id)
            .await
            .ok_or_else(|| CoordinatorError::NotFound(format!("no session for {visitor_id}")))?;
        let inner = handle.inner.lock().await;
        if inner.agent_username != agent_username {
            return Err(CoordinatorError::InvariantViolation(
                "session belongs to another agent".to_string(),
            ));
        }
        drop(inner);
        Ok(handle)
    }

    /// Bind a visitor connection to their session and replay the transcript
    /// from their last-delivered point. Returns the assigned agent's
    /// username for the gateway's connection state.
    pub async fn attach_visitor(
        &self,
        visitor_id: VisitorId,
        tx: mpsc::UnboundedSender<ServerEvent>,
    ) -> CoordinatorResult<(SessionId, String)> {
        let handle = self
            .session_for_visitor(visitor_id)
            .await
            .ok_or_else(|| CoordinatorError::NotFound(format!("no session for {visitor_id}")))?;

        let mut inner = handle.inner.lock().await;
        if !inner.is_open() {
            return Err(CoordinatorError::NotFound("session already ended".to_string()));
        }

        let replay = inner.replay_from(inner.visitor_delivered, &inner.agent_username);
        let sent = tx
            .send(ServerEvent::Transcript {
                user_id: None,
                messages: replay,
            })
            .is_ok();
        if sent {
            inner.visitor_delivered = inner.transcript.len();
        }

        inner.visitor_tx = Some(tx);
        inner.visitor_epoch += 1;
        inner.state = SessionState::Active;

        tracing::info!(
            session_id = %handle.id,
            visitor_id = %visitor_id,
            agent = %inner.agent_username,
            "Visitor attached to session"
        );
        Ok((handle.id, inner.agent_username.clone()))
    }

    // =========================================================================
    // Message relay
    // =========================================================================

    /// Visitor sends a message into their session
    pub async fn relay_from_visitor(
        &self,
        session_id: SessionId,
        text: String,
        presence: &PresenceRegistry,
    ) -> CoordinatorResult<()> {
        let handle = self.handle(session_id).await?;
        self.relay(&handle, SenderKind::Visitor, text, presence).await
    }

    /// Agent sends a message to one of their assigned visitors
    pub async fn relay_from_agent(
        &self,
        agent_username: &str,
        visitor_id: VisitorId,
        text: String,
        presence: &PresenceRegistry,
    ) -> CoordinatorResult<()> {
        let handle = self.handle_for_agent(agent_username, visitor_id).await?;
        self.relay(&handle, SenderKind::Agent, text, presence).await
    }

    async fn relay(
        &self,
        handle: &SessionHandle,
        from: SenderKind,
        mut text: String,
        presence: &PresenceRegistry,
    ) -> CoordinatorResult<()> {
        if text.chars().count() > self.config.message_max_chars {
            text = text.chars().take(self.config.message_max_chars).collect();
        }

        let mut inner = handle.inner.lock().await;
        if !inner.is_open() {
            return Err(CoordinatorError::NotFound("session already ended".to_string()));
        }

        let message = inner.append(Message::text(from, text));
        self.forward(&mut inner, &message, presence).await;
        Ok(())
    }

    /// Best-effort live delivery to the counterpart; the sender implicitly
    /// acks their own message. Failed delivery leaves the counterpart's
    /// checkpoint behind so reconnect replay picks the message up.
    async fn forward(
        &self,
        inner: &mut SessionInner,
        message: &Message,
        presence: &PresenceRegistry,
    ) {
        let len = inner.transcript.len();
        match message.sender {
            SenderKind::Visitor => {
                inner.visitor_delivered = len;
                let wire = WireMessage::project(message, &inner.visitor.visitor_id.to_string());
                if presence
                    .send_to(&inner.agent_username, ServerEvent::Message(wire))
                    .await
                {
                    inner.agent_delivered = len;
                }
            }
            SenderKind::Agent => {
                inner.agent_delivered = len;
                let wire = WireMessage::project(message, &inner.agent_username);
                let delivered = inner
                    .visitor_tx
                    .as_ref()
                    .map(|tx| tx.send(ServerEvent::Message(wire)).is_ok())
                    .unwrap_or(false);
                if delivered {
                    inner.visitor_delivered = len;
                }
            }
        }
    }

    // =========================================================================
    // File uploads
    // =========================================================================

    /// Visitor uploads a file into their session
    pub async fn upload_from_visitor(
        &self,
        session_id: SessionId,
        file_name: String,
        mime_type: String,
        bytes: Vec<u8>,
        toast_id: Option<serde_json::Value>,
        presence: &PresenceRegistry,
    ) -> CoordinatorResult<()> {
        let handle = self.handle(session_id).await?;
        self.upload(&handle, SenderKind::Visitor, file_name, mime_type, bytes, toast_id, presence)
            .await
    }

    /// Agent uploads a file to one of their assigned visitors
    pub async fn upload_from_agent(
        &self,
        agent_username: &str,
        visitor_id: VisitorId,
        file_name: String,
        mime_type: String,
        bytes: Vec<u8>,
        toast_id: Option<serde_json::Value>,
        presence: &PresenceRegistry,
    ) -> CoordinatorResult<()> {
        let handle = self.handle_for_agent(agent_username, visitor_id).await?;
        self.upload(&handle, SenderKind::Agent, file_name, mime_type, bytes, toast_id, presence)
            .await
    }

    async fn upload(
        &self,
        handle: &SessionHandle,
        from: SenderKind,
        file_name: String,
        mime_type: String,
        bytes: Vec<u8>,
        toast_id: Option<serde_json::Value>,
        presence: &PresenceRegistry,
    ) -> CoordinatorResult<()> {
        // Client-side checks are not trustworthy, re-validate here
        if bytes.len() > self.config.upload_max_bytes {
            return Err(CoordinatorError::UploadRejected(format!(
                "file exceeds {} bytes",
                self.config.upload_max_bytes
            )));
        }
        if !allowed_mime(&mime_type) {
            return Err(CoordinatorError::UploadRejected(format!(
                "unsupported file type {mime_type}"
            )));
        }

        let file_id = FileId::new();
        // Blob I/O runs outside the session lock and under its own timeout,
        // so an unresponsive store can never wedge the session
        let put = self
            .blobs
            .put(file_id, &file_name, &mime_type, bytes);
        tokio::time::timeout(self.config.blob_timeout, put)
            .await
            .map_err(|_| CoordinatorError::Storage("blob store timed out".to_string()))??;

        let file_ref = FileRef {
            file_id,
            file_name: file_name.clone(),
            mime_type,
        };

        let mut inner = handle.inner.lock().await;
        if !inner.is_open() {
            return Err(CoordinatorError::NotFound("session already ended".to_string()));
        }
        let message = inner.append(Message::file(from, file_ref));
        self.forward(&mut inner, &message, presence).await;

        // The uploader's client renders its own file bubble (and dismisses
        // its upload toast) off an echoed copy carrying the toast handle
        let mut echo = match from {
            SenderKind::Visitor => WireMessage::project(&message, &inner.agent_username),
            SenderKind::Agent => {
                WireMessage::project(&message, &inner.visitor.visitor_id.to_string())
            }
        };
        echo.toast_id = toast_id;
        match from {
            SenderKind::Visitor => {
                if let Some(tx) = &inner.visitor_tx {
                    let _ = tx.send(ServerEvent::Message(echo));
                }
            }
            SenderKind::Agent => {
                presence
                    .send_to(&inner.agent_username, ServerEvent::Message(echo))
                    .await;
            }
        }

        tracing::info!(
            session_id = %handle.id,
            file_id = %file_id,
            file_name = %file_name,
            "File relayed"
        );
        Ok(())
    }

    // =========================================================================
    // Transfer
    // =========================================================================

    /// Hand a session to another agent, preserving transcript continuity.
    ///
    /// Fails with `AgentOffline` (nothing mutated) if the target is not live.
    /// On success the old session becomes terminal (`Transferred`) and a new
    /// session under the target agent inherits the visitor, transcript, and
    /// delivery checkpoints.
    pub async fn transfer(
        &self,
        agent_username: &str,
        visitor_id: VisitorId,
        to_agent: &str,
        presence: &PresenceRegistry,
    ) -> CoordinatorResult<SessionId> {
        if !presence.is_online(to_agent).await {
            return Err(CoordinatorError::AgentOffline(to_agent.to_string()));
        }

        let old_handle = self.handle_for_agent(agent_username, visitor_id).await?;

        let mut old = old_handle.inner.lock().await;
        if !old.is_open() {
            return Err(CoordinatorError::NotFound("session already ended".to_string()));
        }

        old.state = SessionState::Transferred;
        let visitor = old.visitor.clone();
        let visitor_tx = old.visitor_tx.take();
        let transcript = std::mem::take(&mut old.transcript);
        let visitor_delivered = old.visitor_delivered;
        drop(old);

        let new_id = SessionId::new();
        let new_handle = Arc::new(SessionHandle {
            id: new_id,
            inner: Mutex::new(SessionInner {
                visitor: visitor.clone(),
                agent_username: to_agent.to_string(),
                started_at: OffsetDateTime::now_utc(),
                state: SessionState::Active,
                transcript,
                visitor_tx,
                visitor_delivered,
                agent_delivered: 0,
                visitor_epoch: 0,
                agent_epoch: 0,
            }),
        });

        {
            // Same lock order as create_session: by_visitor before sessions
            let mut by_visitor = self.by_visitor.write().await;
            let mut sessions = self.sessions.write().await;
            sessions.remove(&old_handle.id);
            sessions.insert(new_id, Arc::clone(&new_handle));
            by_visitor.insert(visitor.visitor_id, new_id);
        }

        presence.decrement_sessions(agent_username).await;
        presence.increment_sessions(to_agent).await;

        // Old agent drops the thread, new agent receives it with full history
        let _ = presence
            .send_to(agent_username, ServerEvent::UserDisconnect { user_id: visitor_id })
            .await;
        presence
            .send_to(to_agent, ServerEvent::AssignedUser { user: visitor.clone() })
            .await;

        let mut inner = new_handle.inner.lock().await;
        let replay = inner.replay_from(0, &visitor.visitor_id.to_string());
        if presence
            .send_to(
                to_agent,
                ServerEvent::Transcript {
                    user_id: Some(visitor_id),
                    messages: replay,
                },
            )
            .await
        {
            inner.agent_delivered = inner.transcript.len();
        }
        if let Some(tx) = &inner.visitor_tx {
            let _ = tx.send(ServerEvent::AgentChanged {
                username: to_agent.to_string(),
            });
        }
        drop(inner);

        tracing::info!(
            old_session = %old_handle.id,
            new_session = %new_id,
            visitor_id = %visitor_id,
            from_agent = %agent_username,
            to_agent = %to_agent,
            "Session transferred"
        );
        Ok(new_id)
    }

    // =========================================================================
    // Termination
    // =========================================================================

    /// Agent ends one of their sessions; the visitor is told `chat-ended`
    pub async fn end_chat_by_agent(
        &self,
        agent_username: &str,
        visitor_id: VisitorId,
        presence: &PresenceRegistry,
    ) -> CoordinatorResult<()> {
        let handle = self.handle_for_agent(agent_username, visitor_id).await?;
        self.finish(&handle, Some(ServerEvent::ChatEnded), None, presence)
            .await
    }

    /// Tear a session down, notify whichever parties the caller chose,
    /// persist the transcript, and release the visitor for future queueing.
    async fn finish(
        &self,
        handle: &Arc<SessionHandle>,
        visitor_event: Option<ServerEvent>,
        agent_event: Option<ServerEvent>,
        presence: &PresenceRegistry,
    ) -> CoordinatorResult<()> {
        let mut inner = handle.inner.lock().await;
        if !inner.is_open() {
            return Err(CoordinatorError::NotFound("session already ended".to_string()));
        }
        inner.state = SessionState::Ended;

        let visitor = inner.visitor.clone();
        let agent_username = inner.agent_username.clone();
        let transcript = std::mem::take(&mut inner.transcript);

        if let (Some(event), Some(tx)) = (visitor_event, inner.visitor_tx.as_ref()) {
            let _ = tx.send(event);
        }
        drop(inner);

        if let Some(event) = agent_event {
            let _ = presence.send_to(&agent_username, event).await;
        }

        self.sessions.write().await.remove(&handle.id);
        self.by_visitor.write().await.remove(&visitor.visitor_id);
        presence.decrement_sessions(&agent_username).await;

        // Persistence failure is logged, not fatal: the session is over
        // either way and the process must keep serving other connections
        if let Err(e) = self
            .transcripts
            .persist(handle.id, &visitor, &agent_username, &transcript)
            .await
        {
            tracing::error!(
                session_id = %handle.id,
                error = %e,
                "Failed to persist transcript"
            );
        }

        tracing::info!(
            session_id = %handle.id,
            visitor_id = %visitor.visitor_id,
            agent = %agent_username,
            messages = transcript.len(),
            "Session ended"
        );
        Ok(())
    }

    // =========================================================================
    // Disconnect handling
    // =========================================================================

    /// The visitor's connection dropped. The session survives for the grace
    /// period; if they have not reattached by then it ends and the agent is
    /// told the visitor left.
    pub async fn visitor_disconnected(
        self: &Arc<Self>,
        session_id: SessionId,
        presence: Arc<PresenceRegistry>,
    ) {
        let Ok(handle) = self.handle(session_id).await else {
            return;
        };

        let epoch = {
            let mut inner = handle.inner.lock().await;
            inner.visitor_tx = None;
            inner.visitor_epoch += 1;
            inner.visitor_epoch
        };

        tracing::info!(session_id = %session_id, "Visitor disconnected, grace period started");

        let coordinator = Arc::clone(self);
        let grace = self.config.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let Ok(handle) = coordinator.handle(session_id).await else {
                return;
            };
            let (expired, visitor_id) = {
                let inner = handle.inner.lock().await;
                (
                    inner.visitor_tx.is_none() && inner.visitor_epoch == epoch && inner.is_open(),
                    inner.visitor.visitor_id,
                )
            };
            if !expired {
                return;
            }

            tracing::info!(session_id = %session_id, "Visitor grace period expired, ending session");
            let _ = coordinator
                .finish(
                    &handle,
                    None,
                    Some(ServerEvent::UserDisconnect { user_id: visitor_id }),
                    &presence,
                )
                .await;
        });
    }

    /// An agent reconnected and logged back in: hand them their threads,
    /// replaying from their delivery checkpoint, and cancel any pending
    /// agent-side grace timers.
    pub async fn reattach_agent(&self, agent_username: &str, presence: &PresenceRegistry) {
        for handle in self.sessions_for_agent(agent_username).await {
            let mut inner = handle.inner.lock().await;
            if !inner.is_open() {
                continue;
            }
            inner.agent_epoch += 1;

            presence
                .send_to(
                    agent_username,
                    ServerEvent::AssignedUser {
                        user: inner.visitor.clone(),
                    },
                )
                .await;
            let replay =
                inner.replay_from(inner.agent_delivered, &inner.visitor.visitor_id.to_string());
            if presence
                .send_to(
                    agent_username,
                    ServerEvent::Transcript {
                        user_id: Some(inner.visitor.visitor_id),
                        messages: replay,
                    },
                )
                .await
            {
                inner.agent_delivered = inner.transcript.len();
            }
        }
    }

    /// The agent's connection dropped. Their sessions survive the grace
    /// period; if the agent has not returned by then each visitor is pushed
    /// back to the queue with a bypass token and the session ends.
    pub async fn agent_disconnected(
        self: &Arc<Self>,
        agent_username: &str,
        presence: Arc<PresenceRegistry>,
        tokens: Arc<TokenService>,
    ) {
        let handles = self.sessions_for_agent(agent_username).await;
        if handles.is_empty() {
            return;
        }
        tracing::info!(
            agent = %agent_username,
            sessions = handles.len(),
            "Agent disconnected, grace period started for their sessions"
        );

        for handle in handles {
            let epoch = {
                let mut inner = handle.inner.lock().await;
                inner.agent_epoch += 1;
                inner.agent_epoch
            };

            let coordinator = Arc::clone(self);
            let presence = Arc::clone(&presence);
            let tokens = Arc::clone(&tokens);
            let agent = agent_username.to_string();
            let grace = self.config.grace_period;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;

                if presence.is_online(&agent).await {
                    return;
                }
                let Ok(handle) = coordinator.handle(handle.id).await else {
                    return;
                };
                let (expired, visitor) = {
                    let inner = handle.inner.lock().await;
                    (
                        inner.agent_epoch == epoch
                            && inner.agent_username == agent
                            && inner.is_open(),
                        inner.visitor.clone(),
                    )
                };
                if !expired {
                    return;
                }

                tracing::info!(
                    session_id = %handle.id,
                    agent = %agent,
                    "Agent grace period expired, returning visitor to queue"
                );
                let visitor_event = tokens
                    .issue_queue_bypass(&visitor)
                    .map(|token| ServerEvent::Enqueue { token })
                    .unwrap_or(ServerEvent::ChatEnded);
                let _ = coordinator
                    .finish(&handle, Some(visitor_event), None, &presence)
                    .await;
            });
        }
    }

    pub async fn sessions_for_agent(&self, agent_username: &str) -> Vec<Arc<SessionHandle>> {
        let sessions = self.sessions.read().await;
        let mut handles = Vec::new();
        for handle in sessions.values() {
            let inner = handle.inner.lock().await;
            if inner.agent_username == agent_username {
                drop(inner);
                handles.push(Arc::clone(handle));
            }
        }
        handles
    }

    pub async fn active_session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

fn allowed_mime(mime_type: &str) -> bool {
    mime_type.starts_with("image/")
        || mime_type.starts_with("video/")
        || mime_type == "application/pdf"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBlobStore, MemoryTranscriptStore};
    use time::Duration;

    struct Fixture {
        sessions: Arc<SessionCoordinator>,
        presence: Arc<PresenceRegistry>,
        transcripts: Arc<MemoryTranscriptStore>,
        blobs: Arc<MemoryBlobStore>,
    }

    fn fixture() -> Fixture {
        fixture_with(SessionConfig::default())
    }

    fn fixture_with(config: SessionConfig) -> Fixture {
        let blobs = Arc::new(MemoryBlobStore::new());
        let transcripts = Arc::new(MemoryTranscriptStore::new());
        let sessions = Arc::new(SessionCoordinator::new(
            Arc::clone(&blobs) as Arc<dyn BlobStore>,
            Arc::clone(&transcripts) as Arc<dyn TranscriptStore>,
            config,
        ));
        Fixture {
            sessions,
            presence: Arc::new(PresenceRegistry::new(Duration::seconds(60))),
            transcripts,
            blobs,
        }
    }

    fn jane() -> VisitorIdentity {
        VisitorIdentity::new("Jane", "Doe")
    }

    fn agent(username: &str) -> helpdesk_shared::AgentIdentity {
        helpdesk_shared::AgentIdentity {
            username: username.to_string(),
            first_name: username.to_string(),
            last_name: "Agent".to_string(),
            is_admin: false,
        }
    }

    #[tokio::test]
    async fn test_visitor_has_at_most_one_session() {
        let f = fixture();
        let visitor = jane();

        f.sessions
            .create_session(visitor.clone(), "alice")
            .await
            .unwrap();
        let result = f.sessions.create_session(visitor, "bob").await;
        assert!(matches!(
            result,
            Err(CoordinatorError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_relay_appends_and_forwards() {
        let f = fixture();
        let visitor = jane();
        let visitor_id = visitor.visitor_id;

        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel();
        f.presence.mark_online(agent("alice"), agent_tx).await;

        let session_id = f.sessions.create_session(visitor, "alice").await.unwrap();

        let (visitor_tx, mut visitor_rx) = mpsc::unbounded_channel();
        f.sessions
            .attach_visitor(visitor_id, visitor_tx)
            .await
            .unwrap();
        // First event on attach is the (empty) replay
        assert!(matches!(
            visitor_rx.try_recv().unwrap(),
            ServerEvent::Transcript { messages, .. } if messages.is_empty()
        ));

        f.sessions
            .relay_from_visitor(session_id, "hello".to_string(), &f.presence)
            .await
            .unwrap();
        match agent_rx.try_recv().unwrap() {
            ServerEvent::Message(wire) => {
                assert_eq!(wire.message.as_deref(), Some("hello"));
                assert!(wire.is_from_user);
                assert_eq!(wire.correspondent_username, visitor_id.to_string());
            }
            other => panic!("expected message, got {other:?}"),
        }

        f.sessions
            .relay_from_agent("alice", visitor_id, "hi".to_string(), &f.presence)
            .await
            .unwrap();
        match visitor_rx.try_recv().unwrap() {
            ServerEvent::Message(wire) => {
                assert_eq!(wire.message.as_deref(), Some("hi"));
                assert!(!wire.is_from_user);
                assert_eq!(wire.correspondent_username, "alice");
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_agent_cannot_touch_another_agents_session() {
        let f = fixture();
        let visitor = jane();
        let visitor_id = visitor.visitor_id;
        f.sessions.create_session(visitor, "alice").await.unwrap();

        let result = f
            .sessions
            .relay_from_agent("mallory", visitor_id, "hi".to_string(), &f.presence)
            .await;
        assert!(matches!(
            result,
            Err(CoordinatorError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_reconnect_replay_delivers_exactly_once() {
        let f = fixture();
        let visitor = jane();
        let visitor_id = visitor.visitor_id;

        let (agent_tx, _agent_rx) = mpsc::unbounded_channel();
        f.presence.mark_online(agent("alice"), agent_tx).await;
        f.sessions.create_session(visitor, "alice").await.unwrap();

        // Visitor attaches, then their channel dies before delivery
        let (visitor_tx, visitor_rx) = mpsc::unbounded_channel();
        f.sessions
            .attach_visitor(visitor_id, visitor_tx)
            .await
            .unwrap();
        drop(visitor_rx);

        f.sessions
            .relay_from_agent("alice", visitor_id, "hi".to_string(), &f.presence)
            .await
            .unwrap();

        // Reconnect: replay must contain "hi" exactly once
        let (visitor_tx, mut visitor_rx) = mpsc::unbounded_channel();
        f.sessions
            .attach_visitor(visitor_id, visitor_tx)
            .await
            .unwrap();
        match visitor_rx.try_recv().unwrap() {
            ServerEvent::Transcript { messages, .. } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].message.as_deref(), Some("hi"));
            }
            other => panic!("expected transcript, got {other:?}"),
        }

        // A second reconnect after delivery replays nothing
        let (visitor_tx, mut visitor_rx) = mpsc::unbounded_channel();
        f.sessions
            .attach_visitor(visitor_id, visitor_tx)
            .await
            .unwrap();
        match visitor_rx.try_recv().unwrap() {
            ServerEvent::Transcript { messages, .. } => assert!(messages.is_empty()),
            other => panic!("expected transcript, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_replay_from_same_checkpoint_is_idempotent() {
        let f = fixture();
        let visitor = jane();
        let visitor_id = visitor.visitor_id;
        let session_id = f.sessions.create_session(visitor, "alice").await.unwrap();

        for i in 0..3 {
            f.sessions
                .relay_from_visitor(session_id, format!("msg {i}"), &f.presence)
                .await
                .unwrap();
        }

        let handle = f.sessions.session_for_visitor(visitor_id).await.unwrap();
        let inner = handle.inner.lock().await;
        let first = inner.replay_from(1, "alice");
        let second = inner.replay_from(1, "alice");
        assert_eq!(first.len(), 2);
        assert_eq!(
            first.iter().map(|m| (&m.message, m.timestamp)).collect::<Vec<_>>(),
            second.iter().map(|m| (&m.message, m.timestamp)).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_upload_size_boundary() {
        let f = fixture();
        let visitor = jane();
        let session_id = f.sessions.create_session(visitor, "alice").await.unwrap();

        // Exactly at the cap: accepted
        let result = f
            .sessions
            .upload_from_visitor(
                session_id,
                "ok.png".to_string(),
                "image/png".to_string(),
                vec![0u8; 2_000_000],
                None,
                &f.presence,
            )
            .await;
        assert!(result.is_ok());
        assert_eq!(f.blobs.len().await, 1);

        // One byte over: rejected, nothing stored
        let result = f
            .sessions
            .upload_from_visitor(
                session_id,
                "big.png".to_string(),
                "image/png".to_string(),
                vec![0u8; 2_000_001],
                None,
                &f.presence,
            )
            .await;
        assert!(matches!(result, Err(CoordinatorError::UploadRejected(_))));
        assert_eq!(f.blobs.len().await, 1);
    }

    #[tokio::test]
    async fn test_upload_mime_allowlist() {
        let f = fixture();
        let visitor = jane();
        let session_id = f.sessions.create_session(visitor, "alice").await.unwrap();

        for mime in ["image/png", "video/mp4", "application/pdf"] {
            let result = f
                .sessions
                .upload_from_visitor(
                    session_id,
                    "file".to_string(),
                    mime.to_string(),
                    vec![1],
                    None,
                    &f.presence,
                )
                .await;
            assert!(result.is_ok(), "{mime} should be accepted");
        }

        let result = f
            .sessions
            .upload_from_visitor(
                session_id,
                "evil.exe".to_string(),
                "application/octet-stream".to_string(),
                vec![1],
                None,
                &f.presence,
            )
            .await;
        assert!(matches!(result, Err(CoordinatorError::UploadRejected(_))));
    }

    #[tokio::test]
    async fn test_upload_success_echoes_to_uploader() {
        let f = fixture();
        let visitor = jane();
        let visitor_id = visitor.visitor_id;

        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel();
        f.presence.mark_online(agent("alice"), agent_tx).await;
        f.sessions.create_session(visitor, "alice").await.unwrap();

        let (visitor_tx, mut visitor_rx) = mpsc::unbounded_channel();
        f.sessions
            .attach_visitor(visitor_id, visitor_tx)
            .await
            .unwrap();
        let _ = visitor_rx.try_recv(); // initial replay

        let toast = serde_json::json!("toast-7");
        f.sessions
            .upload_from_agent(
                "alice",
                visitor_id,
                "cat.png".to_string(),
                "image/png".to_string(),
                vec![1, 2, 3],
                Some(toast.clone()),
                &f.presence,
            )
            .await
            .unwrap();

        // The counterpart gets the file message, no toast handle
        match visitor_rx.try_recv().unwrap() {
            ServerEvent::Message(wire) => {
                assert!(wire.file.is_some());
                assert!(wire.toast_id.is_none());
            }
            other => panic!("expected message, got {other:?}"),
        }
        // The uploader gets an echo carrying their toast handle, so the
        // client can dismiss its upload toast and render the file bubble
        match agent_rx.try_recv().unwrap() {
            ServerEvent::Message(wire) => {
                assert_eq!(
                    wire.file.as_ref().map(|f| f.file_name.as_str()),
                    Some("cat.png")
                );
                assert_eq!(wire.toast_id, Some(toast));
                assert_eq!(wire.correspondent_username, visitor_id.to_string());
                assert!(!wire.is_from_user);
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_visitor_upload_echoes_back_too() {
        let f = fixture();
        let visitor = jane();
        let visitor_id = visitor.visitor_id;
        f.sessions.create_session(visitor, "alice").await.unwrap();

        let (visitor_tx, mut visitor_rx) = mpsc::unbounded_channel();
        let (session_id, _) = f
            .sessions
            .attach_visitor(visitor_id, visitor_tx)
            .await
            .unwrap();
        let _ = visitor_rx.try_recv(); // initial replay

        let toast = serde_json::json!(42);
        f.sessions
            .upload_from_visitor(
                session_id,
                "receipt.pdf".to_string(),
                "application/pdf".to_string(),
                vec![9],
                Some(toast.clone()),
                &f.presence,
            )
            .await
            .unwrap();

        match visitor_rx.try_recv().unwrap() {
            ServerEvent::Message(wire) => {
                assert_eq!(wire.toast_id, Some(toast));
                assert_eq!(wire.correspondent_username, "alice");
                assert!(wire.is_from_user);
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_blob_store_timeout_fails_upload() {
        struct StallingBlobStore;

        #[async_trait::async_trait]
        impl BlobStore for StallingBlobStore {
            async fn put(
                &self,
                _file_id: FileId,
                _file_name: &str,
                _mime_type: &str,
                _bytes: Vec<u8>,
            ) -> CoordinatorResult<()> {
                tokio::time::sleep(StdDuration::from_secs(3600)).await;
                Ok(())
            }
        }

        let sessions = Arc::new(SessionCoordinator::new(
            Arc::new(StallingBlobStore),
            Arc::new(MemoryTranscriptStore::new()) as Arc<dyn TranscriptStore>,
            SessionConfig {
                blob_timeout: StdDuration::from_millis(20),
                ..SessionConfig::default()
            },
        ));
        let presence = Arc::new(PresenceRegistry::new(Duration::seconds(60)));
        let visitor = jane();
        let visitor_id = visitor.visitor_id;
        let session_id = sessions.create_session(visitor, "alice").await.unwrap();

        let result = sessions
            .upload_from_visitor(
                session_id,
                "slow.png".to_string(),
                "image/png".to_string(),
                vec![1],
                None,
                &presence,
            )
            .await;
        assert!(matches!(result, Err(CoordinatorError::Storage(_))));

        // The transcript never saw the stalled file
        let handle = sessions.session_for_visitor(visitor_id).await.unwrap();
        assert!(handle.inner.lock().await.transcript.is_empty());
    }

    #[tokio::test]
    async fn test_agent_reconnect_replays_from_checkpoint() {
        let f = fixture();
        let visitor = jane();
        let visitor_id = visitor.visitor_id;

        let (agent_tx, agent_rx) = mpsc::unbounded_channel();
        f.presence.mark_online(agent("alice"), agent_tx).await;
        let session_id = f.sessions.create_session(visitor, "alice").await.unwrap();

        f.sessions
            .relay_from_visitor(session_id, "one".to_string(), &f.presence)
            .await
            .unwrap();
        // Agent connection dies after the first message was delivered
        drop(agent_rx);
        f.sessions
            .relay_from_visitor(session_id, "two".to_string(), &f.presence)
            .await
            .unwrap();

        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel();
        f.presence.mark_online(agent("alice"), agent_tx).await;
        f.sessions.reattach_agent("alice", &f.presence).await;

        assert!(matches!(
            agent_rx.try_recv().unwrap(),
            ServerEvent::AssignedUser { .. }
        ));
        // Only the undelivered message comes back
        match agent_rx.try_recv().unwrap() {
            ServerEvent::Transcript { user_id, messages } => {
                assert_eq!(user_id, Some(visitor_id));
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].message.as_deref(), Some("two"));
            }
            other => panic!("expected transcript, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transfer_to_offline_agent_mutates_nothing() {
        let f = fixture();
        let visitor = jane();
        let visitor_id = visitor.visitor_id;
        let session_id = f.sessions.create_session(visitor, "alice").await.unwrap();
        f.sessions
            .relay_from_visitor(session_id, "hello".to_string(), &f.presence)
            .await
            .unwrap();

        let result = f
            .sessions
            .transfer("alice", visitor_id, "bob", &f.presence)
            .await;
        assert!(matches!(result, Err(CoordinatorError::AgentOffline(_))));

        // Session still belongs to alice and still accepts messages
        f.sessions
            .relay_from_agent("alice", visitor_id, "still here".to_string(), &f.presence)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_transfer_preserves_transcript_continuity() {
        let f = fixture();
        let visitor = jane();
        let visitor_id = visitor.visitor_id;

        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        f.presence.mark_online(agent("alice"), alice_tx).await;
        f.presence.mark_online(agent("bob"), bob_tx).await;
        f.presence.increment_sessions("alice").await;

        let session_id = f.sessions.create_session(visitor, "alice").await.unwrap();
        let (visitor_tx, mut visitor_rx) = mpsc::unbounded_channel();
        f.sessions
            .attach_visitor(visitor_id, visitor_tx)
            .await
            .unwrap();
        let _ = visitor_rx.try_recv(); // initial replay

        f.sessions
            .relay_from_visitor(session_id, "help me".to_string(), &f.presence)
            .await
            .unwrap();
        let _ = alice_rx.try_recv();

        f.sessions
            .transfer("alice", visitor_id, "bob", &f.presence)
            .await
            .unwrap();

        // Old agent drops the thread
        assert!(matches!(
            alice_rx.try_recv().unwrap(),
            ServerEvent::UserDisconnect { user_id } if user_id == visitor_id
        ));
        // New agent gets the assignment plus full history
        assert!(matches!(
            bob_rx.try_recv().unwrap(),
            ServerEvent::AssignedUser { .. }
        ));
        match bob_rx.try_recv().unwrap() {
            ServerEvent::Transcript { user_id, messages } => {
                assert_eq!(user_id, Some(visitor_id));
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].message.as_deref(), Some("help me"));
            }
            other => panic!("expected transcript, got {other:?}"),
        }
        // Visitor learns who they are talking to now
        assert!(matches!(
            visitor_rx.try_recv().unwrap(),
            ServerEvent::AgentChanged { username } if username == "bob"
        ));

        // Load moved with the session
        assert_eq!(f.presence.least_loaded(1).await.as_deref(), Some("alice"));

        // Messages keep flowing under the new agent
        f.sessions
            .relay_from_agent("bob", visitor_id, "hi, bob here".to_string(), &f.presence)
            .await
            .unwrap();
        assert!(matches!(
            visitor_rx.try_recv().unwrap(),
            ServerEvent::Message(_)
        ));
    }

    #[tokio::test]
    async fn test_end_chat_persists_and_releases_visitor() {
        let f = fixture();
        let visitor = jane();
        let visitor_id = visitor.visitor_id;

        let session_id = f
            .sessions
            .create_session(visitor.clone(), "alice")
            .await
            .unwrap();
        let (visitor_tx, mut visitor_rx) = mpsc::unbounded_channel();
        f.sessions
            .attach_visitor(visitor_id, visitor_tx)
            .await
            .unwrap();
        let _ = visitor_rx.try_recv();

        f.sessions
            .relay_from_visitor(session_id, "bye".to_string(), &f.presence)
            .await
            .unwrap();
        f.sessions
            .end_chat_by_agent("alice", visitor_id, &f.presence)
            .await
            .unwrap();

        assert!(matches!(
            visitor_rx.try_recv().unwrap(),
            ServerEvent::ChatEnded
        ));
        let persisted = f.transcripts.get(&session_id).await.unwrap();
        assert_eq!(persisted.len(), 1);

        // Visitor is free again: a new session can be created
        assert!(f.sessions.session_for_visitor(visitor_id).await.is_none());
        f.sessions.create_session(visitor, "bob").await.unwrap();
    }

    #[tokio::test]
    async fn test_visitor_grace_expiry_ends_session() {
        let f = fixture_with(SessionConfig {
            grace_period: StdDuration::from_millis(20),
            ..SessionConfig::default()
        });
        let visitor = jane();
        let visitor_id = visitor.visitor_id;

        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel();
        f.presence.mark_online(agent("alice"), agent_tx).await;

        let session_id = f.sessions.create_session(visitor, "alice").await.unwrap();
        let (visitor_tx, visitor_rx) = mpsc::unbounded_channel();
        f.sessions
            .attach_visitor(visitor_id, visitor_tx)
            .await
            .unwrap();
        drop(visitor_rx);

        f.sessions
            .visitor_disconnected(session_id, Arc::clone(&f.presence))
            .await;
        tokio::time::sleep(StdDuration::from_millis(80)).await;

        assert!(f.sessions.session_for_visitor(visitor_id).await.is_none());
        assert!(matches!(
            agent_rx.try_recv().unwrap(),
            ServerEvent::UserDisconnect { user_id } if user_id == visitor_id
        ));
        assert!(f.transcripts.get(&session_id).await.is_some());
    }

    #[tokio::test]
    async fn test_visitor_reconnect_within_grace_keeps_session() {
        let f = fixture_with(SessionConfig {
            grace_period: StdDuration::from_millis(40),
            ..SessionConfig::default()
        });
        let visitor = jane();
        let visitor_id = visitor.visitor_id;

        let session_id = f.sessions.create_session(visitor, "alice").await.unwrap();
        let (visitor_tx, visitor_rx) = mpsc::unbounded_channel();
        f.sessions
            .attach_visitor(visitor_id, visitor_tx)
            .await
            .unwrap();
        drop(visitor_rx);

        f.sessions
            .visitor_disconnected(session_id, Arc::clone(&f.presence))
            .await;

        // Reattach before the grace period lapses
        let (visitor_tx, _visitor_rx) = mpsc::unbounded_channel();
        f.sessions
            .attach_visitor(visitor_id, visitor_tx)
            .await
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        assert!(f.sessions.session_for_visitor(visitor_id).await.is_some());
    }

    #[tokio::test]
    async fn test_transcript_timestamps_non_decreasing() {
        let f = fixture();
        let visitor = jane();
        let visitor_id = visitor.visitor_id;
        let session_id = f.sessions.create_session(visitor, "alice").await.unwrap();

        for i in 0..5 {
            f.sessions
                .relay_from_visitor(session_id, format!("m{i}"), &f.presence)
                .await
                .unwrap();
        }

        let handle = f.sessions.session_for_visitor(visitor_id).await.unwrap();
        let inner = handle.inner.lock().await;
        let timestamps: Vec<i64> = inner.transcript.iter().map(|m| m.timestamp).collect();
        assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    }
}
