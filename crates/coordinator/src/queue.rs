//! Visitor waiting queue and assignment
//!
//! Visitors wait here until an agent with spare capacity is online. Ordering
//! is strict arrival order: a `(enqueued_at, seq)` pair stamps every entry so
//! assignment always picks the earliest waiter even if the backing structure
//! were ever reordered. Assignment is driven by a periodic tick plus an
//! immediate pass whenever an agent logs in.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{mpsc, RwLock};

use helpdesk_shared::{
    CoordinatorError, CoordinatorResult, RateLimiter, VisitorId, VisitorIdentity,
};

use crate::auth::TokenService;
use crate::gateway::events::ServerEvent;
use crate::presence::PresenceRegistry;
use crate::session::SessionCoordinator;

struct QueueEntry {
    identity: VisitorIdentity,
    enqueued_at: OffsetDateTime,
    seq: u64,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

/// FIFO queue of visitors waiting for an agent
pub struct QueueManager {
    entries: RwLock<Vec<QueueEntry>>,
    limiter: RateLimiter,
    seq: AtomicU64,
}

impl QueueManager {
    pub fn new(limiter: RateLimiter) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            limiter,
            seq: AtomicU64::new(0),
        }
    }

    /// Add a visitor to the queue.
    ///
    /// The fingerprint is rate-limited; a visitor already queued keeps their
    /// original position and only gets their connection channel replaced
    /// (reconnect must not reset queue progress).
    pub async fn enqueue(
        &self,
        identity: VisitorIdentity,
        fingerprint: &str,
        tx: mpsc::UnboundedSender<ServerEvent>,
    ) -> CoordinatorResult<()> {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries
            .iter_mut()
            .find(|e| e.identity.visitor_id == identity.visitor_id)
        {
            existing.tx = tx;
            tracing::info!(
                visitor_id = %identity.visitor_id,
                "Visitor reconnected to existing queue entry"
            );
            return Ok(());
        }

        if !self.limiter.check(fingerprint) {
            tracing::warn!(fingerprint = %fingerprint, "Queue join rate limited");
            return Err(CoordinatorError::RateLimited);
        }

        entries.push(QueueEntry {
            identity: identity.clone(),
            enqueued_at: OffsetDateTime::now_utc(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            tx,
        });
        tracing::info!(
            visitor_id = %identity.visitor_id,
            depth = entries.len(),
            "Visitor enqueued"
        );
        Ok(())
    }

    /// Drop a visitor's entry, typically when their queue connection closes
    pub async fn remove(&self, visitor_id: VisitorId) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.identity.visitor_id != visitor_id);
        if entries.len() < before {
            tracing::info!(
                visitor_id = %visitor_id,
                depth = entries.len(),
                "Visitor left the queue"
            );
        }
    }

    pub async fn depth(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn contains(&self, visitor_id: VisitorId) -> bool {
        self.entries
            .read()
            .await
            .iter()
            .any(|e| e.identity.visitor_id == visitor_id)
    }

    /// Tell every waiting visitor how many agents are online
    pub async fn broadcast_agents_online(&self, count: usize) {
        let entries = self.entries.read().await;
        for entry in entries.iter() {
            let _ = entry.tx.send(ServerEvent::AgentsOnline { count });
        }
    }

    /// Match waiting visitors with available agents, earliest waiter first.
    ///
    /// Each match creates a session, mints the visitor's chat-auth token, and
    /// notifies both sides. Returns how many visitors were assigned.
    pub async fn try_assign(
        &self,
        presence: &Arc<PresenceRegistry>,
        sessions: &Arc<SessionCoordinator>,
        tokens: &TokenService,
        capacity: usize,
    ) -> usize {
        let mut assigned = 0;

        loop {
            let Some(agent_username) = presence.least_loaded(capacity).await else {
                break;
            };

            let entry = {
                let mut entries = self.entries.write().await;
                // Entries whose connection already closed can never receive
                // their token; drop them instead of assigning a dead visitor
                entries.retain(|e| !e.tx.is_closed());

                let Some(index) = entries
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, e)| (e.enqueued_at, e.seq))
                    .map(|(i, _)| i)
                else {
                    break;
                };
                entries.remove(index)
            };

            let token = match tokens.issue_chat_auth(&entry.identity, &agent_username) {
                Ok(token) => token,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to mint chat-auth token");
                    break;
                }
            };

            let session_id = match sessions
                .create_session(entry.identity.clone(), &agent_username)
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    // Stale duplicate (visitor already in a session); skip it
                    tracing::warn!(
                        visitor_id = %entry.identity.visitor_id,
                        error = %e,
                        "Skipping unassignable queue entry"
                    );
                    continue;
                }
            };

            presence.increment_sessions(&agent_username).await;
            presence
                .send_to(
                    &agent_username,
                    ServerEvent::AssignedUser {
                        user: entry.identity.clone(),
                    },
                )
                .await;

            if entry.tx.send(ServerEvent::Done { token }).is_err() {
                // Visitor vanished between the prune and the send; let the
                // grace machinery reclaim the session they never joined
                sessions
                    .visitor_disconnected(session_id, Arc::clone(presence))
                    .await;
            }

            tracing::info!(
                visitor_id = %entry.identity.visitor_id,
                agent = %agent_username,
                session_id = %session_id,
                "Visitor assigned to agent"
            );
            assigned += 1;
        }

        assigned
    }
}
