//! Shared application state

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use time::Duration;

use helpdesk_shared::{RateLimitConfig, RateLimiter};

use crate::auth::TokenService;
use crate::config::Config;
use crate::messaging::MessagingHub;
use crate::presence::PresenceRegistry;
use crate::queue::QueueManager;
use crate::session::{SessionConfig, SessionCoordinator};
use crate::storage::{blob_store_from_config, MemoryTranscriptStore, TranscriptStore};

/// Everything the gateway handlers share, cheap to clone per connection
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub tokens: Arc<TokenService>,
    pub presence: Arc<PresenceRegistry>,
    pub queue: Arc<QueueManager>,
    pub sessions: Arc<SessionCoordinator>,
    pub messaging: Arc<MessagingHub>,
    /// Online-agent count as of the last presence broadcast
    pub last_online_count: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let tokens = Arc::new(TokenService::new(
            &config.jwt_secret,
            Duration::minutes(config.bypass_token_ttl_minutes),
            Duration::minutes(config.chat_token_ttl_minutes),
            Duration::hours(config.agent_token_ttl_hours),
        ));
        let presence = Arc::new(PresenceRegistry::new(Duration::seconds(
            config.heartbeat_timeout_seconds,
        )));
        let queue = Arc::new(QueueManager::new(RateLimiter::new(RateLimitConfig {
            window: Duration::minutes(config.rate_limit_window_minutes),
            max_hits: config.rate_limit_max_joins,
        })));
        let sessions = Arc::new(SessionCoordinator::new(
            blob_store_from_config(config.blob_store_url.as_deref()),
            Arc::new(MemoryTranscriptStore::new()) as Arc<dyn TranscriptStore>,
            SessionConfig {
                grace_period: StdDuration::from_secs(config.session_grace_seconds),
                upload_max_bytes: config.upload_max_bytes,
                blob_timeout: StdDuration::from_secs(config.blob_timeout_seconds),
                message_max_chars: config.message_max_chars,
            },
        ));
        let messaging = Arc::new(MessagingHub::new(config.message_max_chars));

        Self {
            config: Arc::new(config),
            tokens,
            presence,
            queue,
            sessions,
            messaging,
            last_online_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Push the current agent presence to queued visitors (`agents_online`)
    /// and to agents' transfer dialogs (`available_agents`). Called on agent
    /// login and logout edges.
    pub async fn broadcast_presence(&self) {
        let count = self.presence.online_count().await;
        self.last_online_count.store(count, Ordering::Relaxed);
        self.queue.broadcast_agents_online(count).await;
        self.presence.broadcast_available_agents().await;
    }

    /// Presence also changes without a connect or disconnect edge when an
    /// agent goes stale by heartbeat expiry. The periodic tick calls this to
    /// push those transitions out; it broadcasts only when the live count
    /// moved since the last broadcast.
    pub async fn refresh_presence(&self) {
        let count = self.presence.online_count().await;
        if self.last_online_count.swap(count, Ordering::Relaxed) != count {
            self.queue.broadcast_agents_online(count).await;
            self.presence.broadcast_available_agents().await;
        }
    }

    /// One assignment pass, run on the periodic tick and after agent login
    pub async fn assign_waiting_visitors(&self) {
        let assigned = self
            .queue
            .try_assign(
                &self.presence,
                &self.sessions,
                &self.tokens,
                self.config.agent_session_capacity,
            )
            .await;
        if assigned > 0 {
            tracing::debug!(assigned, "Assignment pass matched visitors");
        }
    }
}
