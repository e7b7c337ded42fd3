//! Agent presence registry
//!
//! Tracks which agents are connected and available for assignment. Entries
//! are only mutated by the gateway handler that owns the agent's connection
//! (single writer per key); every other consumer just reads. Liveness is
//! heartbeat-based: an entry whose `last_seen` is older than the heartbeat
//! timeout counts as offline even if the map still holds it.

use std::collections::HashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::{mpsc, RwLock};

use helpdesk_shared::AgentIdentity;

use crate::gateway::events::ServerEvent;

/// One connected agent
struct AgentPresence {
    identity: AgentIdentity,
    last_seen: OffsetDateTime,
    /// Active chat sessions owned by this agent
    session_count: usize,
    /// Channel to the agent's chat connection
    sender: mpsc::UnboundedSender<ServerEvent>,
}

impl AgentPresence {
    fn is_live(&self, timeout: Duration, now: OffsetDateTime) -> bool {
        now - self.last_seen <= timeout
    }
}

/// Registry of online agents, shared across all gateway connections
pub struct PresenceRegistry {
    agents: Arc<RwLock<HashMap<String, AgentPresence>>>,
    heartbeat_timeout: Duration,
}

impl PresenceRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            heartbeat_timeout,
        }
    }

    /// Register an agent's chat connection. Session counts survive a
    /// reconnect within the same registration (the sender is replaced).
    pub async fn mark_online(
        &self,
        identity: AgentIdentity,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) {
        let mut agents = self.agents.write().await;
        let username = identity.username.clone();
        let session_count = agents
            .get(&username)
            .map(|existing| existing.session_count)
            .unwrap_or(0);
        agents.insert(
            username.clone(),
            AgentPresence {
                identity,
                last_seen: OffsetDateTime::now_utc(),
                session_count,
                sender,
            },
        );

        tracing::info!(
            agent = %username,
            online = agents.len(),
            "Agent marked online"
        );
    }

    pub async fn mark_offline(&self, username: &str) {
        let mut agents = self.agents.write().await;
        if agents.remove(username).is_some() {
            tracing::info!(
                agent = %username,
                online = agents.len(),
                "Agent marked offline"
            );
        }
    }

    /// Renew the agent's heartbeat. Called on any inbound activity.
    pub async fn heartbeat(&self, username: &str) {
        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get_mut(username) {
            agent.last_seen = OffsetDateTime::now_utc();
        }
    }

    pub async fn is_online(&self, username: &str) -> bool {
        let agents = self.agents.read().await;
        let now = OffsetDateTime::now_utc();
        agents
            .get(username)
            .map(|a| a.is_live(self.heartbeat_timeout, now))
            .unwrap_or(false)
    }

    pub async fn online_count(&self) -> usize {
        let agents = self.agents.read().await;
        let now = OffsetDateTime::now_utc();
        agents
            .values()
            .filter(|a| a.is_live(self.heartbeat_timeout, now))
            .count()
    }

    /// Online usernames, excluding one (the requester, for transfer lists)
    pub async fn list_online(&self, excluding: Option<&str>) -> Vec<String> {
        let agents = self.agents.read().await;
        let now = OffsetDateTime::now_utc();
        let mut usernames: Vec<String> = agents
            .values()
            .filter(|a| a.is_live(self.heartbeat_timeout, now))
            .map(|a| a.identity.username.clone())
            .filter(|name| Some(name.as_str()) != excluding)
            .collect();
        usernames.sort();
        usernames
    }

    /// Online agent with the fewest sessions and spare capacity, if any
    pub async fn least_loaded(&self, capacity: usize) -> Option<String> {
        let agents = self.agents.read().await;
        let now = OffsetDateTime::now_utc();
        agents
            .values()
            .filter(|a| a.is_live(self.heartbeat_timeout, now) && a.session_count < capacity)
            .min_by_key(|a| (a.session_count, a.identity.username.clone()))
            .map(|a| a.identity.username.clone())
    }

    pub async fn increment_sessions(&self, username: &str) {
        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get_mut(username) {
            agent.session_count += 1;
        }
    }

    pub async fn decrement_sessions(&self, username: &str) {
        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get_mut(username) {
            agent.session_count = agent.session_count.saturating_sub(1);
        }
    }

    /// Send an event to one agent's connection.
    ///
    /// Returns false if the agent is not registered or the channel is closed.
    pub async fn send_to(&self, username: &str, event: ServerEvent) -> bool {
        let agents = self.agents.read().await;
        match agents.get(username) {
            Some(agent) => agent.sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Send each live agent the list of *other* online agents, refreshing
    /// their transfer candidate lists after a presence change.
    pub async fn broadcast_available_agents(&self) {
        let agents = self.agents.read().await;
        let now = OffsetDateTime::now_utc();
        let online: Vec<&AgentPresence> = agents
            .values()
            .filter(|a| a.is_live(self.heartbeat_timeout, now))
            .collect();

        for agent in &online {
            let others: Vec<String> = online
                .iter()
                .filter(|other| other.identity.username != agent.identity.username)
                .map(|other| other.identity.username.clone())
                .collect();
            let _ = agent.sender.send(ServerEvent::AvailableAgents { agents: others });
        }
    }
}
