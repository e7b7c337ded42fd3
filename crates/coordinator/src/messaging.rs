//! Agent-to-agent direct messaging
//!
//! A separate namespace from visitor chat: agents message each other by
//! username, each party keeps their own copy of every thread, and dropping a
//! thread only clears the caller's side. Logs are in-memory; history paging
//! and downloads belong to the external REST collaborator.

use std::collections::HashMap;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};

use helpdesk_shared::now_millis;

/// Events sent from coordinator to a messaging connection
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type")]
pub enum MessagingEvent {
    #[serde(rename = "connect_error")]
    ConnectError { message: String },

    /// All of the caller's direct-chat threads, keyed by peer username
    #[serde(rename = "chats")]
    Chats {
        chats: HashMap<String, Vec<DirectMessage>>,
    },

    /// Usernames reachable on the messaging namespace, caller excluded
    #[serde(rename = "all-usernames")]
    AllUsernames { usernames: Vec<String> },

    /// Live-relayed direct message
    #[serde(rename = "message")]
    Message(DirectMessage),

    #[serde(rename = "pong")]
    Pong,
}

/// One direct message as both parties' logs store it
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct DirectMessage {
    #[serde(rename = "fromUsername")]
    pub from_username: String,
    pub message: String,
    pub timestamp: i64,
}

/// Registry of messaging connections plus per-agent chat logs
pub struct MessagingHub {
    online: RwLock<HashMap<String, mpsc::UnboundedSender<MessagingEvent>>>,
    /// owner -> peer -> log. Each side owns its copy independently.
    chats: RwLock<HashMap<String, HashMap<String, Vec<DirectMessage>>>>,
    message_max_chars: usize,
}

impl MessagingHub {
    pub fn new(message_max_chars: usize) -> Self {
        Self {
            online: RwLock::new(HashMap::new()),
            chats: RwLock::new(HashMap::new()),
            message_max_chars,
        }
    }

    /// Register an agent's messaging connection. A reconnect replaces the
    /// previous channel.
    pub async fn connect(&self, username: &str, tx: mpsc::UnboundedSender<MessagingEvent>) {
        let mut online = self.online.write().await;
        online.insert(username.to_string(), tx);
        tracing::info!(agent = %username, online = online.len(), "Agent joined messaging");
    }

    pub async fn disconnect(&self, username: &str) {
        let mut online = self.online.write().await;
        if online.remove(username).is_some() {
            tracing::info!(agent = %username, online = online.len(), "Agent left messaging");
        }
    }

    /// Record a direct message in both parties' logs and relay it live if
    /// the recipient is connected. Offline recipients see it on their next
    /// thread fetch.
    pub async fn send(&self, from: &str, to: &str, text: String) {
        let text: String = text.chars().take(self.message_max_chars).collect();
        let message = DirectMessage {
            from_username: from.to_string(),
            message: text,
            timestamp: now_millis(),
        };

        {
            let mut chats = self.chats.write().await;
            chats
                .entry(from.to_string())
                .or_default()
                .entry(to.to_string())
                .or_default()
                .push(message.clone());
            chats
                .entry(to.to_string())
                .or_default()
                .entry(from.to_string())
                .or_default()
                .push(message.clone());
        }

        let online = self.online.read().await;
        if let Some(tx) = online.get(to) {
            let _ = tx.send(MessagingEvent::Message(message));
        }
    }

    /// The caller's threads, keyed by peer username
    pub async fn chats_for(&self, username: &str) -> HashMap<String, Vec<DirectMessage>> {
        self.chats
            .read()
            .await
            .get(username)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop the caller's copy of one thread. The peer keeps theirs.
    pub async fn remove_chat(&self, username: &str, peer: &str) {
        let mut chats = self.chats.write().await;
        if let Some(threads) = chats.get_mut(username) {
            threads.remove(peer);
        }
    }

    /// Connected messaging agents, excluding the caller
    pub async fn usernames(&self, excluding: &str) -> Vec<String> {
        let online = self.online.read().await;
        let mut usernames: Vec<String> = online
            .keys()
            .filter(|name| name.as_str() != excluding)
            .cloned()
            .collect();
        usernames.sort();
        usernames
    }
}
