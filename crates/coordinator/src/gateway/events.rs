//! WebSocket event types and serialization
//!
//! One tagged JSON object per frame. Wire names match the help-desk client
//! exactly, which is why the casing is mixed (`join_queue`, `user-login`,
//! `agents_online`, `429`, ...).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use helpdesk_shared::{FileRef, Message, MessageBody, SenderKind, VisitorId, VisitorIdentity};

// =============================================================================
// Client-to-Server Events
// =============================================================================

/// Events sent from client to coordinator
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Fresh queue join (name payload) or bypass-token rejoin
    #[serde(rename = "join_queue")]
    JoinQueue {
        #[serde(default)]
        token: Option<String>,
        #[serde(default, rename = "firstName")]
        first_name: Option<String>,
        #[serde(default, rename = "lastName")]
        last_name: Option<String>,
    },

    /// Visitor presents their chat-auth token to enter the assigned session
    #[serde(rename = "user-login")]
    UserLogin { token: String },

    /// Agent joins the chat pool and becomes eligible for assignment
    #[serde(rename = "agent-login")]
    AgentLogin,

    /// Chat message. Agents address a visitor by `userId`; visitors omit it
    /// (their session has exactly one counterpart). On the messaging
    /// namespace agents address each other by `toUsername`.
    #[serde(rename = "message")]
    Message {
        #[serde(default, rename = "userId")]
        user_id: Option<VisitorId>,
        #[serde(default, rename = "toUsername")]
        to_username: Option<String>,
        message: String,
    },

    /// File attachment, base64-encoded payload
    #[serde(rename = "file-upload")]
    FileUpload {
        #[serde(default, rename = "userId")]
        user_id: Option<VisitorId>,
        name: String,
        #[serde(rename = "fileType")]
        file_type: String,
        file: String,
        /// Opaque client-side toast handle, echoed back on the result
        #[serde(default, rename = "toastId")]
        toast_id: Option<Value>,
    },

    /// Agent ends a session
    #[serde(rename = "end-chat")]
    EndChat {
        #[serde(rename = "userId")]
        user_id: VisitorId,
    },

    /// Agent hands a session to another agent
    #[serde(rename = "transfer")]
    Transfer {
        #[serde(rename = "userId")]
        user_id: VisitorId,
        #[serde(rename = "toUsername")]
        to_username: String,
    },

    /// Messaging namespace: drop a direct-chat thread
    #[serde(rename = "remove-chat")]
    RemoveChat { username: String },

    /// Messaging namespace: fetch the caller's direct-chat threads
    #[serde(rename = "get-chats")]
    GetChats,

    /// Messaging namespace: fetch reachable agent usernames
    #[serde(rename = "get-all-usernames")]
    GetAllUsernames,

    /// Heartbeat
    #[serde(rename = "ping")]
    Ping,
}

// =============================================================================
// Server-to-Client Events
// =============================================================================

/// Events sent from coordinator to client
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Connection-time auth failure; message "auth" tells the client to
    /// re-authenticate once against the auth collaborator
    #[serde(rename = "connect_error")]
    ConnectError { message: String },

    /// Bypass token failed redemption; client restarts the name-entry flow
    #[serde(rename = "bad_auth")]
    BadAuth,

    /// Chat-auth token failed; client returns to the queue
    #[serde(rename = "auth_failed")]
    AuthFailed,

    /// Too many queue joins from this fingerprint
    #[serde(rename = "429")]
    RateLimited,

    /// Number of agents currently online, broadcast to queued visitors
    #[serde(rename = "agents_online")]
    AgentsOnline { count: usize },

    /// Queue finished: the chat-auth token for the assigned session
    #[serde(rename = "done")]
    Done { token: String },

    /// Session is gone but identity is intact: bypass token sends the
    /// visitor back to the queue without re-entering their name
    #[serde(rename = "enqueue")]
    Enqueue { token: String },

    /// Ack for `agent-login`
    #[serde(rename = "started-agent-chat")]
    StartedAgentChat,

    /// Other online agents (transfer candidates), own username excluded
    #[serde(rename = "available_agents")]
    AvailableAgents { agents: Vec<String> },

    /// The queue assigned this visitor to the receiving agent
    #[serde(rename = "assigned_user")]
    AssignedUser {
        #[serde(flatten)]
        user: VisitorIdentity,
    },

    /// Transcript replay. `userId` is set for agents (which thread), absent
    /// for visitors (they have exactly one).
    #[serde(rename = "transcript")]
    Transcript {
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
        user_id: Option<VisitorId>,
        messages: Vec<WireMessage>,
    },

    /// Live-relayed chat message
    #[serde(rename = "message")]
    Message(WireMessage),

    /// Upload rejected or blob store failed; sender dismisses its toast
    #[serde(rename = "upload-failure")]
    UploadFailure {
        #[serde(rename = "toastId", skip_serializing_if = "Option::is_none")]
        toast_id: Option<Value>,
        #[serde(rename = "fileName")]
        file_name: String,
    },

    /// The agent ended the session
    #[serde(rename = "chat-ended")]
    ChatEnded,

    /// The session was transferred; visitor now talks to `username`
    #[serde(rename = "agent-changed")]
    AgentChanged { username: String },

    /// Visitor left (or their grace period expired); agent drops the thread
    #[serde(rename = "user_disconnect")]
    UserDisconnect {
        #[serde(rename = "userId")]
        user_id: VisitorId,
    },

    /// Request-scoped failure (e.g. transfer target offline)
    #[serde(rename = "error")]
    Error { message: String },

    /// Heartbeat response
    #[serde(rename = "pong")]
    Pong,
}

// =============================================================================
// Wire message shape
// =============================================================================

/// Chat message as the client renders it: who it concerns from the
/// recipient's point of view, plus either text or a file reference.
#[derive(Debug, Serialize, Clone)]
pub struct WireMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: i64,
    /// For agents: the visitor's userId. For visitors: the agent's username.
    #[serde(rename = "correspondentUsername")]
    pub correspondent_username: String,
    #[serde(rename = "isFromUser")]
    pub is_from_user: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileRef>,
    /// Set only on the copy echoed back to an uploader, who clears their
    /// upload toast and renders their own file bubble off it
    #[serde(rename = "toastId", skip_serializing_if = "Option::is_none")]
    pub toast_id: Option<Value>,
}

impl WireMessage {
    /// Project a transcript message for one recipient
    pub fn project(msg: &Message, correspondent: &str) -> Self {
        let (message, file) = match &msg.body {
            MessageBody::Text(text) => (Some(text.clone()), None),
            MessageBody::File(file_ref) => (None, Some(file_ref.clone())),
        };
        Self {
            message,
            timestamp: msg.timestamp,
            correspondent_username: correspondent.to_string(),
            is_from_user: msg.sender == SenderKind::Visitor,
            file,
            toast_id: None,
        }
    }
}
