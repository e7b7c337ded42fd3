//! Help-Desk Coordinator Library
//!
//! This crate contains the real-time session and queue coordinator: token
//! service, presence registry, wait queue, chat sessions, and the WebSocket
//! gateway binding them to client connections.

pub mod auth;
pub mod config;
pub mod gateway;
pub mod messaging;
pub mod presence;
pub mod queue;
pub mod session;
pub mod state;
pub mod storage;

pub use config::Config;
pub use state::AppState;
