//! Authentication module for the coordinator

pub mod jwt;

pub use jwt::{Claims, TokenKind, TokenService};
