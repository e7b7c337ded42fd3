//! Token issuance, verification, and single-use redemption
//!
//! Three token flavors flow through the coordinator: queue-bypass tokens (let
//! a visitor rejoin the queue without re-entering their name), chat-auth
//! tokens (authorize a visitor to join the session assigned to them), and
//! agent-session tokens (issued by the auth collaborator at login). Bypass
//! and chat-auth tokens are single-use; agent tokens are re-verified on every
//! gateway connection.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use helpdesk_shared::{AgentIdentity, CoordinatorError, CoordinatorResult, VisitorId, VisitorIdentity};

/// Which flavor of token a set of claims belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    QueueBypass,
    ChatAuth,
    AgentSession,
}

impl TokenKind {
    /// Bypass and chat-auth tokens may be redeemed exactly once
    pub fn is_single_use(&self) -> bool {
        matches!(self, TokenKind::QueueBypass | TokenKind::ChatAuth)
    }
}

/// Signed claims. Field names match what the client's `jwtDecode` reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub kind: TokenKind,

    // Visitor claims (queue-bypass and chat-auth)
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<VisitorId>,
    #[serde(rename = "firstName", skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(rename = "lastName", skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    /// Chat-auth only: the agent this visitor was assigned to
    #[serde(rename = "agentUsername", skip_serializing_if = "Option::is_none")]
    pub agent_username: Option<String>,

    // Agent claims (agent-session)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(rename = "isAdmin", skip_serializing_if = "Option::is_none")]
    pub is_admin: Option<bool>,

    /// Issued at
    pub iat: i64,
    /// Expiration
    pub exp: i64,
    /// Token ID, recorded on redemption to reject replay
    pub jti: String,
}

impl Claims {
    /// Reconstruct the visitor identity carried by bypass/chat-auth claims
    pub fn visitor_identity(&self) -> CoordinatorResult<VisitorIdentity> {
        match (&self.user_id, &self.first_name, &self.last_name) {
            (Some(id), Some(first), Some(last)) => Ok(VisitorIdentity {
                visitor_id: *id,
                first_name: first.clone(),
                last_name: last.clone(),
            }),
            _ => Err(CoordinatorError::Auth(
                "token is missing visitor identity claims".to_string(),
            )),
        }
    }

    /// Reconstruct the agent identity carried by agent-session claims
    pub fn agent_identity(&self) -> CoordinatorResult<AgentIdentity> {
        match (&self.username, &self.first_name, &self.last_name) {
            (Some(username), Some(first), Some(last)) => Ok(AgentIdentity {
                username: username.clone(),
                first_name: first.clone(),
                last_name: last.clone(),
                is_admin: self.is_admin.unwrap_or(false),
            }),
            _ => Err(CoordinatorError::Auth(
                "token is missing agent identity claims".to_string(),
            )),
        }
    }
}

/// Token service for issue/verify/redeem operations
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    bypass_ttl: Duration,
    chat_ttl: Duration,
    agent_ttl: Duration,
    /// jti -> exp of already-redeemed single-use tokens. Entries are pruned
    /// once their token would have expired anyway, so the set stays bounded.
    redeemed: Mutex<HashMap<String, i64>>,
}

impl TokenService {
    pub fn new(secret: &str, bypass_ttl: Duration, chat_ttl: Duration, agent_ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            bypass_ttl,
            chat_ttl,
            agent_ttl,
            redeemed: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a queue-bypass token for a visitor who already gave their name
    pub fn issue_queue_bypass(&self, visitor: &VisitorIdentity) -> CoordinatorResult<String> {
        let claims = self.base_claims(TokenKind::QueueBypass, self.bypass_ttl);
        self.sign(Claims {
            user_id: Some(visitor.visitor_id),
            first_name: Some(visitor.first_name.clone()),
            last_name: Some(visitor.last_name.clone()),
            ..claims
        })
    }

    /// Issue a chat-auth token binding a visitor to their assigned agent
    pub fn issue_chat_auth(
        &self,
        visitor: &VisitorIdentity,
        agent_username: &str,
    ) -> CoordinatorResult<String> {
        let claims = self.base_claims(TokenKind::ChatAuth, self.chat_ttl);
        self.sign(Claims {
            user_id: Some(visitor.visitor_id),
            first_name: Some(visitor.first_name.clone()),
            last_name: Some(visitor.last_name.clone()),
            agent_username: Some(agent_username.to_string()),
            ..claims
        })
    }

    /// Issue an agent-session token (normally done by the auth collaborator
    /// at login; the coordinator issues them in tests and dev setups)
    pub fn issue_agent_session(&self, agent: &AgentIdentity) -> CoordinatorResult<String> {
        let claims = self.base_claims(TokenKind::AgentSession, self.agent_ttl);
        self.sign(Claims {
            username: Some(agent.username.clone()),
            first_name: Some(agent.first_name.clone()),
            last_name: Some(agent.last_name.clone()),
            is_admin: Some(agent.is_admin),
            ..claims
        })
    }

    /// Validate signature and expiry. Re-verifiable, does not consume.
    pub fn verify(&self, token: &str) -> CoordinatorResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60; // 60 second clock skew tolerance
        validation.validate_aud = false;

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => CoordinatorError::TokenExpired,
                _ => CoordinatorError::Auth("invalid token".to_string()),
            })
    }

    /// Validate an agent-session token and extract the agent identity
    pub fn verify_agent(&self, token: &str) -> CoordinatorResult<AgentIdentity> {
        let claims = self.verify(token)?;
        if claims.kind != TokenKind::AgentSession {
            return Err(CoordinatorError::Auth("wrong token kind".to_string()));
        }
        claims.agent_identity()
    }

    /// Redeem a single-use token. The second redemption of the same token
    /// fails with `AlreadyRedeemed`.
    pub fn redeem(&self, token: &str) -> CoordinatorResult<Claims> {
        let claims = self.verify(token)?;
        if !claims.kind.is_single_use() {
            return Err(CoordinatorError::Auth(
                "token kind is not redeemable".to_string(),
            ));
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let mut redeemed = match self.redeemed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Expired entries can no longer be replayed (verify rejects them),
        // drop them to keep the set bounded by the token TTL
        redeemed.retain(|_, exp| *exp > now);

        if redeemed.contains_key(&claims.jti) {
            tracing::warn!(jti = %claims.jti, kind = ?claims.kind, "Token replay rejected");
            return Err(CoordinatorError::AlreadyRedeemed);
        }
        redeemed.insert(claims.jti.clone(), claims.exp);

        tracing::debug!(jti = %claims.jti, kind = ?claims.kind, "Token redeemed");
        Ok(claims)
    }

    fn base_claims(&self, kind: TokenKind, ttl: Duration) -> Claims {
        let now = OffsetDateTime::now_utc();
        Claims {
            kind,
            user_id: None,
            first_name: None,
            last_name: None,
            agent_username: None,
            username: None,
            is_admin: None,
            iat: now.unix_timestamp(),
            exp: (now + ttl).unix_timestamp(),
            jti: Uuid::new_v4().to_string(),
        }
    }

    fn sign(&self, claims: Claims) -> CoordinatorResult<String> {
        // Explicit algorithm prevents algorithm confusion attacks
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| CoordinatorError::Internal(format!("token encoding failed: {e}")))
    }
}
