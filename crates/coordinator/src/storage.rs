//! External storage collaborators
//!
//! The coordinator never owns persistence: uploaded file payloads go to a
//! blob store and finished transcripts go to a transcript store, both behind
//! opaque trait interfaces. In-memory implementations back tests and
//! single-process deployments; blobs can also go to an HTTP service.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use helpdesk_shared::{
    CoordinatorError, CoordinatorResult, FileId, Message, SessionId, VisitorIdentity,
};

/// Binary attachment storage
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        file_id: FileId,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> CoordinatorResult<()>;
}

/// Append-only transcript persistence, written once when a session ends
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn persist(
        &self,
        session_id: SessionId,
        visitor: &VisitorIdentity,
        agent_username: &str,
        messages: &[Message],
    ) -> CoordinatorResult<()>;
}

// =============================================================================
// In-memory implementations
// =============================================================================

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<FileId, StoredBlob>>,
}

pub struct StoredBlob {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    pub async fn contains(&self, file_id: &FileId) -> bool {
        self.blobs.read().await.contains_key(file_id)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        file_id: FileId,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> CoordinatorResult<()> {
        let mut blobs = self.blobs.write().await;
        blobs.insert(
            file_id,
            StoredBlob {
                file_name: file_name.to_string(),
                mime_type: mime_type.to_string(),
                bytes,
            },
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryTranscriptStore {
    transcripts: RwLock<HashMap<SessionId, Vec<Message>>>,
}

impl MemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, session_id: &SessionId) -> Option<Vec<Message>> {
        self.transcripts.read().await.get(session_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.transcripts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.transcripts.read().await.is_empty()
    }
}

#[async_trait]
impl TranscriptStore for MemoryTranscriptStore {
    async fn persist(
        &self,
        session_id: SessionId,
        visitor: &VisitorIdentity,
        agent_username: &str,
        messages: &[Message],
    ) -> CoordinatorResult<()> {
        let mut transcripts = self.transcripts.write().await;
        transcripts.insert(session_id, messages.to_vec());
        tracing::info!(
            session_id = %session_id,
            visitor_id = %visitor.visitor_id,
            agent = %agent_username,
            message_count = messages.len(),
            "Transcript persisted"
        );
        Ok(())
    }
}

// =============================================================================
// HTTP blob store client
// =============================================================================

/// Blob store backed by an external HTTP service
pub struct HttpBlobStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(
        &self,
        file_id: FileId,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> CoordinatorResult<()> {
        let url = format!("{}/blobs/{}", self.base_url.trim_end_matches('/'), file_id);
        let response = self
            .client
            .put(&url)
            .header("content-type", mime_type)
            .header("x-file-name", file_name)
            .body(bytes)
            .send()
            .await
            .map_err(|e| CoordinatorError::Storage(format!("blob upload failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CoordinatorError::Storage(format!(
                "blob store returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Pick the blob store implementation for this deployment
pub fn blob_store_from_config(blob_store_url: Option<&str>) -> Arc<dyn BlobStore> {
    match blob_store_url {
        Some(url) => {
            tracing::info!(url = %url, "Using HTTP blob store");
            Arc::new(HttpBlobStore::new(url))
        }
        None => {
            tracing::info!("Using in-memory blob store");
            Arc::new(MemoryBlobStore::new())
        }
    }
}
