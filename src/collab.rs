//! Collaborator interfaces consumed by the retrieval core.
//!
//! The chat subsystem and the language-model orchestration loop live
//! outside this crate; the core reaches them only through these narrow
//! traits. Implementations are injected into
//! [`RetrievalService::open`](crate::service::RetrievalService::open).

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

/// Chat-message persistence owned by the chat subsystem.
#[async_trait]
pub trait ChatLog: Send + Sync {
    /// Append a message to a conversation's transcript.
    async fn save(&self, scope_id: &str, role: &str, text: &str) -> Result<()>;
}

/// Language-model acknowledgment generation, used only for the
/// conversation-file acknowledgment step.
#[async_trait]
pub trait AckGenerator: Send + Sync {
    async fn generate(&self, scope_id: &str, prompt: &str) -> Result<String>;
}

/// Discards transcript writes. For deployments without transcript wiring.
pub struct NullChatLog;

#[async_trait]
impl ChatLog for NullChatLog {
    async fn save(&self, scope_id: &str, role: &str, _text: &str) -> Result<()> {
        debug!(scope_id, role, "chat log disabled, dropping message");
        Ok(())
    }
}

/// Always fails, which makes the orchestrator fall back to its placeholder
/// acknowledgment text.
pub struct NullAckGenerator;

#[async_trait]
impl AckGenerator for NullAckGenerator {
    async fn generate(&self, _scope_id: &str, _prompt: &str) -> Result<String> {
        anyhow::bail!("acknowledgment generation is not configured")
    }
}
