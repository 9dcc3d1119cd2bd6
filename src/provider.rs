//! The provider adapter boundary.
//!
//! The kernel never encodes provider-specific request/response schemas. It
//! requires exactly four operations from an adapter and keys every cache
//! entry by provider id, so identical logical content sent to different
//! providers never cross-contaminates.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::types::{CallHash, Document, ErrorKind, JobTicket, ProviderSpec, Response, ToolCall};

/// Failure reported by a provider adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Network/rate-limit class failure; eligible for retry mode.
    #[error("Transient provider error: {0}")]
    Transient(String),
    /// Malformed or rejected request; never retried.
    #[error("Permanent request error: {0}")]
    Permanent(String),
}

impl ProviderError {
    /// The [`ErrorKind`] this failure maps to.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::TransientProvider,
            Self::Permanent(_) => ErrorKind::PermanentRequest,
        }
    }
}

/// Provider payload before the kernel attaches identity and ordering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderResponse {
    /// Main text content.
    pub text: String,
    /// Structured output, when requested.
    pub structured: Option<Value>,
    /// Tool calls requested by the model.
    pub tool_calls: Vec<ToolCall>,
    /// Provider-side response id.
    pub response_id: Option<String>,
    /// Provider metadata (usage stats, model info, ...).
    pub metadata: BTreeMap<String, Value>,
}

impl ProviderResponse {
    /// Plain text payload shorthand.
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Attach the call identity, producing the storable [`Response`].
    pub fn into_response(self, call_hash: CallHash) -> Response {
        Response {
            call_hash,
            text: self.text,
            structured: self.structured,
            tool_calls: self.tool_calls,
            response_id: self.response_id,
            metadata: self.metadata,
            seq_id: None,
            completed_at: Utc::now(),
        }
    }
}

/// Outcome of polling a batch job.
#[derive(Debug, Clone)]
pub enum BatchPoll {
    /// The job completed; here is its payload.
    Ready(ProviderResponse),
    /// Still running. A normal result, not an error.
    Pending,
    /// The job failed terminally.
    Failed(ProviderError),
}

/// The four operations the kernel requires from a provider.
///
/// Adapters own all marshaling and transport. `dispatch_async` defaults to
/// the sync path; adapters with a genuinely different async endpoint
/// override it.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Execute a call and return its payload.
    async fn dispatch_sync(
        &self,
        document: &Document,
        spec: &ProviderSpec,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Execute a call from a spawned task.
    async fn dispatch_async(
        &self,
        document: &Document,
        spec: &ProviderSpec,
    ) -> Result<ProviderResponse, ProviderError> {
        self.dispatch_sync(document, spec).await
    }

    /// Enqueue a call into a provider batch job; returns the ticket that
    /// identifies the job across process restarts.
    async fn dispatch_batch(
        &self,
        document: &Document,
        spec: &ProviderSpec,
    ) -> Result<JobTicket, ProviderError>;

    /// Check on a batch job.
    async fn poll_batch(&self, ticket: &JobTicket) -> Result<BatchPoll, ProviderError>;
}
