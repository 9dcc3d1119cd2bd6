//! Call identity and the records a call moves through: pending, response,
//! error.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::{canonical_hash_hex, condition_hash, sha256_digest, Digest};
use crate::types::document::DocHash;

/// Execution mode of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Block the submitting task until the provider returns.
    Sync,
    /// Dispatch without blocking; `resolve()` is the suspension point.
    Async,
    /// Defer to a provider batch job; results arrive via reconciliation.
    Batch,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Async => write!(f, "async"),
            Self::Batch => write!(f, "batch"),
        }
    }
}

/// Which provider and model a call targets, plus request parameters.
///
/// The provider id participates in the call identity, so identical logical
/// content sent to two providers never produces a false cache hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Provider identifier, e.g. `openai`.
    pub provider_id: String,
    /// Model identifier, e.g. `gpt-4o-mini`.
    pub model_id: String,
    /// Request parameters (temperature, max tokens, ...). BTreeMap so the
    /// fingerprint is order-independent.
    pub params: BTreeMap<String, Value>,
}

impl ProviderSpec {
    /// Spec with no extra parameters.
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            params: BTreeMap::new(),
        }
    }

    /// Builder-style parameter insertion.
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Cheap fingerprint of the parameter map (xxh64 hex). Feeds the call
    /// identity; not itself content-addressed.
    pub fn params_hash(&self) -> String {
        canonical_hash_hex(&self.params)
    }
}

/// Content-derived identity of a call.
///
/// Incorporates the document, provider/model/params, and an optional salt.
/// Identical `CallHash` means eligible for cache reuse: the engine never
/// re-issues a call whose hash already has a settled response.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CallHash(Digest);

impl CallHash {
    /// Compute the identity of a call.
    ///
    /// The unsalted base covers `(doc_hash, provider_id, model_id,
    /// params_hash)`; a salt, when present, perturbs the base through
    /// [`condition_hash`] so deliberately distinct calls over identical input
    /// stay replayable.
    pub fn compute(doc_hash: &DocHash, spec: &ProviderSpec, salt: Option<&str>) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"replay-kernel/call/v1");
        buf.extend_from_slice(doc_hash.as_digest().as_bytes());
        for field in [&spec.provider_id, &spec.model_id, &spec.params_hash()] {
            buf.extend_from_slice(&(field.len() as u64).to_le_bytes());
            buf.extend_from_slice(field.as_bytes());
        }
        let base = sha256_digest(&buf);
        match salt {
            Some(salt) => Self(condition_hash(&base, salt)),
            None => Self(base),
        }
    }

    /// Wrap a raw digest.
    pub fn from_digest(digest: Digest) -> Self {
        Self(digest)
    }

    /// The underlying digest.
    pub fn as_digest(&self) -> &Digest {
        &self.0
    }
}

impl fmt::Display for CallHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Provider-side identifier for a submitted batch job. Outlives the
/// submitting process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobTicket(pub String);

impl fmt::Display for JobTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A dispatched-but-unsettled call.
///
/// Removed once a response or terminal error is stored for the hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRecord {
    /// Identity of the in-flight call.
    pub call_hash: CallHash,
    /// Execution mode it was dispatched under.
    pub mode: Mode,
    /// Provider batch ticket, for batch mode.
    pub ticket: Option<JobTicket>,
    /// When the call was dispatched.
    pub dispatched_at: DateTime<Utc>,
}

impl PendingRecord {
    /// Record for a freshly dispatched call.
    pub fn new(call_hash: CallHash, mode: Mode, ticket: Option<JobTicket>) -> Self {
        Self {
            call_hash,
            mode,
            ticket,
            dispatched_at: Utc::now(),
        }
    }
}

/// A tool/function call requested by the model inside a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool name.
    pub name: String,
    /// Provider-assigned id for this invocation.
    pub call_id: String,
    /// Arguments as structured JSON.
    pub arguments: Value,
}

/// Result of a settled call. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Identity of the call this answers.
    pub call_hash: CallHash,
    /// Main text content.
    pub text: String,
    /// Structured output, when the call requested a schema.
    pub structured: Option<Value>,
    /// Tool calls requested by the model.
    pub tool_calls: Vec<ToolCall>,
    /// Provider-side response id.
    pub response_id: Option<String>,
    /// Provider metadata (usage stats, model info, ...).
    pub metadata: BTreeMap<String, Value>,
    /// Logical ordering identifier; assigned per cohort policy.
    pub seq_id: Option<u64>,
    /// When the result settled.
    pub completed_at: DateTime<Utc>,
}

impl Response {
    /// Plain text response shorthand.
    pub fn text_only(call_hash: CallHash, text: impl Into<String>) -> Self {
        Self {
            call_hash,
            text: text.into(),
            structured: None,
            tool_calls: Vec::new(),
            response_id: None,
            metadata: BTreeMap::new(),
            seq_id: None,
            completed_at: Utc::now(),
        }
    }
}

/// Classification of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network/rate-limit failure; retryable.
    TransientProvider,
    /// Malformed or rejected request; never retried.
    PermanentRequest,
    /// Detected content mismatch under an identical hash. Internal invariant
    /// violation, always fatal.
    HashCollision,
    /// Persistence failure, always fatal.
    Storage,
    /// Batch job exceeded the configured wait.
    PendingTimeout,
}

impl ErrorKind {
    /// Whether retry mode may re-dispatch this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientProvider)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransientProvider => write!(f, "transient_provider"),
            Self::PermanentRequest => write!(f, "permanent_request"),
            Self::HashCollision => write!(f, "hash_collision"),
            Self::Storage => write!(f, "storage"),
            Self::PendingTimeout => write!(f, "pending_timeout"),
        }
    }
}

/// Terminal or retryable failure keyed by call hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Identity of the failed call.
    pub call_hash: CallHash,
    /// Failure classification.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// Attempts consumed before this record was written.
    pub retry_count: u32,
    /// When the failure was recorded.
    pub occurred_at: DateTime<Utc>,
}

impl ErrorRecord {
    /// Record a failure.
    pub fn new(call_hash: CallHash, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            call_hash,
            kind,
            message: message.into(),
            retry_count: 0,
            occurred_at: Utc::now(),
        }
    }

    /// Attach the retry count consumed before recording.
    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}
