//! # replay-kernel
//!
//! Content-addressed caching and tri-state resolution for LLM call
//! pipelines.
//!
//! The kernel answers one question:
//!
//! > Given a call we may have made before, do we **already know its answer**,
//! > is it **still in flight**, or do we have to **ask the provider**?
//!
//! ## Core Contract
//!
//! 1. Every call has a content-derived identity: `call_hash` over the
//!    document, provider/model/params, and an optional salt
//! 2. Submission is single-flight: concurrent identical calls produce
//!    exactly one provider dispatch
//! 3. `resolve()` is tri-state (`Present | Pending | Failed`), and a batch
//!    call that has not completed is a normal `Pending`, never an error
//! 4. `seq_id` ordering is reproducible across re-runs: strict cohorts defer
//!    assignment behind a counting barrier until every member settles
//!
//! ## Architecture
//!
//! ```text
//! Document → CallHash → ResolutionEngine → CallStore (journal or memory)
//!                           ↓                  ↑
//!                    ProviderAdapter      StageMachine (checkpoints)
//! ```
//!
//! ## Determinism Guarantees
//!
//! - Same messages + same provider spec + same salt → identical `call_hash`
//! - Document hashing is a pure function of content, never of time
//! - Store iteration and serialization order is canonical (`BTreeMap`
//!   throughout)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod canonical;
pub mod cohort;
pub mod engine;
pub mod provider;
pub mod stage;
pub mod store;
pub mod testing;
pub mod types;

// Re-exports
pub use types::{
    CallHash, CounterState, DocHash, Document, DocumentInput, ErrorKind, ErrorRecord, JobTicket,
    Message, MessageHash, Mode, PendingRecord, ProviderSpec, Response, Role, ToolCall,
    default_salt,
};
pub use canonical::{
    condition_hash, normalize_text, sha256_digest, to_canonical_bytes, Digest, CANONICAL_VERSION,
};
pub use cohort::{CohortCoordinator, CohortError, CohortId, MemberToken, Ordering, Phase};
pub use engine::{
    CallHandle, EngineConfig, EngineError, ErrorMode, ReconcileReport, ResolutionEngine,
    SubmitOptions,
};
pub use provider::{BatchPoll, ProviderAdapter, ProviderError, ProviderResponse};
pub use stage::{Stage, StageError, StageMachine, STAGE_BEGIN, STAGE_END};
pub use store::{CallStore, JournalStore, MemoryStore, Resolution, StoreState};
pub use testing::{init_tracing, ScriptedProvider};
