//! The tri-state resolution engine.
//!
//! Pipelines submit calls here and get a [`CallHandle`] back immediately.
//! `resolve()` is the suspension point: it blocks (sync/async) or reports
//! `Pending` (batch) until the store shows the call present, pending, or
//! terminally failed.
//!
//! ## Dispatch decision
//!
//! For every submission the engine consults the store first:
//!
//! - **Present**: cache hit. Zero dispatch, zero duplicate billing.
//! - **Pending**: an identical call is already in flight; the new handle
//!   joins it (at-most-one-in-flight-per-hash).
//! - **Absent**: dispatch through the provider adapter per mode.
//!
//! The decision is single-flight: two tasks racing on an identical
//! `call_hash` produce exactly one provider dispatch and both handles observe
//! the same eventual response.
//!
//! ## Lazy errors
//!
//! In continue/retry modes a failure is recorded against its `call_hash` and
//! surfaced only when that handle is resolved. A pipeline that never resolves
//! a failed handle never observes the failure. Intentional, but a footgun
//! worth knowing about.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::cohort::{
    CohortCoordinator, CohortError, CohortId, MemberToken, Ordering as CohortOrdering,
};
use crate::provider::{BatchPoll, ProviderAdapter, ProviderError};
use crate::store::{CallStore, Resolution, StoreFailure};
use crate::types::{
    CallHash, DocHash, Document, DocumentConversionError, DocumentInput, ErrorKind, ErrorRecord,
    Mode, PendingRecord, ProviderSpec,
};

/// Error type for engine operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// A call settled with a terminal failure (surfaced per error mode).
    #[error("Call failed ({kind}): {message}")]
    CallFailed {
        /// Failure classification.
        kind: ErrorKind,
        /// Detail from the provider or the kernel.
        message: String,
    },
    /// Persistence failure. Always fatal.
    #[error("Storage failure: {0}")]
    Storage(String),
    /// Content mismatch under an identical hash. Always fatal.
    #[error("Hash collision: {0}")]
    HashCollision(String),
    /// Raw input could not be normalized to a document.
    #[error("Invalid document: {0}")]
    Document(#[from] DocumentConversionError),
    /// Cohort bookkeeping failure.
    #[error(transparent)]
    Cohort(#[from] CohortError),
    /// The handle was cancelled locally.
    #[error("Call was cancelled")]
    Cancelled,
    /// Raising resolve variant called on a still-pending call.
    #[error("Call is still pending")]
    StillPending,
}

fn store_err<E: std::error::Error + StoreFailure>(e: E) -> EngineError {
    match e.error_kind() {
        ErrorKind::HashCollision => EngineError::HashCollision(e.to_string()),
        _ => EngineError::Storage(e.to_string()),
    }
}

/// How failures propagate to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorMode {
    /// Any failure surfaces immediately and aborts the submitting call path.
    Fatal,
    /// Failures are recorded per hash; independent calls proceed. Surfaced
    /// lazily on resolve of the failed handle.
    Continue,
    /// Like `Continue`, but transient provider failures are re-dispatched
    /// with exponential backoff before a terminal record is written.
    Retry {
        /// Attempt ceiling (including the first attempt).
        max_attempts: u32,
        /// First backoff delay; doubles per attempt.
        base_delay: Duration,
    },
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Failure propagation policy.
    pub error_mode: ErrorMode,
    /// Batch jobs pending longer than this are failed with `PendingTimeout`
    /// during reconciliation. `None` waits forever.
    pub pending_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            error_mode: ErrorMode::Fatal,
            pending_timeout: None,
        }
    }
}

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Execution mode. Defaults to sync.
    pub mode: Option<Mode>,
    /// Salt perturbing the call identity. Derive from
    /// [`crate::types::CounterState::next_salt`] for replayable defaults.
    pub salt: Option<String>,
    /// Cohort this call belongs to.
    pub cohort: Option<CohortId>,
}

impl SubmitOptions {
    /// Default options: sync, unsalted, no cohort.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the execution mode.
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set the salt.
    pub fn salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    /// Join a cohort.
    pub fn cohort(mut self, cohort: CohortId) -> Self {
        self.cohort = Some(cohort);
        self
    }
}

/// Handle to a submitted call.
///
/// Cheap to clone; carries only references (hashes, tokens) into the store,
/// never a private copy of the result.
#[derive(Debug, Clone)]
pub struct CallHandle {
    call_hash: CallHash,
    doc_hash: DocHash,
    mode: Mode,
    token: Option<MemberToken>,
    standalone_seq: Option<u64>,
    cancelled: Arc<AtomicBool>,
}

impl CallHandle {
    /// Identity of the underlying call.
    pub fn call_hash(&self) -> CallHash {
        self.call_hash
    }

    /// Identity of the input document.
    pub fn doc_hash(&self) -> DocHash {
        self.doc_hash
    }

    /// Execution mode this submission requested.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Mark the handle cancelled locally.
    ///
    /// Cancellation never reaches the provider. A sync/async flight runs to
    /// completion and its result is stored; a batch job keeps running and
    /// stays reconcilable. Only this handle's `resolve()` is affected, and a
    /// later identical submit still joins the in-flight record rather than
    /// re-dispatching.
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
    }

    /// Whether the handle was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
struct SettleMeta {
    token: Option<MemberToken>,
    standalone_seq: Option<u64>,
}

/// Outcome summary of one [`ResolutionEngine::reconcile_batches`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Jobs transcribed as responses.
    pub completed: usize,
    /// Jobs transcribed as terminal errors.
    pub failed: usize,
    /// Jobs still running.
    pub still_pending: usize,
    /// Jobs failed with `PendingTimeout`.
    pub timed_out: usize,
}

struct Shared<S, P> {
    store: Arc<S>,
    provider: Arc<P>,
    cohorts: CohortCoordinator,
    config: EngineConfig,
    /// Per-hash flights owned by this process. Entry removed only after the
    /// result is in the store, so map-presence implies a live flight.
    in_flight: Mutex<HashMap<CallHash, Arc<Notify>>>,
    /// Cohort/seq bookkeeping to apply when a hash settles. Multiple
    /// submissions may share one hash.
    settle_meta: Mutex<HashMap<CallHash, Vec<SettleMeta>>>,
}

/// The resolution engine. See the module docs for the dispatch contract.
pub struct ResolutionEngine<S, P> {
    shared: Arc<Shared<S, P>>,
}

impl<S, P> Clone for ResolutionEngine<S, P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S, P> ResolutionEngine<S, P>
where
    S: CallStore + 'static,
    P: ProviderAdapter + 'static,
{
    /// Create an engine over a store and provider adapter.
    pub fn new(store: Arc<S>, provider: Arc<P>, config: EngineConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                provider,
                cohorts: CohortCoordinator::new(),
                config,
                in_flight: Mutex::new(HashMap::new()),
                settle_meta: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.shared.store
    }

    /// Open a cohort.
    pub fn open_cohort(&self, ordering: CohortOrdering) -> CohortId {
        self.shared.cohorts.open(ordering)
    }

    /// Close a cohort to new members. If nothing is outstanding the cohort
    /// settles immediately and its `seq_id`s are persisted.
    pub async fn close_cohort(&self, cohort: CohortId) -> Result<(), EngineError> {
        if let Some(assignments) = self.shared.cohorts.close(cohort)? {
            Shared::apply_assignments(&self.shared, &assignments).await?;
        }
        Ok(())
    }

    /// Suspend until a cohort settles; returns `(call_hash, seq_id)` in
    /// submission order.
    pub async fn wait_cohort(
        &self,
        cohort: CohortId,
    ) -> Result<Vec<(CallHash, u64)>, EngineError> {
        Ok(self.shared.cohorts.wait_settled(cohort).await?)
    }

    /// The handle's `seq_id`, once observable under its cohort's ordering
    /// rules.
    pub fn seq_id(&self, handle: &CallHandle) -> Result<Option<u64>, EngineError> {
        match &handle.token {
            Some(token) => Ok(self.shared.cohorts.seq_id(token)?),
            None => Ok(handle.standalone_seq),
        }
    }

    /// Submit a call.
    ///
    /// Computes the call identity, registers cohort membership, and makes the
    /// single-flight dispatch decision. Returns a handle immediately in every
    /// mode; only sync mode has already settled by the time it returns.
    pub async fn submit(
        &self,
        input: impl Into<DocumentInput>,
        spec: &ProviderSpec,
        options: SubmitOptions,
    ) -> Result<CallHandle, EngineError> {
        let shared = &self.shared;
        let document = input.into().into_document()?;
        let doc_hash = shared
            .store
            .put_document(&document)
            .await
            .map_err(store_err)?;
        let call_hash = CallHash::compute(&doc_hash, spec, options.salt.as_deref());
        let mode = options.mode.unwrap_or(Mode::Sync);

        // Ordering bookkeeping happens for every submission, cache hit or
        // not, so reruns reproduce the same seq assignment.
        let (token, standalone_seq) = match options.cohort {
            Some(cohort) => (Some(shared.cohorts.register(cohort, call_hash)?), None),
            None => (None, Some(shared.cohorts.next_seq())),
        };
        let meta = SettleMeta {
            token,
            standalone_seq,
        };
        shared
            .settle_meta
            .lock()
            .entry(call_hash)
            .or_default()
            .push(meta);

        let handle = CallHandle {
            call_hash,
            doc_hash,
            mode,
            token,
            standalone_seq,
            cancelled: Arc::new(AtomicBool::new(false)),
        };

        let decision = Self::dispatch_decision(shared, &handle).await?;
        match decision {
            Decision::Settled => {
                debug!(call = %short(&call_hash), "cache hit");
                Shared::settle_all(shared, call_hash).await?;
                Ok(handle)
            }
            Decision::Joined => {
                debug!(call = %short(&call_hash), "joined in-flight call");
                Ok(handle)
            }
            Decision::Dispatch(notify) => {
                info!(call = %short(&call_hash), %mode, provider = %spec.provider_id,
                      model = %spec.model_id, "dispatching");
                // The pending record is visible before the flight starts, so
                // a racing resolve observes Pending, never Absent. Batch
                // records start ticketless; the ticket is filled in once the
                // provider accepts the job.
                let marked = shared
                    .store
                    .put_pending(PendingRecord::new(call_hash, mode, None))
                    .await
                    .map_err(store_err);
                if let Err(e) = marked {
                    shared.in_flight.lock().remove(&call_hash);
                    notify.notify_waiters();
                    return Err(e);
                }
                match mode {
                    Mode::Sync => {
                        Shared::run_flight(
                            shared,
                            call_hash,
                            document,
                            spec.clone(),
                            Mode::Sync,
                            notify,
                        )
                        .await?;
                        // Fatal mode surfaces the failure on the submit path.
                        if shared.config.error_mode == ErrorMode::Fatal {
                            if let Resolution::Failed(record) = shared
                                .store
                                .get_response(&call_hash)
                                .await
                                .map_err(store_err)?
                            {
                                return Err(EngineError::CallFailed {
                                    kind: record.kind,
                                    message: record.message,
                                });
                            }
                        }
                        Ok(handle)
                    }
                    Mode::Async => {
                        let shared = Arc::clone(shared);
                        let spec = spec.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Shared::run_flight(
                                &shared,
                                call_hash,
                                document,
                                spec,
                                Mode::Async,
                                notify,
                            )
                            .await
                            {
                                error!(call = %short(&call_hash), error = %e,
                                       "async flight failed to record its outcome");
                            }
                        });
                        Ok(handle)
                    }
                    Mode::Batch => {
                        Shared::submit_batch(shared, call_hash, &document, spec, notify).await?;
                        Ok(handle)
                    }
                }
            }
        }
    }

    /// Resolve a handle.
    ///
    /// Sync/async handles suspend until the call settles. Batch handles never
    /// block: they report `Pending` until a reconciliation pass has
    /// transcribed the provider job. In fatal mode a terminal failure is
    /// returned as an error; in continue/retry modes it is reported as
    /// [`Resolution::Failed`] for the caller to branch on.
    pub async fn resolve(&self, handle: &CallHandle) -> Result<Resolution, EngineError> {
        let shared = &self.shared;
        loop {
            if handle.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let resolution = shared
                .store
                .get_response(&handle.call_hash)
                .await
                .map_err(store_err)?;
            match resolution {
                Resolution::Present(_) => return Ok(resolution),
                Resolution::Absent => {
                    // A freshly claimed flight may not have written its
                    // pending record yet. Absent with a live local flight
                    // means "asked, in flight", not "never asked".
                    if !shared.in_flight.lock().contains_key(&handle.call_hash) {
                        return Ok(resolution);
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Resolution::Failed(record) => {
                    return if shared.config.error_mode == ErrorMode::Fatal {
                        Err(EngineError::CallFailed {
                            kind: record.kind,
                            message: record.message,
                        })
                    } else {
                        Ok(Resolution::Failed(record))
                    };
                }
                Resolution::Pending(record) => {
                    if record.mode == Mode::Batch {
                        // Never blocks; callers poll or reconcile.
                        return Ok(Resolution::Pending(record));
                    }
                    let notify = shared
                        .in_flight
                        .lock()
                        .get(&handle.call_hash)
                        .map(Arc::clone);
                    match notify {
                        Some(notify) => notify.notified().await,
                        // Flight finished between reads, or the record is a
                        // leftover from a dead process; brief backoff then
                        // re-read.
                        None => tokio::time::sleep(Duration::from_millis(5)).await,
                    }
                }
            }
        }
    }

    /// Raising variant of [`resolve`](Self::resolve): returns the response
    /// text or an error for pending/failed/absent.
    pub async fn resolve_text(&self, handle: &CallHandle) -> Result<String, EngineError> {
        match self.resolve(handle).await? {
            Resolution::Present(response) => Ok(response.text),
            Resolution::Pending(_) => Err(EngineError::StillPending),
            Resolution::Failed(record) => Err(EngineError::CallFailed {
                kind: record.kind,
                message: record.message,
            }),
            Resolution::Absent => Err(EngineError::Storage(
                "call vanished from the store".to_string(),
            )),
        }
    }

    /// Poll every pending batch ticket and transcribe finished jobs into the
    /// store. The explicit reconciliation step batch handles resolve
    /// against.
    pub async fn reconcile_batches(&self) -> Result<ReconcileReport, EngineError> {
        let shared = &self.shared;
        let mut report = ReconcileReport::default();
        let pending = shared.store.list_pending().await.map_err(store_err)?;

        for record in pending {
            let Some(ticket) = record.ticket.clone() else {
                continue;
            };
            match shared.provider.poll_batch(&ticket).await {
                Ok(BatchPoll::Ready(payload)) => {
                    debug!(call = %short(&record.call_hash), %ticket, "batch job ready");
                    shared
                        .store
                        .put_response(payload.into_response(record.call_hash))
                        .await
                        .map_err(store_err)?;
                    Shared::settle_all(shared, record.call_hash).await?;
                    report.completed += 1;
                }
                Ok(BatchPoll::Failed(provider_error)) => {
                    warn!(call = %short(&record.call_hash), %ticket,
                          error = %provider_error, "batch job failed");
                    shared
                        .store
                        .put_error(ErrorRecord::new(
                            record.call_hash,
                            provider_error.error_kind(),
                            provider_error.to_string(),
                        ))
                        .await
                        .map_err(store_err)?;
                    Shared::settle_all(shared, record.call_hash).await?;
                    report.failed += 1;
                }
                Ok(BatchPoll::Pending) => {
                    let timed_out = shared.config.pending_timeout.is_some_and(|limit| {
                        let age = chrono::Utc::now() - record.dispatched_at;
                        age.to_std().map(|age| age > limit).unwrap_or(false)
                    });
                    if timed_out {
                        warn!(call = %short(&record.call_hash), %ticket, "batch job timed out");
                        shared
                            .store
                            .put_error(ErrorRecord::new(
                                record.call_hash,
                                ErrorKind::PendingTimeout,
                                format!("batch job {ticket} exceeded the configured wait"),
                            ))
                            .await
                            .map_err(store_err)?;
                        Shared::settle_all(shared, record.call_hash).await?;
                        report.timed_out += 1;
                    } else {
                        report.still_pending += 1;
                    }
                }
                Err(poll_error) => {
                    // A transient poll failure leaves the record for the next
                    // pass; a permanent one settles the call.
                    if poll_error.error_kind().is_retryable() {
                        warn!(%ticket, error = %poll_error, "batch poll failed; will retry");
                        report.still_pending += 1;
                    } else {
                        shared
                            .store
                            .put_error(ErrorRecord::new(
                                record.call_hash,
                                poll_error.error_kind(),
                                poll_error.to_string(),
                            ))
                            .await
                            .map_err(store_err)?;
                        Shared::settle_all(shared, record.call_hash).await?;
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    async fn dispatch_decision(
        shared: &Arc<Shared<S, P>>,
        handle: &CallHandle,
    ) -> Result<Decision, EngineError> {
        let call_hash = handle.call_hash;

        if shared.in_flight.lock().contains_key(&call_hash) {
            return Ok(Decision::Joined);
        }

        let resolution = shared
            .store
            .get_response(&call_hash)
            .await
            .map_err(store_err)?;
        match resolution {
            Resolution::Present(_) | Resolution::Failed(_) => return Ok(Decision::Settled),
            Resolution::Pending(record) => {
                // A ticketed batch record (or a live local flight) is
                // joinable; a ticketless record with no local flight is a
                // leftover from a crashed run and gets re-dispatched below.
                if record.ticket.is_some() || shared.in_flight.lock().contains_key(&call_hash) {
                    return Ok(Decision::Joined);
                }
            }
            Resolution::Absent => {}
        }

        // Claim the flight. Insertion into the map is the atomic point: the
        // task that inserts dispatches, everyone else joins.
        let notify = {
            let mut in_flight = shared.in_flight.lock();
            if in_flight.contains_key(&call_hash) {
                return Ok(Decision::Joined);
            }
            let notify = Arc::new(Notify::new());
            in_flight.insert(call_hash, Arc::clone(&notify));
            notify
        };

        // Close the race where another task settled the call between our
        // store read and our claim.
        if shared
            .store
            .get_response(&call_hash)
            .await
            .map_err(store_err)?
            .is_settled()
        {
            shared.in_flight.lock().remove(&call_hash);
            notify.notify_waiters();
            return Ok(Decision::Settled);
        }

        Ok(Decision::Dispatch(notify))
    }
}

enum Decision {
    Settled,
    Joined,
    Dispatch(Arc<Notify>),
}

impl<S, P> Shared<S, P>
where
    S: CallStore + 'static,
    P: ProviderAdapter + 'static,
{
    /// Execute a claimed sync/async flight to completion: provider call
    /// (with retry policy), result write, flight release, settle
    /// bookkeeping. The pending record is already in the store.
    async fn run_flight(
        shared: &Arc<Self>,
        call_hash: CallHash,
        document: Document,
        spec: ProviderSpec,
        mode: Mode,
        notify: Arc<Notify>,
    ) -> Result<(), EngineError> {
        let (outcome, attempts) = Self::execute_with_retry(shared, &document, &spec, mode).await;
        let write = match outcome {
            Ok(payload) => shared
                .store
                .put_response(payload.into_response(call_hash))
                .await
                .map_err(store_err),
            Err(provider_error) => shared
                .store
                .put_error(
                    ErrorRecord::new(
                        call_hash,
                        provider_error.error_kind(),
                        provider_error.to_string(),
                    )
                    .with_retries(attempts.saturating_sub(1)),
                )
                .await
                .map_err(store_err),
        };

        // Release the flight before propagating any write failure so joined
        // handles are not left waiting forever.
        shared.in_flight.lock().remove(&call_hash);
        notify.notify_waiters();
        write?;

        Self::settle_all(shared, call_hash).await
    }

    /// Claimed batch flight: provider batch submission, then the ticketless
    /// pending record is rewritten with the provider ticket.
    async fn submit_batch(
        shared: &Arc<Self>,
        call_hash: CallHash,
        document: &Document,
        spec: &ProviderSpec,
        notify: Arc<Notify>,
    ) -> Result<(), EngineError> {
        let dispatched = shared.provider.dispatch_batch(document, spec).await;
        let result = match dispatched {
            Ok(ticket) => {
                debug!(call = %short(&call_hash), %ticket, "batch job submitted");
                shared
                    .store
                    .put_pending(PendingRecord::new(call_hash, Mode::Batch, Some(ticket)))
                    .await
                    .map_err(store_err)
            }
            Err(provider_error) => {
                let write = shared
                    .store
                    .put_error(ErrorRecord::new(
                        call_hash,
                        provider_error.error_kind(),
                        provider_error.to_string(),
                    ))
                    .await
                    .map_err(store_err);
                match write {
                    Ok(()) => Self::settle_all(shared, call_hash).await,
                    Err(e) => Err(e),
                }
            }
        };

        shared.in_flight.lock().remove(&call_hash);
        notify.notify_waiters();
        result
    }

    async fn execute_with_retry(
        shared: &Arc<Self>,
        document: &Document,
        spec: &ProviderSpec,
        mode: Mode,
    ) -> (Result<crate::provider::ProviderResponse, ProviderError>, u32) {
        let (max_attempts, base_delay) = match shared.config.error_mode {
            ErrorMode::Retry {
                max_attempts,
                base_delay,
            } => (max_attempts.max(1), base_delay),
            _ => (1, Duration::ZERO),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match mode {
                Mode::Async => shared.provider.dispatch_async(document, spec).await,
                _ => shared.provider.dispatch_sync(document, spec).await,
            };
            match &outcome {
                Err(e) if e.error_kind().is_retryable() && attempt < max_attempts => {
                    let delay = base_delay * 2u32.saturating_pow(attempt - 1);
                    warn!(attempt, ?delay, error = %e, "transient provider error; retrying");
                    tokio::time::sleep(delay).await;
                }
                _ => return (outcome, attempt),
            }
        }
    }

    /// Apply seq/cohort bookkeeping for every submission of a settled hash.
    async fn settle_all(shared: &Arc<Self>, call_hash: CallHash) -> Result<(), EngineError> {
        let metas = shared
            .settle_meta
            .lock()
            .remove(&call_hash)
            .unwrap_or_default();
        for meta in metas {
            match meta.token {
                Some(token) => {
                    if shared.cohorts.ordering(token.cohort_id)? == CohortOrdering::Relaxed {
                        shared
                            .store
                            .set_seq_id(&call_hash, token.seq_slot)
                            .await
                            .map_err(store_err)?;
                    }
                    if let Some(assignments) = shared.cohorts.mark_settled(&token)? {
                        Self::apply_assignments(shared, &assignments).await?;
                    }
                }
                None => {
                    if let Some(seq) = meta.standalone_seq {
                        shared
                            .store
                            .set_seq_id(&call_hash, seq)
                            .await
                            .map_err(store_err)?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn apply_assignments(
        shared: &Arc<Self>,
        assignments: &[(CallHash, u64)],
    ) -> Result<(), EngineError> {
        for (hash, seq) in assignments {
            shared
                .store
                .set_seq_id(hash, *seq)
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }
}

fn short(hash: &CallHash) -> String {
    hash.to_string()[..12].to_string()
}
