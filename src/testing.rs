//! Test doubles for exercising pipelines without a real provider.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::provider::{BatchPoll, ProviderAdapter, ProviderError, ProviderResponse};
use crate::types::{Document, JobTicket, Message, ProviderSpec};

/// Install a tracing subscriber for tests and example pipelines.
///
/// Honors `RUST_LOG`; defaults to `info`. Safe to call more than once (later
/// calls are no-ops).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Default)]
struct ScriptedState {
    replies: VecDeque<Result<ProviderResponse, ProviderError>>,
    dispatch_count: u64,
    batch_count: u64,
    next_job: u64,
    batch_jobs: BTreeMap<String, Document>,
    completed_jobs: BTreeMap<String, BatchPoll>,
}

/// A scripted provider adapter.
///
/// With no script, every dispatch echoes the last text message of the
/// document. Scripted replies (and failures) are consumed in FIFO order and
/// take precedence. Batch jobs stay pending until completed explicitly, so
/// tests control exactly when reconciliation observes results.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    state: Mutex<ScriptedState>,
}

fn echo(document: &Document) -> ProviderResponse {
    let text = document
        .messages()
        .iter()
        .rev()
        .find_map(|message| match message {
            Message::Text { text, .. } => Some(text.clone()),
            _ => None,
        })
        .unwrap_or_default();
    ProviderResponse::text_only(format!("echo: {text}"))
}

impl ScriptedProvider {
    /// Adapter that echoes every prompt.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the next unscripted dispatch.
    pub fn push_reply(&self, text: impl Into<String>) {
        self.state
            .lock()
            .replies
            .push_back(Ok(ProviderResponse::text_only(text)));
    }

    /// Queue a failure for the next dispatch.
    pub fn push_failure(&self, error: ProviderError) {
        self.state.lock().replies.push_back(Err(error));
    }

    /// How many sync/async dispatches reached the provider. The single-flight
    /// and cache-hit properties are asserted against this.
    pub fn dispatch_count(&self) -> u64 {
        self.state.lock().dispatch_count
    }

    /// How many batch jobs were submitted.
    pub fn batch_count(&self) -> u64 {
        self.state.lock().batch_count
    }

    /// Complete one batch job with the given text.
    pub fn complete_job(&self, ticket: &JobTicket, text: impl Into<String>) {
        let mut state = self.state.lock();
        state.batch_jobs.remove(&ticket.0);
        state.completed_jobs.insert(
            ticket.0.clone(),
            BatchPoll::Ready(ProviderResponse::text_only(text)),
        );
    }

    /// Fail one batch job.
    pub fn fail_job(&self, ticket: &JobTicket, error: ProviderError) {
        let mut state = self.state.lock();
        state.batch_jobs.remove(&ticket.0);
        state
            .completed_jobs
            .insert(ticket.0.clone(), BatchPoll::Failed(error));
    }

    /// Complete every outstanding batch job by echoing its document.
    pub fn complete_all_jobs(&self) {
        let mut state = self.state.lock();
        let jobs = std::mem::take(&mut state.batch_jobs);
        for (id, document) in jobs {
            state
                .completed_jobs
                .insert(id, BatchPoll::Ready(echo(&document)));
        }
    }

    fn next_reply(&self, document: &Document) -> Result<ProviderResponse, ProviderError> {
        let mut state = self.state.lock();
        state.dispatch_count += 1;
        match state.replies.pop_front() {
            Some(reply) => reply,
            None => Ok(echo(document)),
        }
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    async fn dispatch_sync(
        &self,
        document: &Document,
        _spec: &ProviderSpec,
    ) -> Result<ProviderResponse, ProviderError> {
        self.next_reply(document)
    }

    async fn dispatch_batch(
        &self,
        document: &Document,
        _spec: &ProviderSpec,
    ) -> Result<JobTicket, ProviderError> {
        let mut state = self.state.lock();
        state.batch_count += 1;
        let id = format!("job-{}", state.next_job);
        state.next_job += 1;
        state.batch_jobs.insert(id.clone(), document.clone());
        Ok(JobTicket(id))
    }

    async fn poll_batch(&self, ticket: &JobTicket) -> Result<BatchPoll, ProviderError> {
        let state = self.state.lock();
        if let Some(poll) = state.completed_jobs.get(&ticket.0) {
            return Ok(poll.clone());
        }
        if state.batch_jobs.contains_key(&ticket.0) {
            return Ok(BatchPoll::Pending);
        }
        Err(ProviderError::Permanent(format!(
            "unknown batch ticket: {ticket}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_by_default() {
        let provider = ScriptedProvider::new();
        let doc = Document::from("hello");
        let spec = ProviderSpec::new("test", "echo-1");
        let response = provider.dispatch_sync(&doc, &spec).await.unwrap();
        assert_eq!(response.text, "echo: hello");
        assert_eq!(provider.dispatch_count(), 1);
    }

    #[tokio::test]
    async fn test_scripted_replies_fifo() {
        let provider = ScriptedProvider::new();
        provider.push_reply("first");
        provider.push_failure(ProviderError::Transient("rate limited".to_string()));

        let doc = Document::from("hello");
        let spec = ProviderSpec::new("test", "echo-1");
        assert_eq!(
            provider.dispatch_sync(&doc, &spec).await.unwrap().text,
            "first"
        );
        assert!(matches!(
            provider.dispatch_sync(&doc, &spec).await,
            Err(ProviderError::Transient(_))
        ));
        // Script exhausted, falls back to echo.
        assert_eq!(
            provider.dispatch_sync(&doc, &spec).await.unwrap().text,
            "echo: hello"
        );
    }

    #[tokio::test]
    async fn test_batch_lifecycle() {
        let provider = ScriptedProvider::new();
        let doc = Document::from("batched");
        let spec = ProviderSpec::new("test", "echo-1");

        let ticket = provider.dispatch_batch(&doc, &spec).await.unwrap();
        assert!(matches!(
            provider.poll_batch(&ticket).await.unwrap(),
            BatchPoll::Pending
        ));

        provider.complete_all_jobs();
        match provider.poll_batch(&ticket).await.unwrap() {
            BatchPoll::Ready(response) => assert_eq!(response.text, "echo: batched"),
            other => panic!("expected Ready, got {other:?}"),
        }
    }
}
