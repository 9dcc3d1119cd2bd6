//! End-to-end pipeline tests: engine + journal store + stage machine,
//! including crash/resume and cross-run reproducibility.

use std::sync::Arc;

use tempfile::tempdir;

use replay_kernel::{
    CallStore, CounterState, EngineConfig, JournalStore, Mode, Ordering, ProviderSpec,
    ResolutionEngine, ScriptedProvider, StageMachine, SubmitOptions, STAGE_BEGIN,
};

fn spec() -> ProviderSpec {
    ProviderSpec::new("test", "echo-1")
}

fn engine(
    store: Arc<JournalStore>,
    provider: Arc<ScriptedProvider>,
) -> ResolutionEngine<JournalStore, ScriptedProvider> {
    ResolutionEngine::new(store, provider, EngineConfig::default())
}

/// Kill the process after `begin` exits but before `middle` exits: on
/// restart, `restore("begin")` reproduces everything computed during begin,
/// and begin's calls are cache hits on the rerun.
#[tokio::test]
async fn test_crash_mid_pipeline_resumes_from_begin_checkpoint() {
    replay_kernel::init_tracing();
    let dir = tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new());

    let begin_hash = {
        let store = Arc::new(JournalStore::open(dir.path()).unwrap());
        let engine = engine(Arc::clone(&store), Arc::clone(&provider));
        let stages = StageMachine::start(Arc::clone(&store));

        let handle = engine
            .submit("work done in begin", &spec(), SubmitOptions::new())
            .await
            .unwrap();
        stages.exit(STAGE_BEGIN).await.unwrap();

        stages.enter("middle").unwrap();
        engine
            .submit("work done in middle", &spec(), SubmitOptions::new())
            .await
            .unwrap();
        // Process dies here: middle never exits, no finish().
        handle.call_hash()
    };
    assert_eq!(provider.dispatch_count(), 2);

    // Restart: roll the store back to the begin snapshot.
    let store = Arc::new(JournalStore::open(dir.path()).unwrap());
    store.restore(STAGE_BEGIN).await.unwrap();
    let engine = engine(Arc::clone(&store), Arc::clone(&provider));

    // Begin's response survived the crash; resubmitting it is a cache hit.
    let replayed = engine
        .submit("work done in begin", &spec(), SubmitOptions::new())
        .await
        .unwrap();
    assert_eq!(replayed.call_hash(), begin_hash);
    assert_eq!(provider.dispatch_count(), 2);
    assert_eq!(
        engine.resolve_text(&replayed).await.unwrap(),
        "echo: work done in begin"
    );

    // Middle's work was rolled back and runs again.
    let redone = engine
        .submit("work done in middle", &spec(), SubmitOptions::new())
        .await
        .unwrap();
    assert_eq!(provider.dispatch_count(), 3);
    assert_eq!(
        engine.resolve_text(&redone).await.unwrap(),
        "echo: work done in middle"
    );
}

/// A batch job ticket outlives the engine that submitted it: a fresh engine
/// over the same journal reconciles and resolves it.
#[tokio::test]
async fn test_batch_ticket_survives_engine_restart() {
    let dir = tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new());

    let call_hash = {
        let store = Arc::new(JournalStore::open(dir.path()).unwrap());
        let engine = engine(store, Arc::clone(&provider));
        let handle = engine
            .submit(
                "overnight job",
                &spec(),
                SubmitOptions::new().mode(Mode::Batch),
            )
            .await
            .unwrap();
        handle.call_hash()
    };

    // New process: the pending record (with its ticket) is still on disk.
    let store = Arc::new(JournalStore::open(dir.path()).unwrap());
    let engine = engine(Arc::clone(&store), Arc::clone(&provider));
    provider.complete_all_jobs();
    let report = engine.reconcile_batches().await.unwrap();
    assert_eq!(report.completed, 1);

    let resolution = store.get_response(&call_hash).await.unwrap();
    assert_eq!(
        resolution.response().unwrap().text,
        "echo: overnight job"
    );
    assert_eq!(provider.batch_count(), 1);
}

/// Rerunning an identical pipeline reproduces identical `seq_id`s without a
/// single new provider dispatch.
#[tokio::test]
async fn test_rerun_reproduces_seq_ids_from_cache() {
    let dir = tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new());

    let run = |store: Arc<JournalStore>, provider: Arc<ScriptedProvider>| async move {
        let engine = engine(store, provider);
        let cohort = engine.open_cohort(Ordering::Strict);
        let options = SubmitOptions::new().mode(Mode::Async).cohort(cohort);
        let a = engine.submit("first", &spec(), options.clone()).await.unwrap();
        let b = engine.submit("second", &spec(), options.clone()).await.unwrap();
        engine.resolve(&a).await.unwrap();
        engine.resolve(&b).await.unwrap();
        engine.close_cohort(cohort).await.unwrap();
        engine.wait_cohort(cohort).await.unwrap()
    };

    let store = Arc::new(JournalStore::open(dir.path()).unwrap());
    let first_run = run(Arc::clone(&store), Arc::clone(&provider)).await;
    assert_eq!(provider.dispatch_count(), 2);

    // Second run over the same journal: all cache hits, same assignment.
    let store = Arc::new(JournalStore::open(dir.path()).unwrap());
    let second_run = run(store, Arc::clone(&provider)).await;
    assert_eq!(provider.dispatch_count(), 2);
    assert_eq!(first_run, second_run);
    assert_eq!(second_run[0].1, 0);
    assert_eq!(second_run[1].1, 1);
}

/// Counter-derived salts make replicates of one prompt distinct calls, and a
/// fresh counter regenerates the same salts so a rerun is free.
#[tokio::test]
async fn test_counter_salted_replicates_replay_for_free() {
    let dir = tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new());
    let store = Arc::new(JournalStore::open(dir.path()).unwrap());
    let engine = engine(store, Arc::clone(&provider));

    let replicate = |counter: &CounterState| {
        SubmitOptions::new().salt(counter.next_salt("brainstorm"))
    };

    let counter = CounterState::new();
    let mut hashes = Vec::new();
    for _ in 0..3 {
        let handle = engine
            .submit("name a vegetable", &spec(), replicate(&counter))
            .await
            .unwrap();
        hashes.push(handle.call_hash());
    }
    assert_eq!(provider.dispatch_count(), 3);
    hashes.sort();
    hashes.dedup();
    assert_eq!(hashes.len(), 3);

    // Same prompt, fresh counter: identical salts, zero new dispatches.
    let counter = CounterState::new();
    for _ in 0..3 {
        engine
            .submit("name a vegetable", &spec(), replicate(&counter))
            .await
            .unwrap();
    }
    assert_eq!(provider.dispatch_count(), 3);
}

/// Stage data saved during a run is readable after a crash, so
/// non-deterministic inputs can be replayed instead of regenerated.
#[tokio::test]
async fn test_stage_data_readable_after_restart() {
    let dir = tempdir().unwrap();

    {
        let store = Arc::new(JournalStore::open(dir.path()).unwrap());
        let stages = StageMachine::start(Arc::clone(&store));
        stages
            .save_data("shuffled_order", &vec!["b", "c", "a"])
            .await
            .unwrap();
        stages.exit(STAGE_BEGIN).await.unwrap();
        // Crash before anything else.
    }

    let store = Arc::new(JournalStore::open(dir.path()).unwrap());
    let stages = StageMachine::start(store);
    let order: Option<Vec<String>> = stages
        .load_data(STAGE_BEGIN, "shuffled_order")
        .await
        .unwrap();
    assert_eq!(
        order,
        Some(vec!["b".to_string(), "c".to_string(), "a".to_string()])
    );
}
