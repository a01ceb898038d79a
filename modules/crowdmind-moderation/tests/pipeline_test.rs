//! End-to-end tests for the moderation pipeline over in-memory stores and a
//! scripted analysis service.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::Notify;

use crowdmind_common::{
    AnalysisStatus, Comment, Config, FactualAccuracy, ModerationError, Profile, QueueEntry,
    Thread, ThreadId,
};
use crowdmind_moderation::testing::{
    batch_reply_for, MemoryProfileStore, MemoryThreadStore, ScriptedAnalyzer, UnavailableQueue,
};
use crowdmind_moderation::{AcceptedComment, BatchOutcome, Moderation, QueueStore};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    moderation: Moderation,
    threads: Arc<MemoryThreadStore>,
    profiles: Arc<MemoryProfileStore>,
    analyzer: Arc<ScriptedAnalyzer>,
}

fn batch_only() -> Config {
    Config {
        immediate_analysis: false,
        analysis_delay: Duration::ZERO,
        ..Config::default()
    }
}

fn harness_with(config: Config, queue: QueueStore, analyzer: ScriptedAnalyzer) -> Harness {
    let threads = Arc::new(MemoryThreadStore::new());
    let profiles = Arc::new(MemoryProfileStore::new());
    let analyzer = Arc::new(analyzer);
    let moderation = Moderation::new(
        config,
        queue,
        threads.clone(),
        profiles.clone(),
        analyzer.clone(),
    );
    Harness {
        moderation,
        threads,
        profiles,
        analyzer,
    }
}

fn harness(analyzer: ScriptedAnalyzer) -> Harness {
    harness_with(batch_only(), QueueStore::in_memory(), analyzer)
}

impl Harness {
    /// Store a thread with `n` comments.
    fn thread(&self, id: &str, title: &str, n: usize) -> ThreadId {
        let mut thread = Thread::new(id, title);
        for i in 0..n {
            thread.push_comment(Comment::new("user", format!("{title} comment {i}")));
        }
        self.threads.insert(thread);
        ThreadId::new(id)
    }

    /// Store a thread with `n` comments and queue all of them.
    async fn queued_thread(&self, id: &str, title: &str, n: usize) -> ThreadId {
        let t = self.thread(id, title, n);
        for i in 0..n {
            self.moderation
                .enqueue(&t, i, format!("{title} comment {i}"))
                .await;
        }
        t
    }

    fn statuses(&self, t: &ThreadId) -> Vec<AnalysisStatus> {
        self.threads
            .get(t)
            .unwrap()
            .comments
            .iter()
            .map(|c| c.analysis.relevance_status)
            .collect()
    }

    async fn sweep(&self) -> Vec<(ThreadId, BatchOutcome)> {
        self.moderation.batch().sweep_and_wait().await
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ---------------------------------------------------------------------------
// Trigger scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_queue_triggers_one_batch_of_five() {
    let h = harness(ScriptedAnalyzer::new());
    let t = h.queued_thread("t1", "Transit", 5).await;

    let outcomes = h.sweep().await;

    assert_eq!(outcomes, vec![(t.clone(), BatchOutcome::Applied { analyzed: 5, skipped: 0 })]);
    let calls = h.analyzer.batch_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.len(), 5);
    assert_eq!(calls[0].1[0], "Transit comment 0");
    assert_eq!(calls[0].1[4], "Transit comment 4");
    assert!(h.statuses(&t).iter().all(|s| *s == AnalysisStatus::Completed));
    assert_eq!(h.moderation.queue().length(&t).await, 0);
}

#[tokio::test]
async fn below_thresholds_nothing_triggers() {
    let h = harness(ScriptedAnalyzer::new());
    let t = h.queued_thread("t1", "Transit", 4).await;

    assert!(h.sweep().await.is_empty());
    assert!(!h.moderation.batch().should_trigger(&t).await);
    assert_eq!(h.moderation.queue().length(&t).await, 4);

    h.moderation.enqueue(&t, 4, "fifth").await;
    assert!(h.moderation.batch().should_trigger(&t).await);
}

#[tokio::test]
async fn old_single_comment_triggers_by_age() {
    let h = harness(ScriptedAnalyzer::new());
    let t = h.thread("t2", "Parks", 1);
    let old = Utc::now() - ChronoDuration::seconds(61);
    h.moderation
        .queue()
        .append(&t, QueueEntry::at(0, "Parks comment 0", old))
        .await;

    let outcomes = h.sweep().await;

    assert_eq!(outcomes, vec![(t.clone(), BatchOutcome::Applied { analyzed: 1, skipped: 0 })]);
    assert_eq!(h.analyzer.batch_calls()[0].1.len(), 1);
    assert_eq!(h.statuses(&t), vec![AnalysisStatus::Completed]);
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn service_failure_keeps_queue_for_retry() {
    let h = harness(ScriptedAnalyzer::new().batch_error("connection reset"));
    let t = h.queued_thread("t1", "Budget", 5).await;
    let before = h.moderation.queue().read_all(&t).await;

    let first = h.sweep().await;

    assert_eq!(first, vec![(t.clone(), BatchOutcome::ServiceFailed)]);
    assert_eq!(h.moderation.queue().read_all(&t).await, before);
    assert!(h.statuses(&t).iter().all(|s| *s == AnalysisStatus::Pending));

    let second = h.sweep().await;

    assert_eq!(second, vec![(t.clone(), BatchOutcome::Applied { analyzed: 5, skipped: 0 })]);
    let calls = h.analyzer.batch_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].1, calls[1].1);
}

#[tokio::test]
async fn garbage_reply_clears_queue_and_leaves_comments_pending() {
    let h = harness(ScriptedAnalyzer::new().batch_reply("<html>502 Bad Gateway</html>"));
    let t = h.queued_thread("t1", "Budget", 5).await;

    let outcomes = h.sweep().await;

    assert_eq!(outcomes, vec![(t.clone(), BatchOutcome::Malformed)]);
    assert_eq!(h.moderation.queue().length(&t).await, 0);
    assert!(h.statuses(&t).iter().all(|s| *s == AnalysisStatus::Pending));
}

#[tokio::test]
async fn missing_thread_clears_queue_without_calling_service() {
    let h = harness(ScriptedAnalyzer::new());
    let t = ThreadId::new("gone");
    for i in 0..5 {
        h.moderation.enqueue(&t, i, "orphan").await;
    }

    let outcomes = h.sweep().await;

    assert_eq!(outcomes, vec![(t.clone(), BatchOutcome::ThreadMissing)]);
    assert_eq!(h.moderation.queue().length(&t).await, 0);
    assert!(h.analyzer.batch_calls().is_empty());
}

#[tokio::test]
async fn result_past_end_of_thread_is_skipped() {
    let config = Config {
        batch_size: 3,
        ..batch_only()
    };
    let h = harness_with(config, QueueStore::in_memory(), ScriptedAnalyzer::new());
    let t = h.thread("t1", "Library", 2);
    h.moderation.enqueue(&t, 0, "a").await;
    h.moderation.enqueue(&t, 1, "b").await;
    // Comment 7 was deleted after it was queued.
    h.moderation.enqueue(&t, 7, "deleted").await;

    let outcomes = h.sweep().await;

    assert_eq!(outcomes, vec![(t.clone(), BatchOutcome::Applied { analyzed: 2, skipped: 1 })]);
    assert_eq!(h.statuses(&t), vec![AnalysisStatus::Completed; 2]);
    assert_eq!(h.moderation.queue().length(&t).await, 0);
}

// ---------------------------------------------------------------------------
// Fallback queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enqueue_survives_backend_outage() {
    let h = harness_with(
        batch_only(),
        QueueStore::new(Arc::new(UnavailableQueue)),
        ScriptedAnalyzer::new(),
    );
    let t = h.thread("t1", "Outage", 5);

    for i in 0..4 {
        let outcome = h.moderation.enqueue(&t, i, format!("Outage comment {i}")).await;
        assert!(outcome.queued);
        assert_eq!(outcome.queue_size, i + 1);
    }
    assert!(h.sweep().await.is_empty());

    h.moderation.enqueue(&t, 4, "Outage comment 4").await;
    let outcomes = h.sweep().await;

    assert_eq!(outcomes, vec![(t.clone(), BatchOutcome::Applied { analyzed: 5, skipped: 0 })]);
    assert_eq!(h.moderation.queue().length(&t).await, 0);
}

#[tokio::test]
async fn comment_index_behind_queue_tail_is_not_queued() {
    let h = harness(ScriptedAnalyzer::new());
    let t = h.thread("t1", "Parks", 3);

    assert!(h.moderation.enqueue(&t, 1, "Parks comment 1").await.queued);
    let behind = h.moderation.enqueue(&t, 0, "Parks comment 0").await;
    let repeated = h.moderation.enqueue(&t, 1, "Parks comment 1").await;
    let next = h.moderation.enqueue(&t, 2, "Parks comment 2").await;

    assert!(!behind.queued);
    assert_eq!(behind.queue_size, 1);
    assert!(!repeated.queued);
    assert!(next.queued);
    assert_eq!(next.queue_size, 2);
    let queued: Vec<usize> = h
        .moderation
        .queue()
        .read_all(&t)
        .await
        .iter()
        .map(|e| e.comment_index)
        .collect();
    assert_eq!(queued, vec![1, 2]);
}

// ---------------------------------------------------------------------------
// Result application
// ---------------------------------------------------------------------------

#[tokio::test]
async fn applying_same_result_twice_overwrites() {
    let reply = r#"[{"relevance_score": 64, "has_factual_claims": true, "factual_accuracy": "disputed", "analysis_notes": "Contested figure"}]"#;
    let config = Config {
        batch_size: 1,
        ..batch_only()
    };
    let h = harness_with(
        config,
        QueueStore::in_memory(),
        ScriptedAnalyzer::new().batch_reply(reply).batch_reply(reply),
    );
    let t = h.thread("t1", "Housing", 1);

    h.moderation.enqueue(&t, 0, "Rents rose 90% last year").await;
    h.sweep().await;
    let first = h.moderation.get_analysis(&t, 0).await.unwrap();

    h.moderation.enqueue(&t, 0, "Rents rose 90% last year").await;
    h.sweep().await;
    let second = h.moderation.get_analysis(&t, 0).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(second.relevance_score, Some(64));
    assert_eq!(second.factual_accuracy, Some(FactualAccuracy::Disputed));
    assert_eq!(second.notes, "Contested figure");
    assert_eq!(h.analyzer.batch_calls().len(), 2);
}

#[tokio::test]
async fn display_order_never_moves_analysis_between_indices() {
    let reply = r#"{"comments": [
        {"relevance_score": 15},
        {"relevance_score": 95},
        {"relevance_score": 60},
        {"relevance_score": 95},
        {"relevance_score": 30}
    ]}"#;
    let h = harness(ScriptedAnalyzer::new().batch_reply(reply));
    let t = h.queued_thread("t1", "Schools", 5).await;
    h.sweep().await;

    let before: Vec<_> = futures::future::join_all((0..5).map(|i| h.moderation.get_analysis(&t, i)))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let order = h.moderation.display_order(&t).await.unwrap();
    assert_eq!(order, vec![1, 3, 2, 4, 0]);

    for (i, expected) in before.iter().enumerate() {
        assert_eq!(&h.moderation.get_analysis(&t, i).await.unwrap(), expected);
    }
    let stored: Vec<String> = h.threads.get(&t).unwrap().comments.into_iter().map(|c| c.text).collect();
    assert_eq!(stored[0], "Schools comment 0");
    assert_eq!(stored[4], "Schools comment 4");
}

#[tokio::test]
async fn get_analysis_of_unknown_comment_is_an_error() {
    let h = harness(ScriptedAnalyzer::new());
    let t = h.thread("t1", "Roads", 1);

    let fresh = h.moderation.get_analysis(&t, 0).await.unwrap();
    assert_eq!(fresh.relevance_status, AnalysisStatus::Pending);

    assert!(matches!(
        h.moderation.get_analysis(&t, 5).await,
        Err(ModerationError::CommentIndexMismatch { index: 5, .. })
    ));
    assert!(matches!(
        h.moderation.get_analysis(&ThreadId::new("nope"), 0).await,
        Err(ModerationError::ThreadNotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hung_batch_blocks_only_its_thread_and_is_not_restarted() {
    let gate = Arc::new(Notify::new());
    let h = harness(ScriptedAnalyzer::new().hold_batches_for("Slow", gate.clone()));
    let slow = h.queued_thread("slow", "Slow", 5).await;
    let fast = h.queued_thread("fast", "Fast", 5).await;

    let mut started = h.moderation.batch().sweep().await;
    assert_eq!(started.len(), 2);
    let slow_pos = started.iter().position(|(id, _)| *id == slow).unwrap();
    let (_, slow_handle) = started.remove(slow_pos);
    let (fast_id, fast_handle) = started.remove(0);

    assert_eq!(fast_id, fast);
    assert_eq!(
        fast_handle.await.unwrap(),
        BatchOutcome::Applied { analyzed: 5, skipped: 0 }
    );

    let analyzer = h.analyzer.clone();
    assert!(eventually(|| analyzer.batch_calls().iter().any(|(title, _)| title == "Slow")).await);
    assert!(h.moderation.batch().is_processing(&slow));

    // The next tick skips the busy thread instead of starting it again.
    let again = h.moderation.batch().sweep().await;
    assert!(again.iter().all(|(id, _)| *id != slow));
    let slow_calls = h.analyzer.batch_calls().iter().filter(|(title, _)| title == "Slow").count();
    assert_eq!(slow_calls, 1);

    gate.notify_one();
    assert_eq!(
        slow_handle.await.unwrap(),
        BatchOutcome::Applied { analyzed: 5, skipped: 0 }
    );
    assert!(!h.moderation.batch().is_processing(&slow));
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn periodic_sweep_processes_queues_until_stopped() {
    let config = Config {
        sweep_interval: Duration::from_millis(20),
        ..batch_only()
    };
    let h = harness_with(config, QueueStore::in_memory(), ScriptedAnalyzer::new());
    let t = h.queued_thread("t1", "Transit", 5).await;

    assert!(h.moderation.start_sweep());
    assert!(!h.moderation.start_sweep());
    assert!(h.moderation.is_sweeping());

    let threads = h.threads.clone();
    let done = eventually(|| {
        threads
            .get(&t)
            .map(|thread| thread.comments.iter().all(|c| c.analysis.is_complete()))
            .unwrap_or(false)
    })
    .await;
    assert!(done);

    h.moderation.stop_sweep().await;
    assert!(!h.moderation.is_sweeping());

    // Nothing runs after stop.
    h.queued_thread("t2", "Later", 5).await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(h.moderation.queue().length(&ThreadId::new("t2")).await, 5);
}

#[tokio::test]
async fn shutdown_waits_for_batches_the_sweep_started() {
    let gate = Arc::new(Notify::new());
    let config = Config {
        sweep_interval: Duration::from_millis(20),
        ..batch_only()
    };
    let h = harness_with(
        config,
        QueueStore::in_memory(),
        ScriptedAnalyzer::new().hold_batches_for("Slow", gate.clone()),
    );
    let t = h.queued_thread("slow", "Slow", 5).await;
    let Harness {
        moderation,
        threads,
        analyzer,
        ..
    } = h;
    let moderation = Arc::new(moderation);

    assert!(moderation.start_sweep());
    assert!(eventually(|| !analyzer.batch_calls().is_empty()).await);

    let shutdown = tokio::spawn({
        let moderation = moderation.clone();
        async move { moderation.shutdown().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!shutdown.is_finished());

    gate.notify_one();
    let outcomes = shutdown.await.unwrap();

    assert_eq!(outcomes, vec![(t.clone(), BatchOutcome::Applied { analyzed: 5, skipped: 0 })]);
    assert!(threads.get(&t).unwrap().comments.iter().all(|c| c.analysis.is_complete()));
    assert!(!moderation.is_sweeping());
}

#[tokio::test]
async fn flush_does_not_force_untriggered_queues() {
    let h = harness(ScriptedAnalyzer::new());
    let small = h.queued_thread("small", "Small", 2).await;
    let full = h.queued_thread("full", "Full", 5).await;

    let outcomes = h.moderation.shutdown().await;

    assert_eq!(outcomes, vec![(full.clone(), BatchOutcome::Applied { analyzed: 5, skipped: 0 })]);
    assert_eq!(h.moderation.queue().length(&small).await, 2);
    assert_eq!(h.moderation.queue().length(&full).await, 0);
}

// ---------------------------------------------------------------------------
// Acceptance
// ---------------------------------------------------------------------------

fn immediate_config() -> Config {
    Config {
        immediate_analysis: true,
        analysis_delay: Duration::ZERO,
        ..Config::default()
    }
}

#[tokio::test]
async fn accepted_comment_is_queued_scored_and_analyzed() {
    let h = harness_with(
        immediate_config(),
        QueueStore::in_memory(),
        ScriptedAnalyzer::new(),
    );
    let t = h.thread("t1", "Bikes", 1);
    h.profiles.insert(Profile::new("u1", "ana"));

    let outcome = h
        .moderation
        .accept_comment(AcceptedComment {
            thread_id: t.clone(),
            comment_index: 0,
            text: "Bikes comment 0".into(),
            author_id: "u1".into(),
            toxicity: 12.0,
            bias: 30.0,
        })
        .await
        .unwrap();

    assert!(outcome.enqueue.queued);
    assert_eq!(outcome.enqueue.queue_size, 1);
    assert_eq!(outcome.scores.total_posts, 1);
    assert_eq!(outcome.scores.avg_toxicity, 12.0);
    assert_eq!(outcome.scores.bias_score, 30.0);

    let threads = h.threads.clone();
    assert!(eventually(|| threads.get(&t).unwrap().comments[0].analysis.is_complete()).await);
    let analysis = h.moderation.get_analysis(&t, 0).await.unwrap();
    assert_eq!(analysis.relevance_score, Some(80));
    assert_eq!(h.analyzer.relevance_calls(), 1);
    assert_eq!(h.analyzer.fact_check_calls(), 1);
}

#[tokio::test]
async fn immediate_analysis_can_be_disabled() {
    let h = harness(ScriptedAnalyzer::new());
    let t = h.thread("t1", "Bikes", 1);
    assert!(h.moderation.submit_immediate(&t, 0).is_none());
}

#[tokio::test]
async fn unknown_author_still_gets_comment_queued() {
    let h = harness(ScriptedAnalyzer::new());
    let t = h.thread("t1", "Bikes", 1);

    let result = h
        .moderation
        .accept_comment(AcceptedComment {
            thread_id: t.clone(),
            comment_index: 0,
            text: "Bikes comment 0".into(),
            author_id: "ghost".into(),
            toxicity: 0.0,
            bias: 0.0,
        })
        .await;

    assert!(matches!(result, Err(ModerationError::ProfileNotFound(_))));
    assert_eq!(h.moderation.queue().length(&t).await, 1);
}

#[tokio::test]
async fn scores_average_across_items() {
    let h = harness(ScriptedAnalyzer::new());
    h.profiles.insert(Profile::new("u1", "ana"));

    for toxicity in [10.0, 20.0, 30.0] {
        h.moderation.record_scores("u1", toxicity, 0.0).await.unwrap();
    }

    let scores = h.profiles.get("u1").unwrap().scores;
    assert_eq!(scores.total_posts, 3);
    assert_eq!(scores.avg_toxicity, 20.0);
    assert_eq!(scores.toxicity_score, 20.0);
}

#[tokio::test]
async fn summary_is_cached_between_calls() {
    let h = harness(ScriptedAnalyzer::new());
    let t = h.thread("t1", "Zoning", 2);

    let first = h.moderation.ensure_summary(&t).await.unwrap();
    let second = h.moderation.ensure_summary(&t).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.summary, "2 comments so far");
    assert_eq!(h.analyzer.summary_calls(), 1);
}

#[test]
fn canned_batch_reply_has_one_entry_per_comment() {
    let reply = batch_reply_for(3, 70);
    let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(value["comments"].as_array().unwrap().len(), 3);
}
