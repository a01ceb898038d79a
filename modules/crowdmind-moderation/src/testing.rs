// Test mocks for the moderation pipeline.
//
// One mock per trait boundary:
// - MemoryThreadStore (ThreadStore): HashMap of threads, optional save failures
// - MemoryProfileStore (ProfileStore): HashMap of profiles
// - ScriptedAnalyzer (AnalysisService): queued replies per call kind, canned defaults
// - UnavailableQueue (QueueBackend): every call fails, as with a dead database
// - FlakyQueue (QueueBackend): MemoryQueue with switchable append/read failures

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::Notify;

use crowdmind_common::{Profile, QueueEntry, Thread, ThreadId};

use crate::analyzer::{AnalysisService, ThreadContext};
use crate::queue::{MarkedEntries, MemoryQueue, QueueBackend};
use crate::store::{ProfileStore, ThreadStore};

// ---------------------------------------------------------------------------
// MemoryThreadStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryThreadStore {
    threads: Mutex<HashMap<ThreadId, Thread>>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, thread: Thread) {
        self.threads.lock().unwrap().insert(thread.id.clone(), thread);
    }

    pub fn get(&self, id: &ThreadId) -> Option<Thread> {
        self.threads.lock().unwrap().get(id).cloned()
    }

    pub fn remove(&self, id: &ThreadId) {
        self.threads.lock().unwrap().remove(id);
    }

    /// Apply `f` to the stored thread, as another writer would.
    pub fn update(&self, id: &ThreadId, f: impl FnOnce(&mut Thread)) {
        if let Some(thread) = self.threads.lock().unwrap().get_mut(id) {
            f(thread);
        }
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ThreadStore for MemoryThreadStore {
    async fn find_thread(&self, id: &ThreadId) -> Result<Option<Thread>> {
        Ok(self.get(id))
    }

    async fn save_thread(&self, thread: &Thread) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            bail!("MemoryThreadStore: save rejected");
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.insert(thread.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryProfileStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: Mutex<HashMap<String, Profile>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: Profile) {
        self.profiles
            .lock()
            .unwrap()
            .insert(profile.user_id.clone(), profile);
    }

    pub fn get(&self, user_id: &str) -> Option<Profile> {
        self.profiles.lock().unwrap().get(user_id).cloned()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn find_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let profile = self.get(user_id);
        // Suspend like a real store round trip so concurrent callers interleave.
        tokio::task::yield_now().await;
        Ok(profile)
    }

    async fn save_profile(&self, profile: &Profile) -> Result<()> {
        self.insert(profile.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptedAnalyzer
// ---------------------------------------------------------------------------

type Reply = std::result::Result<String, String>;

#[derive(Default)]
struct Script {
    batch: VecDeque<Reply>,
    relevance: VecDeque<Reply>,
    fact_check: VecDeque<Reply>,
    summary: VecDeque<Reply>,
}

/// Replies are consumed in order per call kind. Once a kind's script runs
/// out, a well-formed canned reply is returned. Builder pattern:
/// `.batch_reply()`, `.relevance_error()`, `.hold_batches_for()`, ...
#[derive(Default)]
pub struct ScriptedAnalyzer {
    script: Mutex<Script>,
    holds: HashMap<String, Arc<Notify>>,
    batch_calls: Mutex<Vec<(String, Vec<String>)>>,
    relevance_calls: AtomicUsize,
    fact_check_calls: AtomicUsize,
    summary_calls: AtomicUsize,
}

impl ScriptedAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_reply(mut self, raw: &str) -> Self {
        self.script.get_mut().unwrap().batch.push_back(Ok(raw.to_string()));
        self
    }

    pub fn batch_error(mut self, message: &str) -> Self {
        self.script.get_mut().unwrap().batch.push_back(Err(message.to_string()));
        self
    }

    pub fn relevance_reply(mut self, raw: &str) -> Self {
        self.script.get_mut().unwrap().relevance.push_back(Ok(raw.to_string()));
        self
    }

    pub fn relevance_error(mut self, message: &str) -> Self {
        self.script.get_mut().unwrap().relevance.push_back(Err(message.to_string()));
        self
    }

    pub fn fact_check_reply(mut self, raw: &str) -> Self {
        self.script.get_mut().unwrap().fact_check.push_back(Ok(raw.to_string()));
        self
    }

    pub fn fact_check_error(mut self, message: &str) -> Self {
        self.script.get_mut().unwrap().fact_check.push_back(Err(message.to_string()));
        self
    }

    pub fn summary_reply(mut self, raw: &str) -> Self {
        self.script.get_mut().unwrap().summary.push_back(Ok(raw.to_string()));
        self
    }

    pub fn summary_error(mut self, message: &str) -> Self {
        self.script.get_mut().unwrap().summary.push_back(Err(message.to_string()));
        self
    }

    /// Batch calls for the thread titled `title` wait until `gate` is notified.
    pub fn hold_batches_for(mut self, title: &str, gate: Arc<Notify>) -> Self {
        self.holds.insert(title.to_string(), gate);
        self
    }

    /// `(thread title, comment texts)` for every batch call so far.
    pub fn batch_calls(&self) -> Vec<(String, Vec<String>)> {
        self.batch_calls.lock().unwrap().clone()
    }

    pub fn relevance_calls(&self) -> usize {
        self.relevance_calls.load(Ordering::SeqCst)
    }

    pub fn fact_check_calls(&self) -> usize {
        self.fact_check_calls.load(Ordering::SeqCst)
    }

    pub fn summary_calls(&self) -> usize {
        self.summary_calls.load(Ordering::SeqCst)
    }

    fn next(&self, pick: impl FnOnce(&mut Script) -> Option<Reply>) -> Option<Result<String>> {
        let mut script = self.script.lock().unwrap();
        pick(&mut script).map(|reply| reply.map_err(|e| anyhow!(e)))
    }
}

/// One well-formed batch result per comment.
pub fn batch_reply_for(count: usize, relevance: u8) -> String {
    let items: Vec<String> = (0..count)
        .map(|i| {
            format!(
                r#"{{"relevance_score": {relevance}, "has_factual_claims": false, "factual_accuracy": "unverifiable", "analysis_notes": "item {i}"}}"#
            )
        })
        .collect();
    format!(r#"{{"comments": [{}]}}"#, items.join(", "))
}

#[async_trait]
impl AnalysisService for ScriptedAnalyzer {
    async fn analyze_batch(&self, thread: &ThreadContext, comments: &[String]) -> Result<String> {
        self.batch_calls
            .lock()
            .unwrap()
            .push((thread.title.clone(), comments.to_vec()));
        if let Some(gate) = self.holds.get(&thread.title) {
            gate.notified().await;
        }
        self.next(|s| s.batch.pop_front())
            .unwrap_or_else(|| Ok(batch_reply_for(comments.len(), 75)))
    }

    async fn check_relevance(&self, _thread: &ThreadContext, _comment: &str) -> Result<String> {
        self.relevance_calls.fetch_add(1, Ordering::SeqCst);
        self.next(|s| s.relevance.pop_front()).unwrap_or_else(|| {
            Ok(r#"{"analysis": "On topic", "relevance_score": 80, "verdict": "Relevant"}"#.to_string())
        })
    }

    async fn fact_check(&self, _thread: &ThreadContext, _comment: &str) -> Result<String> {
        self.fact_check_calls.fetch_add(1, Ordering::SeqCst);
        self.next(|s| s.fact_check.pop_front()).unwrap_or_else(|| {
            Ok(r#"{"has_factual_claims": false, "factual_accuracy": "unverifiable", "findings": "No claims", "flags": []}"#.to_string())
        })
    }

    async fn summarize(&self, thread: &Thread) -> Result<String> {
        self.summary_calls.fetch_add(1, Ordering::SeqCst);
        self.next(|s| s.summary.pop_front()).unwrap_or_else(|| {
            Ok(format!(
                r#"{{"context": "About {}", "summary": "{} comments so far"}}"#,
                thread.title,
                thread.comments.len()
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// UnavailableQueue
// ---------------------------------------------------------------------------

/// A queue backend whose every call fails.
pub struct UnavailableQueue;

#[async_trait]
impl QueueBackend for UnavailableQueue {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    async fn append(&self, _thread_id: &ThreadId, _entry: &QueueEntry) -> Result<()> {
        bail!("UnavailableQueue: connection refused")
    }

    async fn length(&self, _thread_id: &ThreadId) -> Result<usize> {
        bail!("UnavailableQueue: connection refused")
    }

    async fn read_marked(&self, _thread_id: &ThreadId) -> Result<MarkedEntries> {
        bail!("UnavailableQueue: connection refused")
    }

    async fn peek_oldest(&self, _thread_id: &ThreadId) -> Result<Option<QueueEntry>> {
        bail!("UnavailableQueue: connection refused")
    }

    async fn newest_index(&self, _thread_id: &ThreadId) -> Result<Option<usize>> {
        bail!("UnavailableQueue: connection refused")
    }

    async fn clear(&self, _thread_id: &ThreadId) -> Result<()> {
        bail!("UnavailableQueue: connection refused")
    }

    async fn clear_through(&self, _thread_id: &ThreadId, _mark: u64) -> Result<()> {
        bail!("UnavailableQueue: connection refused")
    }

    async fn active_threads(&self) -> Result<Vec<ThreadId>> {
        bail!("UnavailableQueue: connection refused")
    }

    async fn set_retention(&self, _thread_id: &ThreadId, _ttl: Duration) -> Result<()> {
        bail!("UnavailableQueue: connection refused")
    }

    async fn purge_expired(&self) -> Result<u64> {
        bail!("UnavailableQueue: connection refused")
    }
}

// ---------------------------------------------------------------------------
// FlakyQueue
// ---------------------------------------------------------------------------

/// A working in-memory backend whose appends or reads can be made to fail.
/// Everything else, including clearing, keeps working.
#[derive(Default)]
pub struct FlakyQueue {
    inner: MemoryQueue,
    fail_appends: AtomicBool,
    fail_reads: AtomicBool,
}

impl FlakyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Entries held by the backend itself, parked fallback entries excluded.
    pub fn stored(&self, thread_id: &ThreadId) -> usize {
        self.inner.len(thread_id)
    }
}

#[async_trait]
impl QueueBackend for FlakyQueue {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn append(&self, thread_id: &ThreadId, entry: &QueueEntry) -> Result<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            bail!("FlakyQueue: append timed out");
        }
        self.inner.append(thread_id, entry).await
    }

    async fn length(&self, thread_id: &ThreadId) -> Result<usize> {
        self.inner.length(thread_id).await
    }

    async fn read_marked(&self, thread_id: &ThreadId) -> Result<MarkedEntries> {
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("FlakyQueue: read timed out");
        }
        self.inner.read_marked(thread_id).await
    }

    async fn peek_oldest(&self, thread_id: &ThreadId) -> Result<Option<QueueEntry>> {
        self.inner.peek_oldest(thread_id).await
    }

    async fn newest_index(&self, thread_id: &ThreadId) -> Result<Option<usize>> {
        QueueBackend::newest_index(&self.inner, thread_id).await
    }

    async fn clear(&self, thread_id: &ThreadId) -> Result<()> {
        QueueBackend::clear(&self.inner, thread_id).await
    }

    async fn clear_through(&self, thread_id: &ThreadId, mark: u64) -> Result<()> {
        QueueBackend::clear_through(&self.inner, thread_id, mark).await
    }

    async fn active_threads(&self) -> Result<Vec<ThreadId>> {
        self.inner.active_threads().await
    }

    async fn set_retention(&self, thread_id: &ThreadId, ttl: Duration) -> Result<()> {
        self.inner.set_retention(thread_id, ttl).await
    }

    async fn purge_expired(&self) -> Result<u64> {
        self.inner.purge_expired().await
    }
}
