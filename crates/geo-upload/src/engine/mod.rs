//! Upload queue engine.
//!
//! Owns the in-memory FIFO of persisted artifact locations and drives them
//! through the uploader one at a time. Queue, counter and state mutations all
//! happen under one mutex that is never held across an `.await`; the only
//! suspension points are the uploader call and the retry delay.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use crate::artifact::{self, Artifact};
use crate::artifact_store::{ArtifactStore, Location};
use crate::clock::Clock;
use crate::config::{AppConfig, DEFAULT_CANDIDATE_NAME, DEFAULT_MAX_ARTIFACT_BYTES, DEFAULT_MAX_ATTEMPTS};
use crate::counter::{CounterField, CounterRecord, CounterStore};
use crate::error::{Rejection, UploadError, exhausted_reason};
use crate::signals::{ConnectivityWatcher, LifecycleWatcher};
use crate::uploader::{BackgroundCompletion, UploadMetadata, UploadResult, Uploader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Uploading,
    Success(UploadResult),
    Failure(UploadError),
    PermanentFailure(String),
}

/// Read-only projection handed to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub state: EngineState,
    pub queued: u64,
    pub uploaded: u64,
    pub pending: usize,
    pub awaiting_background: usize,
    pub dropped: u64,
}

impl Snapshot {
    pub fn progress_text(&self) -> String {
        format!("{}/{} images", self.uploaded, self.queued)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued(Location),
    Rejected(Rejection),
    /// Valid artifact that the cache directory refused to store.
    NotPersisted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub uploaded: usize,
    pub registered_background: usize,
    pub dropped: usize,
    pub halted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Empty,
    AlreadyRunning,
    Finished(DrainReport),
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub candidate_name: String,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub max_artifact_bytes: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            candidate_name: DEFAULT_CANDIDATE_NAME.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: Duration::from_secs(1),
            max_artifact_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
        }
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            candidate_name: cfg.uploader.candidate_name.clone(),
            max_attempts: cfg.queue.max_attempts.max(1),
            retry_delay: cfg.queue.retry_delay(),
            max_artifact_bytes: cfg.queue.max_artifact_bytes,
        }
    }
}

/// Collaborators injected by the composition root.
pub struct EngineParts {
    pub store: ArtifactStore,
    pub counters: CounterStore,
    pub uploader: Arc<dyn Uploader>,
    pub connectivity: ConnectivityWatcher,
    pub lifecycle: LifecycleWatcher,
    pub clock: Arc<dyn Clock>,
    pub settings: EngineSettings,
}

struct Inner {
    queue: VecDeque<Location>,
    // Handed to the background transport, waiting for a completion.
    awaiting: Vec<Location>,
    dropped: u64,
    state: EngineState,
}

enum Attempt {
    Delivered(UploadResult),
    Registered,
    Exhausted(UploadError),
}

pub struct Engine {
    store: ArtifactStore,
    counters: CounterStore,
    uploader: Arc<dyn Uploader>,
    connectivity: ConnectivityWatcher,
    lifecycle: LifecycleWatcher,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    inner: Mutex<Inner>,
    draining: AtomicBool,
    snapshot: watch::Sender<Snapshot>,
    completions: Mutex<Option<broadcast::Receiver<BackgroundCompletion>>>,
}

impl Engine {
    /// Rebuilds the queue from the cache directory and reconciles the counter
    /// record with it before anything can drain.
    pub fn new(parts: EngineParts) -> Self {
        let EngineParts {
            store,
            counters,
            uploader,
            connectivity,
            lifecycle,
            clock,
            settings,
        } = parts;

        let completions = uploader.completions();
        let queue: VecDeque<Location> = store.enumerate().into();
        reconcile_counters(&counters, queue.len() as u64);
        if !queue.is_empty() {
            tracing::info!(pending = queue.len(), dir = %store.dir().display(), "recovered queued artifacts");
        }

        let inner = Inner {
            queue,
            awaiting: Vec::new(),
            dropped: 0,
            state: EngineState::Idle,
        };
        let (snapshot, _) = watch::channel(project(&counters.load(), &inner));

        Self {
            store,
            counters,
            uploader,
            connectivity,
            lifecycle,
            clock,
            settings,
            inner: Mutex::new(inner),
            draining: AtomicBool::new(false),
            snapshot,
            completions: Mutex::new(Some(completions)),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    pub fn state(&self) -> EngineState {
        self.lock().state.clone()
    }

    pub fn pending(&self) -> Vec<Location> {
        self.lock().queue.iter().cloned().collect()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub async fn enqueue(&self, artifact: Option<Artifact>) -> EnqueueOutcome {
        let checked = artifact::validate(artifact.as_ref(), self.settings.max_artifact_bytes)
            .and_then(|()| artifact.ok_or(Rejection::Missing));
        let artifact = match checked {
            Ok(a) => a,
            Err(rejection) => {
                tracing::warn!(reason = %rejection, "artifact rejected");
                let state = if rejection.is_permanent() {
                    EngineState::PermanentFailure(rejection.reason().to_string())
                } else {
                    EngineState::Failure(UploadError::UploadFailed)
                };
                let mut inner = self.lock();
                self.set_state(&mut inner, state);
                return EnqueueOutcome::Rejected(rejection);
            }
        };

        let Some(location) = self.store.save(artifact.bytes()) else {
            let mut inner = self.lock();
            inner.dropped = inner.dropped.saturating_add(1);
            tracing::warn!(dropped = inner.dropped, "artifact could not be persisted; not queued");
            self.set_state(&mut inner, EngineState::Failure(UploadError::UploadFailed));
            return EnqueueOutcome::NotPersisted;
        };

        {
            let mut inner = self.lock();
            inner.queue.push_back(location.clone());
            self.counters.increment(CounterField::Queued);
            self.publish(&inner);
        }
        tracing::info!(artifact = %location.display(), size = artifact.size(), "artifact queued");

        if self.connectivity.is_connected() {
            self.drain().await;
        } else {
            tracing::info!("offline; artifact kept on disk until the network returns");
        }
        EnqueueOutcome::Queued(location)
    }

    /// Uploads queued artifacts head first. At most one drain runs at a time;
    /// overlapping calls return `AlreadyRunning` without side effects.
    pub async fn drain(&self) -> DrainOutcome {
        if self.draining.swap(true, Ordering::AcqRel) {
            tracing::debug!("drain already in progress");
            return DrainOutcome::AlreadyRunning;
        }
        {
            let mut inner = self.lock();
            if inner.queue.is_empty() {
                self.draining.store(false, Ordering::Release);
                return DrainOutcome::Empty;
            }
            self.set_state(&mut inner, EngineState::Uploading);
        }

        let mut report = DrainReport::default();
        loop {
            let head = {
                let mut inner = self.lock();
                match inner.queue.front().cloned() {
                    Some(head) => head,
                    None => {
                        // Cleared under the lock so a concurrent enqueue either
                        // lands in this loop or starts a fresh drain.
                        self.draining.store(false, Ordering::Release);
                        self.finish_if_settled(&mut inner);
                        return DrainOutcome::Finished(report);
                    }
                }
            };

            let Some(bytes) = self.store.load(&head) else {
                let mut inner = self.lock();
                pop_if_head(&mut inner.queue, &head);
                inner.dropped = inner.dropped.saturating_add(1);
                report.dropped += 1;
                tracing::warn!(artifact = %head.display(), dropped = inner.dropped, "queued artifact vanished from disk; dropping");
                self.publish(&inner);
                continue;
            };

            match self.upload_with_retry(&head, &bytes).await {
                Attempt::Delivered(result) => {
                    let mut inner = self.lock();
                    pop_if_head(&mut inner.queue, &head);
                    if !self.store.remove(&head) {
                        self.store.remove_matching(&bytes);
                    }
                    self.bump_uploaded();
                    report.uploaded += 1;
                    tracing::info!(artifact = %head.display(), url = %result.remote_locator, "artifact uploaded");
                    self.set_state(&mut inner, EngineState::Success(result));
                }
                Attempt::Registered => {
                    let mut inner = self.lock();
                    pop_if_head(&mut inner.queue, &head);
                    inner.awaiting.push(head.clone());
                    report.registered_background += 1;
                    tracing::info!(artifact = %head.display(), "handed to background transport");
                    self.publish(&inner);
                }
                Attempt::Exhausted(err) => {
                    let mut inner = self.lock();
                    self.draining.store(false, Ordering::Release);
                    report.halted = true;
                    tracing::error!(
                        artifact = %head.display(),
                        attempts = self.settings.max_attempts,
                        error = %err,
                        "upload failed permanently; draining halted until the next trigger"
                    );
                    let reason = exhausted_reason(self.settings.max_attempts);
                    self.set_state(&mut inner, EngineState::PermanentFailure(reason));
                    return DrainOutcome::Finished(report);
                }
            }
        }
    }

    /// Called for every completion the background transport publishes.
    ///
    /// Only completions for an awaiting or queued artifact are counted; the
    /// head being uploaded by a running drain is left for that drain.
    pub fn on_background_upload_completed(&self, completion: BackgroundCompletion) {
        let mut inner = self.lock();
        let BackgroundCompletion { artifact, result } = completion;

        let before = inner.awaiting.len();
        inner.awaiting.retain(|l| l != &artifact);
        let mut matched = inner.awaiting.len() != before;
        if !matched {
            // Finished by a transfer registered before the last restart.
            match inner.queue.iter().position(|l| l == &artifact) {
                Some(0) if self.is_draining() => {
                    tracing::debug!(artifact = %artifact.display(), "completion for the artifact being uploaded; left to the drain");
                    return;
                }
                Some(pos) => {
                    inner.queue.remove(pos);
                    matched = true;
                }
                None => {}
            }
        }
        if !matched {
            tracing::warn!(artifact = %artifact.display(), "completion for an artifact that is not queued; ignoring");
            return;
        }
        if artifact.exists() {
            self.store.remove(&artifact);
        }

        let rec = self.bump_uploaded();
        tracing::info!(artifact = %artifact.display(), url = %result.remote_locator, progress = %format!("{}/{}", rec.uploaded, rec.queued), "background upload completed");
        inner.state = EngineState::Success(result);
        self.finish_if_settled(&mut inner);
    }

    /// Serialized event loop: connectivity edges and foreground activations
    /// start a drain, background completions are applied in arrival order.
    pub async fn run(self: Arc<Self>) {
        let taken = self
            .completions
            .lock()
            .map(|mut c| c.take())
            .unwrap_or_else(|e| e.into_inner().take());
        let Some(mut completions) = taken else {
            tracing::warn!("engine event loop already running");
            return;
        };
        let mut edges = self.connectivity.subscribe();
        let mut activations = self.lifecycle.subscribe();

        if self.connectivity.is_connected() {
            self.spawn_drain();
        }

        loop {
            tokio::select! {
                edge = edges.next() => {
                    if edge.is_none() {
                        break;
                    }
                    tracing::debug!("reachability edge; draining");
                    self.spawn_drain();
                }
                act = activations.next() => {
                    if act.is_none() {
                        break;
                    }
                    tracing::debug!("became active; draining");
                    self.spawn_drain();
                }
                msg = completions.recv() => match msg {
                    Ok(c) => self.on_background_upload_completed(c),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "background completions lost; progress will be reconciled on restart");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("engine event loop stopped");
    }

    fn spawn_drain(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.drain().await;
        });
    }

    async fn upload_with_retry(&self, head: &Location, bytes: &[u8]) -> Attempt {
        let metadata = UploadMetadata {
            candidate_name: self.settings.candidate_name.clone(),
            artifact: head.clone(),
        };
        let max = self.settings.max_attempts.max(1);
        let mut last_err = UploadError::UploadFailed;

        for attempt in 1..=max {
            let outcome = if self.lifecycle.is_foreground() {
                self.uploader
                    .upload_foreground(bytes, &metadata)
                    .await
                    .map(Some)
            } else {
                self.uploader
                    .upload_background(bytes.to_vec(), metadata.clone())
                    .map(|()| None)
            };
            match outcome {
                Ok(Some(result)) => return Attempt::Delivered(result),
                Ok(None) => return Attempt::Registered,
                Err(e) => {
                    tracing::warn!(attempt, max, error = %e, "upload attempt failed");
                    let mut inner = self.lock();
                    self.set_state(&mut inner, EngineState::Failure(e.clone()));
                    last_err = e;
                }
            }
            if attempt < max {
                self.clock.sleep(self.settings.retry_delay).await;
            }
        }
        Attempt::Exhausted(last_err)
    }

    // Never lets `uploaded` pass `queued`.
    fn bump_uploaded(&self) -> CounterRecord {
        let rec = self.counters.load();
        if rec.uploaded >= rec.queued {
            tracing::warn!(queued = rec.queued, uploaded = rec.uploaded, "upload completion without a queued count");
            return rec;
        }
        self.counters.increment(CounterField::Uploaded)
    }

    fn finish_if_settled(&self, inner: &mut Inner) {
        if inner.queue.is_empty() && inner.awaiting.is_empty() {
            self.finalize(inner);
        } else {
            self.publish(inner);
        }
    }

    fn finalize(&self, inner: &mut Inner) {
        let rec = self.counters.load();
        if !rec.is_complete() {
            tracing::warn!(
                queued = rec.queued,
                uploaded = rec.uploaded,
                dropped = inner.dropped,
                "queue drained with uncounted items"
            );
        }
        self.counters.clear();
        inner.state = EngineState::Idle;
        self.publish(inner);
    }

    fn set_state(&self, inner: &mut Inner, state: EngineState) {
        inner.state = state;
        self.publish(inner);
    }

    fn publish(&self, inner: &Inner) {
        self.snapshot
            .send_replace(project(&self.counters.load(), inner));
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn project(rec: &CounterRecord, inner: &Inner) -> Snapshot {
    Snapshot {
        state: inner.state.clone(),
        queued: rec.queued,
        uploaded: rec.uploaded,
        pending: inner.queue.len(),
        awaiting_background: inner.awaiting.len(),
        dropped: inner.dropped,
    }
}

fn pop_if_head(queue: &mut VecDeque<Location>, head: &Location) {
    if queue.front() == Some(head) {
        queue.pop_front();
    }
}

/// Counts and the file listing are persisted separately; the listing wins.
fn reconcile_counters(counters: &CounterStore, pending: u64) {
    let rec = counters.load();
    if pending == 0 {
        if counters.exists() {
            if !rec.is_complete() {
                tracing::warn!(queued = rec.queued, uploaded = rec.uploaded, "counter record without queued files; clearing");
            }
            counters.clear();
        }
        return;
    }
    let uploaded = rec.uploaded.min(rec.queued);
    let fixed = CounterRecord::new(uploaded + pending, uploaded);
    if fixed != rec {
        tracing::warn!(
            queued = rec.queued,
            uploaded = rec.uploaded,
            on_disk = pending,
            "counter record disagrees with cache directory; rebuilding"
        );
        counters.store(fixed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::test_support::jpeg;
    use crate::clock::InstantClock;
    use crate::signals::AppPhase;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct ScriptedUploader {
        script: Mutex<VecDeque<Result<UploadResult, UploadError>>>,
        foreground_calls: AtomicUsize,
        background: Mutex<Vec<UploadMetadata>>,
        gate: Option<Arc<Notify>>,
        tx: Option<broadcast::Sender<BackgroundCompletion>>,
    }

    impl ScriptedUploader {
        fn with_script(script: Vec<Result<UploadResult, UploadError>>) -> Self {
            let (tx, _) = broadcast::channel(16);
            Self {
                script: Mutex::new(script.into()),
                tx: Some(tx),
                ..Default::default()
            }
        }

        fn succeeding() -> Self {
            Self::with_script(Vec::new())
        }

        fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::succeeding()
            }
        }

        fn calls(&self) -> usize {
            self.foreground_calls.load(Ordering::SeqCst)
        }

        fn background_calls(&self) -> Vec<UploadMetadata> {
            self.background.lock().expect("lock").clone()
        }
    }

    fn ok(url: &str) -> Result<UploadResult, UploadError> {
        Ok(UploadResult {
            remote_locator: url.to_string(),
        })
    }

    #[async_trait]
    impl Uploader for ScriptedUploader {
        async fn upload_foreground(
            &self,
            _artifact: &[u8],
            metadata: &UploadMetadata,
        ) -> Result<UploadResult, UploadError> {
            self.foreground_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let next = self.script.lock().expect("lock").pop_front();
            next.unwrap_or_else(|| ok(&format!("https://cdn.example/{}", metadata.artifact.display())))
        }

        fn upload_background(
            &self,
            _artifact: Vec<u8>,
            metadata: UploadMetadata,
        ) -> Result<(), UploadError> {
            self.background.lock().expect("lock").push(metadata);
            Ok(())
        }

        fn completions(&self) -> broadcast::Receiver<BackgroundCompletion> {
            match &self.tx {
                Some(tx) => tx.subscribe(),
                None => broadcast::channel(1).1,
            }
        }
    }

    struct Harness {
        _tmp: tempfile::TempDir,
        store: ArtifactStore,
        counters: CounterStore,
        uploader: Arc<ScriptedUploader>,
        clock: Arc<InstantClock>,
        connectivity: ConnectivityWatcher,
        lifecycle: LifecycleWatcher,
    }

    impl Harness {
        fn new(uploader: ScriptedUploader, connected: bool, phase: AppPhase) -> Self {
            let tmp = tempfile::tempdir().expect("tempdir");
            Self {
                store: ArtifactStore::new(tmp.path().join("UploadQueue")),
                counters: CounterStore::new(tmp.path().join("upload_tracker.json")),
                _tmp: tmp,
                uploader: Arc::new(uploader),
                clock: Arc::new(InstantClock::default()),
                connectivity: ConnectivityWatcher::new(connected),
                lifecycle: LifecycleWatcher::new(phase),
            }
        }

        fn engine(&self) -> Engine {
            Engine::new(EngineParts {
                store: self.store.clone(),
                counters: self.counters.clone(),
                uploader: self.uploader.clone(),
                connectivity: self.connectivity.clone(),
                lifecycle: self.lifecycle.clone(),
                clock: self.clock.clone(),
                settings: EngineSettings::default(),
            })
        }
    }

    fn photo(size: usize, fill: u8) -> Artifact {
        Artifact::new(jpeg(size, true, fill))
    }

    #[tokio::test]
    async fn offline_enqueue_counts_without_uploading() {
        let h = Harness::new(ScriptedUploader::succeeding(), false, AppPhase::Foreground);
        let engine = h.engine();

        let out = engine.enqueue(Some(photo(4096, 1))).await;
        assert!(matches!(out, EnqueueOutcome::Queued(_)));
        assert_eq!(h.counters.load(), CounterRecord::new(1, 0));
        assert_eq!(h.uploader.calls(), 0);
        assert_eq!(engine.snapshot().progress_text(), "0/1 images");
        assert_eq!(engine.pending().len(), 1);
    }

    #[tokio::test]
    async fn round_trip_clears_everything() {
        let h = Harness::new(ScriptedUploader::succeeding(), true, AppPhase::Foreground);
        let engine = h.engine();
        let a = photo(2_000_000, 7);

        engine.enqueue(Some(a.clone())).await;

        assert_eq!(h.uploader.calls(), 1);
        assert!(!h.store.contains(a.bytes()));
        assert!(h.store.enumerate().is_empty());
        assert!(!h.counters.exists());
        assert_eq!(engine.state(), EngineState::Idle);
        let snap = engine.snapshot();
        assert_eq!(snap.progress_text(), "0/0 images");
        assert_eq!(snap.pending, 0);
    }

    #[tokio::test]
    async fn success_on_fifth_attempt_counts_once() {
        let fail = || Err(UploadError::Status(502));
        let h = Harness::new(
            ScriptedUploader::with_script(vec![fail(), fail(), fail(), fail(), ok("https://cdn/5")]),
            false,
            AppPhase::Foreground,
        );
        let engine = h.engine();
        engine.enqueue(Some(photo(1024, 2))).await;

        let mut progress = engine.subscribe();
        let out = engine.drain().await;

        assert_eq!(
            out,
            DrainOutcome::Finished(DrainReport {
                uploaded: 1,
                ..Default::default()
            })
        );
        assert_eq!(h.uploader.calls(), 5);
        assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(1); 4]);
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(progress.has_changed().expect("sender alive"));
        assert_eq!(progress.borrow_and_update().state, EngineState::Idle);
    }

    #[tokio::test]
    async fn five_failures_halt_with_head_kept() {
        let script = (0..5).map(|_| Err(UploadError::Transport("offline".into()))).collect();
        let h = Harness::new(ScriptedUploader::with_script(script), false, AppPhase::Foreground);
        let engine = h.engine();
        let EnqueueOutcome::Queued(loc) = engine.enqueue(Some(photo(1024, 3))).await else {
            panic!("expected queued");
        };

        let out = engine.drain().await;

        assert!(matches!(out, DrainOutcome::Finished(DrainReport { halted: true, uploaded: 0, .. })));
        assert_eq!(
            engine.state(),
            EngineState::PermanentFailure("Upload failed after 5 attempts. Will retry later.".into())
        );
        assert_eq!(engine.pending(), vec![loc.clone()]);
        assert!(loc.is_file());
        assert_eq!(h.counters.load(), CounterRecord::new(1, 0));
        assert_eq!(h.clock.sleeps().len(), 4);
        assert!(!engine.is_draining());

        // Next trigger retries from the same head.
        assert!(matches!(engine.drain().await, DrainOutcome::Finished(DrainReport { uploaded: 1, .. })));
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!loc.exists());
    }

    #[tokio::test]
    async fn non_geotagged_is_rejected_without_side_effects() {
        let h = Harness::new(ScriptedUploader::succeeding(), true, AppPhase::Foreground);
        let engine = h.engine();

        let out = engine.enqueue(Some(Artifact::new(jpeg(2048, false, 0)))).await;

        assert_eq!(out, EnqueueOutcome::Rejected(Rejection::NotGeotagged));
        assert_eq!(
            engine.state(),
            EngineState::PermanentFailure("Image must be geotagged.".into())
        );
        assert!(h.store.enumerate().is_empty());
        assert!(!h.counters.exists());
        assert_eq!(h.uploader.calls(), 0);
    }

    #[tokio::test]
    async fn oversized_is_rejected() {
        let h = Harness::new(ScriptedUploader::succeeding(), true, AppPhase::Foreground);
        let engine = h.engine();

        let out = engine.enqueue(Some(photo(6_000_000, 0))).await;

        assert!(matches!(out, EnqueueOutcome::Rejected(Rejection::TooLarge { size: 6_000_000, .. })));
        assert_eq!(
            engine.state(),
            EngineState::PermanentFailure("Image must be under 5MB.".into())
        );
        assert!(h.store.enumerate().is_empty());
        assert!(!h.counters.exists());
    }

    #[tokio::test]
    async fn missing_artifact_is_an_ordinary_failure() {
        let h = Harness::new(ScriptedUploader::succeeding(), true, AppPhase::Foreground);
        let engine = h.engine();
        assert_eq!(
            engine.enqueue(None).await,
            EnqueueOutcome::Rejected(Rejection::Missing)
        );
        assert_eq!(engine.state(), EngineState::Failure(UploadError::UploadFailed));
    }

    #[tokio::test]
    async fn background_registration_waits_for_completion() {
        let h = Harness::new(ScriptedUploader::succeeding(), true, AppPhase::Background);
        let engine = h.engine();
        let EnqueueOutcome::Queued(loc) = engine.enqueue(Some(photo(1024, 4))).await else {
            panic!("expected queued");
        };

        assert_eq!(h.uploader.calls(), 0);
        assert_eq!(h.uploader.background_calls().len(), 1);
        assert_eq!(h.counters.load(), CounterRecord::new(1, 0));
        let snap = engine.snapshot();
        assert_eq!(snap.awaiting_background, 1);
        assert_eq!(snap.state, EngineState::Uploading);

        engine.on_background_upload_completed(BackgroundCompletion {
            artifact: loc.clone(),
            result: UploadResult {
                remote_locator: "https://cdn/bg".into(),
            },
        });

        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!h.counters.exists());
        assert!(!loc.exists());
        assert_eq!(engine.snapshot().awaiting_background, 0);
    }

    #[tokio::test]
    async fn partial_background_completion_updates_progress() {
        let h = Harness::new(ScriptedUploader::succeeding(), true, AppPhase::Background);
        let engine = h.engine();
        engine.enqueue(Some(photo(1024, 5))).await;
        engine.enqueue(Some(photo(1024, 6))).await;
        let registered = h.uploader.background_calls();
        assert_eq!(registered.len(), 2);

        engine.on_background_upload_completed(BackgroundCompletion {
            artifact: registered[0].artifact.clone(),
            result: UploadResult {
                remote_locator: "https://cdn/1".into(),
            },
        });
        assert_eq!(h.counters.load(), CounterRecord::new(2, 1));
        assert_eq!(engine.snapshot().progress_text(), "1/2 images");
        assert!(matches!(engine.state(), EngineState::Success(_)));
    }

    #[tokio::test]
    async fn cold_start_rebuilds_queue_from_disk() {
        let h = Harness::new(ScriptedUploader::succeeding(), false, AppPhase::Foreground);
        let seeded: Vec<Location> = (10..13u8)
            .map(|fill| h.store.save(&jpeg(1024, true, fill)).expect("seed"))
            .collect();

        let engine = h.engine();
        assert_eq!(engine.pending(), seeded);
        assert_eq!(h.counters.load(), CounterRecord::new(3, 0));
        assert_eq!(engine.snapshot().progress_text(), "0/3 images");

        assert!(matches!(engine.drain().await, DrainOutcome::Finished(DrainReport { uploaded: 3, .. })));
        assert!(h.store.enumerate().is_empty());
        assert!(!h.counters.exists());
    }

    #[tokio::test]
    async fn cold_start_keeps_prior_progress() {
        let h = Harness::new(ScriptedUploader::succeeding(), false, AppPhase::Foreground);
        h.store.save(&jpeg(1024, true, 20)).expect("seed");
        h.counters.store(CounterRecord::new(4, 3));
        let engine = h.engine();
        assert_eq!(h.counters.load(), CounterRecord::new(4, 3));
        assert_eq!(engine.snapshot().progress_text(), "3/4 images");

        h.counters.store(CounterRecord::new(9, 1));
        drop(engine);
        let _engine = h.engine();
        assert_eq!(h.counters.load(), CounterRecord::new(2, 1));
    }

    #[tokio::test]
    async fn stale_record_without_files_is_cleared() {
        let h = Harness::new(ScriptedUploader::succeeding(), false, AppPhase::Foreground);
        h.counters.store(CounterRecord::new(2, 2));
        let _engine = h.engine();
        assert!(!h.counters.exists());
    }

    #[tokio::test]
    async fn concurrent_drain_is_single_flight() {
        let gate = Arc::new(Notify::new());
        let h = Harness::new(ScriptedUploader::gated(gate.clone()), false, AppPhase::Foreground);
        let engine = Arc::new(h.engine());
        engine.enqueue(Some(photo(1024, 8))).await;

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.drain().await }
        });
        while h.uploader.calls() == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(engine.drain().await, DrainOutcome::AlreadyRunning);
        assert_eq!(engine.drain().await, DrainOutcome::AlreadyRunning);

        gate.notify_one();
        let out = first.await.expect("join");
        assert!(matches!(out, DrainOutcome::Finished(DrainReport { uploaded: 1, .. })));
        assert_eq!(h.uploader.calls(), 1);
        assert_eq!(engine.drain().await, DrainOutcome::Empty);
    }

    #[tokio::test]
    async fn vanished_artifact_is_dropped_and_counted() {
        let h = Harness::new(ScriptedUploader::succeeding(), false, AppPhase::Foreground);
        let engine = h.engine();
        let EnqueueOutcome::Queued(gone) = engine.enqueue(Some(photo(1024, 9))).await else {
            panic!("expected queued");
        };
        engine.enqueue(Some(photo(1024, 10))).await;
        std::fs::remove_file(&gone).expect("remove");

        let out = engine.drain().await;

        assert_eq!(
            out,
            DrainOutcome::Finished(DrainReport {
                uploaded: 1,
                dropped: 1,
                ..Default::default()
            })
        );
        assert_eq!(h.uploader.calls(), 1);
        assert_eq!(engine.snapshot().dropped, 1);
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!h.counters.exists());
    }

    #[tokio::test]
    async fn stray_completion_never_overtakes_queued() {
        let h = Harness::new(ScriptedUploader::succeeding(), false, AppPhase::Foreground);
        let engine = h.engine();
        engine.enqueue(Some(photo(1024, 11))).await;

        engine.on_background_upload_completed(BackgroundCompletion {
            artifact: h.store.dir().join("unknown.jpg"),
            result: UploadResult {
                remote_locator: "https://cdn/x".into(),
            },
        });
        engine.on_background_upload_completed(BackgroundCompletion {
            artifact: h.store.dir().join("unknown-2.jpg"),
            result: UploadResult {
                remote_locator: "https://cdn/y".into(),
            },
        });

        assert_eq!(h.counters.load(), CounterRecord::new(1, 0));
        let snap = engine.snapshot();
        assert_eq!(snap.pending, 1);
        assert_eq!(snap.progress_text(), "0/1 images");
        assert!(h.counters.exists());
        assert!(!matches!(snap.state, EngineState::Success(_)));

        // The queued photo is still counted once it really uploads.
        engine.drain().await;
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!h.counters.exists());
        assert_eq!(h.uploader.calls(), 1);
    }

    #[tokio::test]
    async fn completion_for_in_flight_head_is_left_to_the_drain() {
        let gate = Arc::new(Notify::new());
        let h = Harness::new(ScriptedUploader::gated(gate.clone()), false, AppPhase::Foreground);
        let engine = Arc::new(h.engine());
        let EnqueueOutcome::Queued(head) = engine.enqueue(Some(photo(1024, 14))).await else {
            panic!("expected queued");
        };
        engine.enqueue(Some(photo(1024, 15))).await;

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.drain().await }
        });
        while h.uploader.calls() == 0 {
            tokio::task::yield_now().await;
        }

        engine.on_background_upload_completed(BackgroundCompletion {
            artifact: head.clone(),
            result: UploadResult {
                remote_locator: "https://cdn/early".into(),
            },
        });
        assert_eq!(h.counters.load(), CounterRecord::new(2, 0));
        assert_eq!(engine.pending().len(), 2);
        assert!(head.is_file());

        gate.notify_one();
        while h.uploader.calls() < 2 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();
        let out = first.await.expect("join");
        assert!(matches!(out, DrainOutcome::Finished(DrainReport { uploaded: 2, .. })));
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!h.counters.exists());
    }

    #[tokio::test]
    async fn background_completion_finalizes_after_dropped_sibling() {
        let h = Harness::new(ScriptedUploader::succeeding(), false, AppPhase::Background);
        let engine = h.engine();
        let EnqueueOutcome::Queued(kept) = engine.enqueue(Some(photo(1024, 16))).await else {
            panic!("expected queued");
        };
        let EnqueueOutcome::Queued(gone) = engine.enqueue(Some(photo(1024, 17))).await else {
            panic!("expected queued");
        };
        std::fs::remove_file(&gone).expect("remove");

        let out = engine.drain().await;
        assert!(matches!(
            out,
            DrainOutcome::Finished(DrainReport { registered_background: 1, dropped: 1, .. })
        ));
        assert_eq!(h.counters.load(), CounterRecord::new(2, 0));

        engine.on_background_upload_completed(BackgroundCompletion {
            artifact: kept.clone(),
            result: UploadResult {
                remote_locator: "https://cdn/kept".into(),
            },
        });

        assert!(!h.counters.exists());
        assert_eq!(engine.state(), EngineState::Idle);
        let snap = engine.snapshot();
        assert_eq!(snap.pending, 0);
        assert_eq!(snap.awaiting_background, 0);
        assert_eq!(snap.dropped, 1);
        assert!(!kept.exists());
    }

    #[tokio::test]
    async fn event_loop_drains_on_reachability_edge() {
        let h = Harness::new(ScriptedUploader::succeeding(), false, AppPhase::Foreground);
        let engine = Arc::new(h.engine());
        engine.enqueue(Some(photo(1024, 12))).await;
        let mut progress = engine.subscribe();
        let looped = tokio::spawn(engine.clone().run());

        tokio::task::yield_now().await;
        assert_eq!(h.uploader.calls(), 0);

        h.connectivity.set_connected(true);
        let idle = tokio::time::timeout(
            Duration::from_secs(5),
            progress.wait_for(|s| s.state == EngineState::Idle && s.pending == 0),
        )
        .await
        .is_ok_and(|r| r.is_ok());
        assert!(idle, "drain did not finish");
        assert_eq!(h.uploader.calls(), 1);
        looped.abort();
    }

    #[tokio::test]
    async fn event_loop_applies_background_completions() {
        let h = Harness::new(ScriptedUploader::succeeding(), true, AppPhase::Background);
        let engine = Arc::new(h.engine());
        let EnqueueOutcome::Queued(loc) = engine.enqueue(Some(photo(1024, 13))).await else {
            panic!("expected queued");
        };
        let mut progress = engine.subscribe();
        let looped = tokio::spawn(engine.clone().run());
        tokio::task::yield_now().await;

        let tx = h.uploader.tx.clone().expect("sender");
        tx.send(BackgroundCompletion {
            artifact: loc.clone(),
            result: UploadResult {
                remote_locator: "https://cdn/bg".into(),
            },
        })
        .expect("subscriber");

        let idle = tokio::time::timeout(
            Duration::from_secs(5),
            progress.wait_for(|s| s.state == EngineState::Idle),
        )
        .await
        .is_ok_and(|r| r.is_ok());
        assert!(idle, "completion not applied");
        assert!(!h.counters.exists());
        assert!(!loc.exists());
        looped.abort();
    }
}
