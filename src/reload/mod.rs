//! Hot-reloaded TLS material.
//!
//! A [`SnapshotWatcher`] owns one immutable snapshot (a certificate/key pair
//! or a trust pool) behind `RwLock<Arc<_>>`. Readers clone the `Arc`; a reload
//! builds a complete replacement off to the side and swaps it in only when it
//! parsed cleanly. A failed reload leaves the previous snapshot in place.
//!
//! ```text
//! ChangeSource ──► debounce ──► reload()
//!                                 ├─ same fingerprint  → Unchanged
//!                                 ├─ parse/verify fail → Rejected (keep old, streak += 1)
//!                                 └─ ok                → Updated  (swap, streak = 0)
//! ```

pub mod certificate;
pub mod source;
pub mod trust;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backon::{ConstantBuilder, Retryable};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::mtls::config::ReloadConfig;
use crate::telemetry;
use crate::{Error, Result};

pub use certificate::{CertificateWatcher, KeyPairLoader, KeyPairMaterial};
pub use source::{ChangeSource, ChangeTrigger, FsEventSource, ManualSource, PollSource};
pub use trust::{TrustBundleLoader, TrustPool, TrustRootWatcher};

// ============================================================================
// Loader abstraction
// ============================================================================

/// Raw bytes of every file backing a snapshot, plus their fingerprint.
#[derive(Debug, Clone)]
pub struct SourceBytes {
    /// File contents, in [`SnapshotLoader::paths`] order. A missing optional
    /// file is an empty entry.
    pub parts: Vec<Vec<u8>>,
    /// Hex SHA-256 over all parts.
    pub fingerprint: String,
}

impl SourceBytes {
    /// Fingerprint `parts`.
    #[must_use]
    pub fn new(parts: Vec<Vec<u8>>) -> Self {
        let mut hasher = Sha256::new();
        for part in &parts {
            // Length prefix keeps ("ab","c") and ("a","bc") apart.
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        Self {
            fingerprint: hex::encode(hasher.finalize()),
            parts,
        }
    }
}

/// Reads and parses one kind of snapshot.
pub trait SnapshotLoader: Send + Sync + 'static {
    /// The immutable snapshot produced.
    type Snapshot: Send + Sync + 'static;

    /// Label used in logs, errors and metrics.
    const KIND: &'static str;

    /// Files this snapshot is built from.
    fn paths(&self) -> Vec<PathBuf>;

    /// Read every backing file.
    fn read(&self) -> Result<SourceBytes>;

    /// Build a snapshot from previously read bytes.
    fn parse(&self, source: &SourceBytes) -> Result<Self::Snapshot>;

    /// One-line description for the "reloaded" log entry.
    fn describe(&self, snapshot: &Self::Snapshot) -> String;

    /// Called after a snapshot became current.
    fn published(&self, _snapshot: &Self::Snapshot) {}
}

// ============================================================================
// Watch state
// ============================================================================

/// What a call to [`SnapshotWatcher::reload`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// A new snapshot is current.
    Updated,
    /// Content fingerprint unchanged; nothing swapped.
    Unchanged,
    /// The new content was unusable; the previous snapshot stays current.
    Rejected,
}

impl ReloadOutcome {
    /// Metric label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Rejected => "rejected",
        }
    }
}

struct WatchState<S> {
    current: Arc<S>,
    fingerprint: String,
    error_streak: u32,
    generation: u64,
}

/// Retry policy for transient load failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first.
    pub attempts: usize,
    /// Delay between attempts.
    pub delay: Duration,
}

impl From<&ReloadConfig> for RetryPolicy {
    fn from(cfg: &ReloadConfig) -> Self {
        Self {
            attempts: cfg.pair_retry_attempts,
            delay: cfg.pair_retry_delay,
        }
    }
}

// ============================================================================
// SnapshotWatcher
// ============================================================================

/// Publishes the latest good snapshot of `L`.
pub struct SnapshotWatcher<L: SnapshotLoader> {
    loader: L,
    state: RwLock<WatchState<L::Snapshot>>,
    retry: RetryPolicy,
    debounce: Duration,
    /// Serialises reloads; readers never take it.
    reload_lock: Mutex<()>,
}

impl<L: SnapshotLoader> SnapshotWatcher<L> {
    /// Load the first snapshot.
    ///
    /// # Errors
    ///
    /// Any failure is a [`Error::Config`]: the server must not start without
    /// usable material.
    pub fn load_initial(loader: L, reload: &ReloadConfig) -> Result<Self> {
        let source = loader
            .read()
            .and_then(|bytes| loader.parse(&bytes).map(|snap| (snap, bytes.fingerprint)));

        let (snapshot, fingerprint) = source.map_err(|e| {
            Error::Config(format!("Initial {} load failed: {e}", L::KIND))
        })?;

        info!(kind = L::KIND, detail = %loader.describe(&snapshot), "Loaded initial {}", L::KIND);
        loader.published(&snapshot);
        telemetry::set_reload_error_streak(L::KIND, 0);

        Ok(Self {
            loader,
            state: RwLock::new(WatchState {
                current: Arc::new(snapshot),
                fingerprint,
                error_streak: 0,
                generation: 1,
            }),
            retry: RetryPolicy::from(reload),
            debounce: reload.debounce,
            reload_lock: Mutex::new(()),
        })
    }

    /// The latest good snapshot. Never blocks on a reload in progress.
    #[must_use]
    pub fn current(&self) -> Arc<L::Snapshot> {
        Arc::clone(&self.state.read().current)
    }

    /// Consecutive rejected reloads since the last success.
    #[must_use]
    pub fn error_streak(&self) -> u32 {
        self.state.read().error_streak
    }

    /// Incremented on every swap; the initial snapshot is generation 1.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// The loader's files.
    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        self.loader.paths()
    }

    /// Re-read the backing files and swap in a new snapshot if they changed.
    pub async fn reload(&self) -> ReloadOutcome {
        let _guard = self.reload_lock.lock().await;

        let outcome = match self.load_with_retry().await {
            Ok(None) => {
                // Files match the served snapshot again.
                let cleared = {
                    let mut state = self.state.write();
                    std::mem::take(&mut state.error_streak)
                };
                if cleared > 0 {
                    info!(kind = L::KIND, cleared, "Files match the current {} again", L::KIND);
                    telemetry::set_reload_error_streak(L::KIND, 0);
                } else {
                    info!(kind = L::KIND, "no-op reload");
                }
                ReloadOutcome::Unchanged
            }
            Ok(Some((snapshot, fingerprint))) => {
                let detail = self.loader.describe(&snapshot);
                self.loader.published(&snapshot);
                let generation = {
                    let mut state = self.state.write();
                    state.current = Arc::new(snapshot);
                    state.fingerprint = fingerprint;
                    state.error_streak = 0;
                    state.generation += 1;
                    state.generation
                };
                info!(kind = L::KIND, generation, detail = %detail, "Reloaded {}", L::KIND);
                telemetry::set_reload_error_streak(L::KIND, 0);
                ReloadOutcome::Updated
            }
            Err(e) => {
                let streak = {
                    let mut state = self.state.write();
                    state.error_streak = state.error_streak.saturating_add(1);
                    state.error_streak
                };
                error!(
                    kind = L::KIND,
                    error = %e,
                    error_streak = streak,
                    "Reload rejected, keeping previous {}", L::KIND
                );
                telemetry::set_reload_error_streak(L::KIND, streak);
                ReloadOutcome::Rejected
            }
        };

        telemetry::record_reload(L::KIND, outcome.as_str());
        outcome
    }

    /// `Ok(None)` when the content fingerprint matches the current snapshot.
    fn try_load(&self) -> Result<Option<(L::Snapshot, String)>> {
        let bytes = self.loader.read()?;
        if bytes.fingerprint == self.state.read().fingerprint {
            return Ok(None);
        }
        let snapshot = self.loader.parse(&bytes)?;
        Ok(Some((snapshot, bytes.fingerprint)))
    }

    async fn load_with_retry(&self) -> Result<Option<(L::Snapshot, String)>> {
        let attempt = || async move { self.try_load() };

        attempt
            .retry(
                ConstantBuilder::default()
                    .with_delay(self.retry.delay)
                    .with_max_times(self.retry.attempts),
            )
            .when(Error::is_transient)
            .notify(|e: &Error, delay: Duration| {
                warn!(kind = L::KIND, error = %e, ?delay, "Transient load failure, retrying");
            })
            .await
    }

    /// Drive reloads from `source` until `shutdown_rx` fires.
    ///
    /// Events are debounced: a reload runs once no new event arrived for the
    /// configured quiet period.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot start.
    pub fn spawn(
        self: &Arc<Self>,
        mut source: Box<dyn ChangeSource>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<WatchHandle> {
        let (event_tx, mut event_rx) = mpsc::channel(32);
        source.start(&self.loader.paths(), event_tx)?;
        info!(kind = L::KIND, source = source.name(), paths = ?self.loader.paths(), "Watching for changes");

        let watcher = Arc::clone(self);
        let debounce = self.debounce;
        let tick = debounce.clamp(Duration::from_millis(10), Duration::from_millis(100));

        let task = tokio::spawn(async move {
            // Dropping the source stops OS watches and poll tasks.
            let _source = source;
            let mut last_event: Option<Instant> = None;
            let mut ticker = tokio::time::interval(tick);

            loop {
                tokio::select! {
                    Some(()) = event_rx.recv() => {
                        last_event = Some(Instant::now());
                    }
                    _ = ticker.tick() => {
                        if last_event.is_some_and(|t| t.elapsed() >= debounce) {
                            last_event = None;
                            watcher.reload().await;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!(kind = L::KIND, "Watcher shutting down");
                        break;
                    }
                }
            }
        });

        Ok(WatchHandle { task })
    }
}

/// Handle to a spawned watch task.
pub struct WatchHandle {
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Wait for the task to exit after shutdown was signalled.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Watch task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Loader over an in-memory string: `"bad"` fails to parse, `"gone"`
    /// reads as a missing file.
    struct StubLoader {
        content: parking_lot::Mutex<String>,
        reads: AtomicUsize,
    }

    impl StubLoader {
        fn new(content: &str) -> Self {
            Self {
                content: parking_lot::Mutex::new(content.to_string()),
                reads: AtomicUsize::new(0),
            }
        }
    }

    impl SnapshotLoader for StubLoader {
        type Snapshot = String;
        const KIND: &'static str = "stub";

        fn paths(&self) -> Vec<PathBuf> {
            vec![PathBuf::from("stub")]
        }

        fn read(&self) -> Result<SourceBytes> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let content = self.content.lock().clone();
            if content == "gone" {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "gone",
                )));
            }
            Ok(SourceBytes::new(vec![content.into_bytes()]))
        }

        fn parse(&self, source: &SourceBytes) -> Result<String> {
            let s = String::from_utf8_lossy(&source.parts[0]).into_owned();
            if s == "bad" {
                return Err(Error::rotation("stub", "stub", "bad content"));
            }
            Ok(s)
        }

        fn describe(&self, snapshot: &String) -> String {
            snapshot.clone()
        }
    }

    fn fast_reload() -> ReloadConfig {
        ReloadConfig {
            debounce: Duration::from_millis(10),
            pair_retry_attempts: 2,
            pair_retry_delay: Duration::from_millis(1),
            ..ReloadConfig::default()
        }
    }

    fn watcher(content: &str) -> SnapshotWatcher<StubLoader> {
        SnapshotWatcher::load_initial(StubLoader::new(content), &fast_reload()).unwrap()
    }

    fn set(w: &SnapshotWatcher<StubLoader>, content: &str) {
        *w.loader.content.lock() = content.to_string();
    }

    #[test]
    fn fingerprint_separates_part_boundaries() {
        let a = SourceBytes::new(vec![b"ab".to_vec(), b"c".to_vec()]);
        let b = SourceBytes::new(vec![b"a".to_vec(), b"bc".to_vec()]);
        assert_ne!(a.fingerprint, b.fingerprint);
        assert_eq!(a.fingerprint.len(), 64);
    }

    #[test]
    fn initial_failure_is_config_error() {
        let err = SnapshotWatcher::load_initial(StubLoader::new("bad"), &fast_reload())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn identical_content_is_a_noop() {
        // GIVEN: a watcher at generation 1
        let w = watcher("v1");
        let before = w.current();
        // WHEN: reloading without a content change
        let outcome = w.reload().await;
        // THEN: nothing swapped
        assert_eq!(outcome, ReloadOutcome::Unchanged);
        assert_eq!(w.generation(), 1);
        assert!(Arc::ptr_eq(&before, &w.current()));
    }

    #[tokio::test]
    async fn changed_content_is_swapped_in() {
        let w = watcher("v1");
        set(&w, "v2");
        assert_eq!(w.reload().await, ReloadOutcome::Updated);
        assert_eq!(*w.current(), "v2");
        assert_eq!(w.generation(), 2);
    }

    #[tokio::test]
    async fn rejected_reload_keeps_previous_and_counts_streak() {
        // GIVEN: a good snapshot
        let w = watcher("v1");
        // WHEN: two consecutive broken rotations
        set(&w, "bad");
        assert_eq!(w.reload().await, ReloadOutcome::Rejected);
        assert_eq!(w.reload().await, ReloadOutcome::Rejected);
        // THEN: old snapshot served, streak counts both
        assert_eq!(*w.current(), "v1");
        assert_eq!(w.error_streak(), 2);

        // WHEN: a good rotation follows
        set(&w, "v3");
        assert_eq!(w.reload().await, ReloadOutcome::Updated);
        // THEN: the streak resets
        assert_eq!(w.error_streak(), 0);
    }

    #[tokio::test]
    async fn reverted_rotation_clears_error_streak() {
        // GIVEN: a rejected rotation
        let w = watcher("v1");
        set(&w, "bad");
        assert_eq!(w.reload().await, ReloadOutcome::Rejected);
        assert_eq!(w.error_streak(), 1);

        // WHEN: the issuer restores the content being served
        set(&w, "v1");
        let outcome = w.reload().await;

        // THEN: nothing swapped, but the streak is back to zero
        assert_eq!(outcome, ReloadOutcome::Unchanged);
        assert_eq!(w.error_streak(), 0);
        assert_eq!(w.generation(), 1);
        assert_eq!(*w.current(), "v1");
    }

    #[tokio::test]
    async fn missing_file_is_retried_then_rejected() {
        let w = watcher("v1");
        set(&w, "gone");
        let reads_before = w.loader.reads.load(Ordering::SeqCst);

        assert_eq!(w.reload().await, ReloadOutcome::Rejected);

        // one attempt plus two retries
        assert_eq!(w.loader.reads.load(Ordering::SeqCst) - reads_before, 3);
        assert_eq!(*w.current(), "v1");
    }

    #[tokio::test]
    async fn parse_failure_is_not_retried() {
        let w = watcher("v1");
        set(&w, "bad");
        let reads_before = w.loader.reads.load(Ordering::SeqCst);
        w.reload().await;
        assert_eq!(w.loader.reads.load(Ordering::SeqCst) - reads_before, 1);
    }

    #[tokio::test]
    async fn spawned_watcher_reloads_on_trigger_and_stops_on_shutdown() {
        // GIVEN: a spawned watcher driven by a manual source
        let w = Arc::new(watcher("v1"));
        let (source, trigger) = ManualSource::new();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = w.spawn(Box::new(source), shutdown_rx).unwrap();

        // WHEN: content changes and the trigger fires
        set(&w, "v2");
        assert!(trigger.fire());

        // THEN: the new snapshot is published after the debounce
        tokio::time::timeout(Duration::from_secs(5), async {
            while w.generation() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*w.current(), "v2");

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn burst_of_events_is_coalesced() {
        let w = Arc::new(watcher("v1"));
        let (source, trigger) = ManualSource::new();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let _handle = w.spawn(Box::new(source), shutdown_rx).unwrap();

        set(&w, "v2");
        for _ in 0..10 {
            trigger.fire();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(w.generation(), 2);
    }
}
