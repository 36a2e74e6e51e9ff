//! Change notification sources.
//!
//! A [`ChangeSource`] tells a watcher that one of its files *may* have
//! changed. Sources are allowed to over-report: the watcher compares content
//! fingerprints before swapping anything.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::mtls::config::{MAX_POLL_INTERVAL, MIN_POLL_INTERVAL, ReloadConfig, ReloadMode};
use crate::{Error, Result};

/// Pluggable change notification.
///
/// `start` is called once from inside the tokio runtime. The source must keep
/// delivering events into `tx` until it is dropped.
pub trait ChangeSource: Send + 'static {
    /// Begin observing `paths`.
    fn start(&mut self, paths: &[PathBuf], tx: mpsc::Sender<()>) -> Result<()>;

    /// Short label for logs.
    fn name(&self) -> &'static str;
}

/// Build the source selected by `config.reload.mode`.
#[must_use]
pub fn from_config(config: &ReloadConfig) -> Box<dyn ChangeSource> {
    match config.mode {
        ReloadMode::Notify => Box::new(FsEventSource::new(config.poll_interval)),
        ReloadMode::Poll => Box::new(PollSource::new(config.poll_interval)),
    }
}

// ============================================================================
// Filesystem events
// ============================================================================

/// `notify`-backed source.
///
/// Watches the *parent directories* non-recursively so that Kubernetes'
/// atomic `..data` symlink swaps for mounted Secrets and ConfigMaps are seen.
/// Falls back to [`PollSource`] when the platform watcher cannot be created.
pub struct FsEventSource {
    fallback_interval: Duration,
    watcher: Option<RecommendedWatcher>,
    fallback: Option<PollSource>,
}

impl FsEventSource {
    /// Create a source that polls at `fallback_interval` if `notify` fails.
    #[must_use]
    pub fn new(fallback_interval: Duration) -> Self {
        Self {
            fallback_interval,
            watcher: None,
            fallback: None,
        }
    }

    fn create_watcher(paths: &[PathBuf], tx: mpsc::Sender<()>) -> Result<RecommendedWatcher> {
        let watched: Vec<PathBuf> = paths.to_vec();

        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| {
                let is_relevant = result.as_ref().is_ok_and(|e| is_relevant_event(e, &watched));
                if is_relevant {
                    let _ = tx.try_send(());
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|e| Error::Internal(format!("Failed to create file watcher: {e}")))?;

        let mut dirs: Vec<&Path> = paths.iter().map(|p| watch_dir(p)).collect();
        dirs.sort();
        dirs.dedup();
        for dir in dirs {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(|e| {
                    Error::Internal(format!("Failed to watch '{}': {e}", dir.display()))
                })?;
        }

        Ok(watcher)
    }
}

impl ChangeSource for FsEventSource {
    fn start(&mut self, paths: &[PathBuf], tx: mpsc::Sender<()>) -> Result<()> {
        match Self::create_watcher(paths, tx.clone()) {
            Ok(watcher) => {
                self.watcher = Some(watcher);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "File notifications unavailable, falling back to polling");
                let mut poll = PollSource::new(self.fallback_interval);
                poll.start(paths, tx)?;
                self.fallback = Some(poll);
                Ok(())
            }
        }
    }

    fn name(&self) -> &'static str {
        if self.fallback.is_some() { "poll" } else { "notify" }
    }
}

fn watch_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Create/modify/remove of a watched file, or any change to a `..`-prefixed
/// entry (the kubelet's `..data` and timestamped directories).
fn is_relevant_event(event: &Event, watched: &[PathBuf]) -> bool {
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return false;
    }
    event.paths.iter().any(|p| {
        watched.iter().any(|w| w == p)
            || p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(".."))
    })
}

// ============================================================================
// Polling
// ============================================================================

/// Modification-time polling.
///
/// Compares `(mtime, len)` of every path (following symlinks) each interval.
/// The interval is clamped to 100ms..=60s.
pub struct PollSource {
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl PollSource {
    /// Create a poller; `interval` is clamped to the supported range.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL),
            task: None,
        }
    }

    /// The effective poll interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

type Stamp = Option<(SystemTime, u64)>;

fn stamp(path: &Path) -> Stamp {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

impl ChangeSource for PollSource {
    fn start(&mut self, paths: &[PathBuf], tx: mpsc::Sender<()>) -> Result<()> {
        let paths = paths.to_vec();
        let interval = self.interval;

        self.task = Some(tokio::spawn(async move {
            let mut last: Vec<Stamp> = paths.iter().map(|p| stamp(p)).collect();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let now: Vec<Stamp> = paths.iter().map(|p| stamp(p)).collect();
                if now != last {
                    debug!("Poll detected change");
                    last = now;
                    if tx.send(()).await.is_err() {
                        break;
                    }
                }
            }
        }));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "poll"
    }
}

impl Drop for PollSource {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ============================================================================
// Manual (tests, admin tooling)
// ============================================================================

/// Source fired explicitly through a [`ChangeTrigger`].
pub struct ManualSource {
    slot: Arc<Mutex<Option<mpsc::Sender<()>>>>,
}

/// Handle that fires a [`ManualSource`].
#[derive(Clone)]
pub struct ChangeTrigger {
    slot: Arc<Mutex<Option<mpsc::Sender<()>>>>,
}

impl ManualSource {
    /// Create a source and the trigger that drives it.
    #[must_use]
    pub fn new() -> (Self, ChangeTrigger) {
        let slot = Arc::new(Mutex::new(None));
        (
            Self {
                slot: Arc::clone(&slot),
            },
            ChangeTrigger { slot },
        )
    }
}

impl ChangeSource for ManualSource {
    fn start(&mut self, _paths: &[PathBuf], tx: mpsc::Sender<()>) -> Result<()> {
        *self.slot.lock() = Some(tx);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

impl ChangeTrigger {
    /// Report a change. Returns `false` if the source is not started yet or
    /// its watcher has stopped.
    pub fn fire(&self) -> bool {
        self.slot
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.try_send(()).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind};

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn poll_interval_is_clamped() {
        assert_eq!(PollSource::new(Duration::ZERO).interval(), MIN_POLL_INTERVAL);
        assert_eq!(
            PollSource::new(Duration::from_secs(3600)).interval(),
            MAX_POLL_INTERVAL
        );
        assert_eq!(
            PollSource::new(Duration::from_secs(2)).interval(),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn watched_file_modification_is_relevant() {
        let watched = vec![PathBuf::from("/etc/tls/tls.crt")];
        let ev = event(EventKind::Modify(ModifyKind::Any), "/etc/tls/tls.crt");
        assert!(is_relevant_event(&ev, &watched));
    }

    #[test]
    fn kubelet_data_swap_is_relevant() {
        // GIVEN: the kubelet re-pointing the `..data` symlink
        let watched = vec![PathBuf::from("/etc/tls/tls.crt")];
        let ev = event(EventKind::Create(CreateKind::Any), "/etc/tls/..data");
        // THEN: treated as a possible change of every file in the directory
        assert!(is_relevant_event(&ev, &watched));
    }

    #[test]
    fn unrelated_sibling_and_access_events_are_ignored() {
        let watched = vec![PathBuf::from("/etc/tls/tls.crt")];
        assert!(!is_relevant_event(
            &event(EventKind::Modify(ModifyKind::Any), "/etc/tls/other.txt"),
            &watched
        ));
        assert!(!is_relevant_event(
            &event(EventKind::Access(notify::event::AccessKind::Any), "/etc/tls/tls.crt"),
            &watched
        ));
    }

    #[test]
    fn watch_dir_of_bare_file_name_is_cwd() {
        assert_eq!(watch_dir(Path::new("tls.crt")), Path::new("."));
        assert_eq!(watch_dir(Path::new("/a/b.crt")), Path::new("/a"));
    }

    #[tokio::test]
    async fn manual_trigger_fires_only_after_start() {
        let (mut source, trigger) = ManualSource::new();
        assert!(!trigger.fire());

        let (tx, mut rx) = mpsc::channel(4);
        source.start(&[], tx).unwrap();
        assert!(trigger.fire());
        assert_eq!(rx.recv().await, Some(()));
    }

    #[tokio::test]
    async fn poll_source_reports_rewrite() {
        // GIVEN: a polled file
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.crt");
        std::fs::write(&path, "one").unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let mut source = PollSource::new(MIN_POLL_INTERVAL);
        source.start(&[path.clone()], tx).unwrap();

        // WHEN: its length changes
        tokio::time::sleep(Duration::from_millis(150)).await;
        std::fs::write(&path, "three").unwrap();

        // THEN: a change is reported within a few intervals
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert_eq!(got.unwrap(), Some(()));
    }
}
