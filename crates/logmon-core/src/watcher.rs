//! Per-path watcher tasks.
//!
//! A [`FileWatcher`] owns one tokio task that sleeps until the change
//! notifier wakes it, then polls its [`FileTail`] and evaluates the new lines
//! against the rules bound to the path. Both steps run together on the
//! blocking pool so file I/O and regex work never stall an async worker.
//! Matches are handed to the monitor through a bounded channel.
//!
//! Stopping is synchronous from the monitor's point of view: the live flag
//! is cleared before `stop` returns, and every message carries the
//! watcher's generation so the monitor can discard stragglers.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::WatchError;
use crate::fs::FileSystem;
use crate::notifier::{ChangeNotifier, Registration, WakeReceiver};
use crate::patterns::PatternMatcher;
use crate::rules::{BoundRule, Rule};
use crate::tailer::{FileTail, TailCounters};

/// Lifecycle of one watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WatcherState {
    /// Open or registration failed. Parked until the rules are reloaded.
    Waiting { error: WatchError },
    Active,
    Stopped,
}

impl WatcherState {
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Tail position and counters as of the last completed wake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherStats {
    pub offset: u64,
    pub line_number: u64,
    pub counters: TailCounters,
}

/// One rule matching one line.
#[derive(Debug, Clone)]
pub struct LineMatch {
    pub rule: Rule,
    pub priority: u32,
    pub line: String,
    pub line_number: u64,
    pub range: Range<usize>,
    pub captures: Vec<String>,
}

#[derive(Debug)]
pub enum WatcherPayload {
    Matched(LineMatch),
    Failed(WatchError),
}

/// Message from a watcher task to the monitor.
#[derive(Debug)]
pub struct WatcherMessage {
    pub generation: u64,
    pub path: PathBuf,
    pub payload: WatcherPayload,
}

/// Everything a watcher task needs besides its own path and rules.
pub struct WatcherContext<F, N> {
    pub fs: Arc<F>,
    pub notifier: Arc<N>,
    pub matcher: Arc<PatternMatcher>,
    pub tx: mpsc::Sender<WatcherMessage>,
    pub max_read_bytes: usize,
}

impl<F, N> Clone for WatcherContext<F, N> {
    fn clone(&self) -> Self {
        Self {
            fs: Arc::clone(&self.fs),
            notifier: Arc::clone(&self.notifier),
            matcher: Arc::clone(&self.matcher),
            tx: self.tx.clone(),
            max_read_bytes: self.max_read_bytes,
        }
    }
}

struct Shared {
    live: AtomicBool,
    shutdown: Notify,
    stats: Mutex<WatcherStats>,
}

impl Shared {
    fn record(&self, tail: &FileTail) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        *stats = WatcherStats {
            offset: tail.offset(),
            line_number: tail.line_number(),
            counters: tail.counters(),
        };
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

/// Handle to one watched path.
pub struct FileWatcher {
    path: PathBuf,
    generation: u64,
    state: WatcherState,
    shared: Arc<Shared>,
    bindings: watch::Sender<Arc<[BoundRule]>>,
    registration: Option<Box<dyn Registration>>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("path", &self.path)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl FileWatcher {
    /// Open `path` at end-of-file, register for change notifications and
    /// spawn the watcher task. Must be called inside a tokio runtime.
    ///
    /// Failures never panic or retry: the returned watcher is parked in
    /// [`WatcherState::Waiting`] carrying the error.
    pub fn start<F: FileSystem, N: ChangeNotifier>(
        ctx: &WatcherContext<F, N>,
        path: &Path,
        rules: Arc<[BoundRule]>,
        generation: u64,
    ) -> Self {
        let (bindings, bindings_rx) = watch::channel(rules);
        let shared = Arc::new(Shared {
            live: AtomicBool::new(false),
            shutdown: Notify::new(),
            stats: Mutex::new(WatcherStats::default()),
        });
        let mut watcher = Self {
            path: path.to_path_buf(),
            generation,
            state: WatcherState::Stopped,
            shared,
            bindings,
            registration: None,
            task: None,
        };

        let tail = match FileTail::open(ctx.fs.as_ref(), path, ctx.max_read_bytes) {
            Ok(tail) => tail,
            Err(error) => {
                warn!(path = %path.display(), generation, error = %error, "Watcher waiting: open failed");
                watcher.state = WatcherState::Waiting { error };
                return watcher;
            }
        };

        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let registration = match ctx.notifier.register(path, wake_tx) {
            Ok(registration) => registration,
            Err(err) => {
                tail.close();
                let error = WatchError::Notify {
                    path: path.to_path_buf(),
                    message: err.to_string(),
                };
                warn!(path = %path.display(), generation, error = %error, "Watcher waiting: notification registration failed");
                watcher.state = WatcherState::Waiting { error };
                return watcher;
            }
        };

        watcher.shared.record(&tail);
        watcher.shared.live.store(true, Ordering::Release);
        watcher.registration = Some(registration);
        watcher.task = Some(tokio::spawn(run(
            tail,
            ctx.clone(),
            wake_rx,
            bindings_rx,
            Arc::clone(&watcher.shared),
            generation,
        )));
        watcher.state = WatcherState::Active;
        info!(path = %path.display(), generation, "Watching log file");
        watcher
    }

    /// Cancel the registration and end the task. No message from this
    /// watcher is accepted once this returns.
    pub fn stop(&mut self) {
        self.shared.live.store(false, Ordering::Release);
        if let Some(mut registration) = self.registration.take() {
            registration.cancel();
        }
        if self.task.take().is_some() {
            // The task closes its file handle on the way out.
            self.shared.shutdown.notify_one();
            debug!(path = %self.path.display(), generation = self.generation, "Watcher stopped");
        }
        self.state = WatcherState::Stopped;
    }

    /// Replace the rules evaluated for new lines. Position and numbering are kept.
    pub fn update_rules(&self, rules: Arc<[BoundRule]>) {
        self.bindings.send_replace(rules);
    }

    #[must_use]
    pub fn rules(&self) -> Arc<[BoundRule]> {
        Arc::clone(&self.bindings.borrow())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn state(&self) -> &WatcherState {
        &self.state
    }

    /// Whether a message stamped with `generation` may still be delivered.
    #[must_use]
    pub fn accepts(&self, generation: u64) -> bool {
        self.generation == generation && self.shared.is_live()
    }

    #[must_use]
    pub fn stats(&self) -> WatcherStats {
        *self
            .shared
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run<F: FileSystem, N>(
    mut tail: FileTail,
    ctx: WatcherContext<F, N>,
    mut wake_rx: WakeReceiver,
    bindings: watch::Receiver<Arc<[BoundRule]>>,
    shared: Arc<Shared>,
    generation: u64,
) {
    let path = tail.path().to_path_buf();

    'wakes: loop {
        let reason = tokio::select! {
            biased;
            () = shared.shutdown.notified() => break,
            reason = wake_rx.recv() => match reason {
                Some(reason) => reason,
                None => break,
            },
        };
        // Wakes that piled up while we were busy are covered by this poll.
        while wake_rx.try_recv().is_ok() {}
        if !shared.is_live() {
            break;
        }
        trace!(path = %path.display(), ?reason, "Watcher woke");

        let rules = Arc::clone(&bindings.borrow());
        let fs = Arc::clone(&ctx.fs);
        let matcher = Arc::clone(&ctx.matcher);
        let polled = tokio::task::spawn_blocking(move || {
            let outcome = tail.poll(fs.as_ref());
            let matches = match_lines(&matcher, &rules, &outcome.lines);
            (tail, outcome, matches)
        })
        .await;
        let (returned, outcome, matches) = match polled {
            Ok(polled) => polled,
            Err(err) => {
                error!(path = %path.display(), generation, error = %err, "Watcher poll task failed");
                return;
            }
        };
        tail = returned;
        shared.record(&tail);

        // Stopped while reading: the output is discarded.
        if !shared.is_live() {
            break;
        }

        let failures = outcome.errors.into_iter().map(WatcherPayload::Failed);
        let matched = matches.into_iter().map(WatcherPayload::Matched);
        for payload in failures.chain(matched) {
            let message = WatcherMessage {
                generation,
                path: path.clone(),
                payload,
            };
            let delivered = tokio::select! {
                biased;
                () = shared.shutdown.notified() => false,
                sent = ctx.tx.send(message) => sent.is_ok(),
            };
            if !delivered {
                break 'wakes;
            }
        }
    }

    tail.close();
    trace!(path = %path.display(), generation, "Watcher task exited");
}

/// Evaluate every line against every bound rule, in line order then rule
/// priority order.
fn match_lines(
    matcher: &PatternMatcher,
    rules: &[BoundRule],
    lines: &[crate::tailer::TailLine],
) -> Vec<LineMatch> {
    let mut matches = Vec::new();
    for line in lines {
        for bound in rules {
            let Some(result) = matcher.match_line(&line.text, &bound.rule) else {
                continue;
            };
            debug!(
                rule_id = %bound.rule.id,
                line_number = line.number,
                "Rule matched"
            );
            matches.push(LineMatch {
                rule: bound.rule.clone(),
                priority: bound.priority,
                line: line.text.clone(),
                line_number: line.number,
                range: result.range,
                captures: result.captures,
            });
        }
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFileSystem;
    use crate::notifier::{ManualNotifier, WakeReason};
    use crate::tailer::{DEFAULT_MAX_READ_BYTES, TailLine};
    use std::time::Duration;

    const LOG: &str = "/var/log/app.log";

    struct Harness {
        fs: MemoryFileSystem,
        notifier: ManualNotifier,
        ctx: WatcherContext<MemoryFileSystem, ManualNotifier>,
        rx: mpsc::Receiver<WatcherMessage>,
    }

    fn harness() -> Harness {
        let fs = MemoryFileSystem::new();
        let notifier = ManualNotifier::new();
        let (tx, rx) = mpsc::channel(64);
        let ctx = WatcherContext {
            fs: Arc::new(fs.clone()),
            notifier: Arc::new(notifier.clone()),
            matcher: Arc::new(PatternMatcher::new()),
            tx,
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
        };
        Harness {
            fs,
            notifier,
            ctx,
            rx,
        }
    }

    fn bound(rules: &[Rule]) -> Arc<[BoundRule]> {
        rules
            .iter()
            .enumerate()
            .map(|(i, rule)| BoundRule {
                rule: rule.clone(),
                priority: i as u32,
            })
            .collect()
    }

    async fn next(rx: &mut mpsc::Receiver<WatcherMessage>) -> WatcherMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for watcher message")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn wake_delivers_matches_in_line_then_priority_order() {
        let mut h = harness();
        h.fs.create(LOG, "");
        let rules = bound(&[
            Rule::new("err", "Errors", "ERROR: (.*)", LOG),
            Rule::new("disk", "Disk", "disk", LOG),
        ]);
        let mut watcher = FileWatcher::start(&h.ctx, Path::new(LOG), rules, 7);
        assert!(watcher.state().is_active());

        h.fs.append(LOG, "ok\nERROR: disk full\n").unwrap();
        assert_eq!(h.notifier.wake(LOG, WakeReason::Modified), 1);

        let first = next(&mut h.rx).await;
        let second = next(&mut h.rx).await;
        assert_eq!(first.generation, 7);
        let (WatcherPayload::Matched(a), WatcherPayload::Matched(b)) =
            (first.payload, second.payload)
        else {
            panic!("expected two matches");
        };
        assert_eq!(a.rule.id.as_str(), "err");
        assert_eq!(a.captures, vec!["disk full".to_string()]);
        assert_eq!(a.line_number, 2);
        assert_eq!(b.rule.id.as_str(), "disk");
        assert_eq!(b.priority, 1);

        watcher.stop();
    }

    #[tokio::test]
    async fn missing_file_parks_in_waiting_state() {
        let h = harness();
        let watcher = FileWatcher::start(&h.ctx, Path::new("/nope.log"), bound(&[]), 1);
        assert!(matches!(
            watcher.state(),
            WatcherState::Waiting {
                error: WatchError::FileAccess { .. }
            }
        ));
        assert_eq!(h.notifier.registrations("/nope.log"), 0);
        assert!(!watcher.accepts(1));
    }

    #[tokio::test]
    async fn registration_failure_parks_in_waiting_state() {
        let h = harness();
        h.fs.create(LOG, "");
        h.notifier.set_failing(LOG, true);
        let watcher = FileWatcher::start(&h.ctx, Path::new(LOG), bound(&[]), 1);
        assert!(matches!(
            watcher.state(),
            WatcherState::Waiting {
                error: WatchError::Notify { .. }
            }
        ));
    }

    #[tokio::test]
    async fn stop_cancels_registration_and_rejects_generation() {
        let h = harness();
        h.fs.create(LOG, "");
        let mut watcher = FileWatcher::start(&h.ctx, Path::new(LOG), bound(&[]), 3);
        assert_eq!(h.notifier.registrations(LOG), 1);
        assert!(watcher.accepts(3));
        assert!(!watcher.accepts(2));

        watcher.stop();
        assert_eq!(watcher.state(), &WatcherState::Stopped);
        assert_eq!(h.notifier.registrations(LOG), 0);
        assert!(!watcher.accepts(3));
    }

    #[tokio::test]
    async fn updated_rules_apply_to_later_lines_without_losing_position() {
        let mut h = harness();
        h.fs.create(LOG, "");
        let mut watcher = FileWatcher::start(
            &h.ctx,
            Path::new(LOG),
            bound(&[Rule::new("a", "A", "alpha", LOG)]),
            1,
        );

        h.fs.append(LOG, "alpha\n").unwrap();
        h.notifier.wake(LOG, WakeReason::Modified);
        let WatcherPayload::Matched(m) = next(&mut h.rx).await.payload else {
            panic!("expected match");
        };
        assert_eq!(m.line_number, 1);

        watcher.update_rules(bound(&[Rule::new("b", "B", "beta", LOG)]));
        h.fs.append(LOG, "alpha\nbeta\n").unwrap();
        h.notifier.wake(LOG, WakeReason::Modified);
        let WatcherPayload::Matched(m) = next(&mut h.rx).await.payload else {
            panic!("expected match");
        };
        assert_eq!(m.rule.id.as_str(), "b");
        assert_eq!(m.line_number, 3);
        assert_eq!(watcher.stats().counters.lines_emitted, 3);

        watcher.stop();
    }

    #[test]
    fn match_lines_skips_disabled_rules() {
        let matcher = PatternMatcher::new();
        let rules = bound(&[
            Rule::new("off", "Off", "x", LOG).with_enabled(false),
            Rule::new("on", "On", "x", LOG),
        ]);
        let lines = vec![TailLine {
            number: 1,
            text: "x".to_string(),
        }];
        let matches = match_lines(&matcher, &rules, &lines);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule.id.as_str(), "on");
    }
}
