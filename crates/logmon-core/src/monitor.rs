//! Monitor coordinator.
//!
//! Owns one [`FileWatcher`] per distinct rule path and is the single writer
//! of the [`MatchAggregator`]:
//!
//! ```text
//! notifier ──wake──► FileWatcher task ──poll + match──► mpsc ──► Monitor ──► MatchAggregator ──► observers
//!                    (one per path)     (blocking pool)          (&mut self)
//! ```
//!
//! Watchers are keyed by path. Reloading rules starts watchers for new
//! paths, stops watchers whose path lost its last enabled rule, rebinds
//! unchanged watchers in place (offset and line numbering survive) and
//! retries watchers parked after an open failure.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::aggregator::{
    AggregatorConfig, DEFAULT_HISTORY_CAPACITY, DEFAULT_WARNING_THRESHOLD, FrequentMatchWarning,
    MatchAggregator, MatchEvent, MatchObserver,
};
use crate::error::{Result, WatchError};
use crate::fs::{FileSystem, OsFileSystem};
use crate::notifier::{ChangeNotifier, FsEventNotifier};
use crate::patterns::{CacheStats, DEFAULT_REGEX_CACHE_CAPACITY, PatternMatcher};
use crate::rules::{Rule, RuleId, group_enabled_by_path, validate_rules};
use crate::tailer::DEFAULT_MAX_READ_BYTES;
use crate::watcher::{
    FileWatcher, WatcherContext, WatcherMessage, WatcherPayload, WatcherState, WatcherStats,
};

pub const DEFAULT_CHANNEL_BUFFER: usize = 1024;

/// Configuration for the monitor runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub history_capacity: usize,
    pub warning_threshold: u32,
    pub regex_cache_capacity: usize,
    /// Bound on matches queued between watcher tasks and the monitor
    pub channel_buffer: usize,
    pub max_read_bytes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
            regex_cache_capacity: DEFAULT_REGEX_CACHE_CAPACITY,
            channel_buffer: DEFAULT_CHANNEL_BUFFER,
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
        }
    }
}

/// Receives watcher failures (open, registration, read).
pub trait MonitorDiagnostics: Send + Sync {
    fn on_watcher_error(&self, error: &WatchError);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorMetrics {
    pub matches_recorded: u64,
    pub watcher_errors: u64,
    /// Messages from stopped or replaced watchers, or for rules disabled in flight
    pub stale_messages: u64,
    pub watchers_started: u64,
    pub watchers_stopped: u64,
}

/// What one drained message turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Recorded(MatchEvent),
    WatcherError(WatchError),
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherStatus {
    pub path: PathBuf,
    pub generation: u64,
    pub state: WatcherState,
    pub rule_count: usize,
    pub stats: WatcherStats,
}

/// Point-in-time view for status surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub rule_count: usize,
    pub watchers: Vec<WatcherStatus>,
    pub history_len: usize,
    pub active_warnings: usize,
    pub regex_cache: CacheStats,
    pub metrics: MonitorMetrics,
}

pub struct Monitor<F = OsFileSystem, N = FsEventNotifier> {
    ctx: WatcherContext<F, N>,
    rx: mpsc::Receiver<WatcherMessage>,
    rules: Vec<Rule>,
    watchers: BTreeMap<PathBuf, FileWatcher>,
    aggregator: MatchAggregator,
    diagnostics: Option<Arc<dyn MonitorDiagnostics>>,
    next_generation: u64,
    running: bool,
    metrics: MonitorMetrics,
}

impl Monitor<OsFileSystem, FsEventNotifier> {
    /// Monitor over the real file system with OS change notifications.
    pub fn with_os(config: RuntimeConfig, rules: Vec<Rule>) -> Result<Self> {
        let notifier = FsEventNotifier::new()?;
        Self::new(Arc::new(OsFileSystem), Arc::new(notifier), config, rules)
    }
}

impl<F: FileSystem, N: ChangeNotifier> Monitor<F, N> {
    /// Rules are validated structurally (ids unique, fields non-empty).
    /// Broken regexes are accepted; those rules simply never match.
    pub fn new(fs: Arc<F>, notifier: Arc<N>, config: RuntimeConfig, rules: Vec<Rule>) -> Result<Self> {
        validate_rules(&rules)?;
        let (tx, rx) = mpsc::channel(config.channel_buffer.max(1));
        let ctx = WatcherContext {
            fs,
            notifier,
            matcher: Arc::new(PatternMatcher::with_cache_capacity(config.regex_cache_capacity)),
            tx,
            max_read_bytes: config.max_read_bytes,
        };
        Ok(Self {
            ctx,
            rx,
            rules,
            watchers: BTreeMap::new(),
            aggregator: MatchAggregator::new(AggregatorConfig {
                history_capacity: config.history_capacity,
                warning_threshold: config.warning_threshold,
            }),
            diagnostics: None,
            next_generation: 1,
            running: false,
            metrics: MonitorMetrics::default(),
        })
    }

    pub fn set_diagnostics(&mut self, diagnostics: Arc<dyn MonitorDiagnostics>) {
        self.diagnostics = Some(diagnostics);
    }

    /// Register an aggregator observer (held weakly).
    pub fn add_observer<O: MatchObserver + 'static>(&mut self, observer: &Arc<O>) {
        self.aggregator.add_observer(observer);
    }

    /// Start one watcher per path with at least one enabled rule.
    /// Idempotent. Must be called inside a tokio runtime.
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        info!(rules = self.rules.len(), "Monitor starting");
        self.sync_watchers(false);
    }

    /// Stop every watcher and release every file handle.
    pub fn stop(&mut self) {
        if !self.running && self.watchers.is_empty() {
            return;
        }
        self.running = false;
        for (_, mut watcher) in std::mem::take(&mut self.watchers) {
            watcher.stop();
            self.metrics.watchers_stopped += 1;
        }
        // Everything still queued came from a watcher that no longer exists.
        while self.rx.try_recv().is_ok() {
            self.metrics.stale_messages += 1;
        }
        info!("Monitor stopped");
    }

    /// Alias of [`Monitor::stop`].
    pub fn stop_all(&mut self) {
        self.stop();
    }

    /// Replace the rule set. Unchanged paths keep their position; waiting
    /// watchers get another attempt.
    pub fn reload_patterns(&mut self, rules: Vec<Rule>) -> Result<()> {
        validate_rules(&rules)?;
        self.rules = rules;
        info!(rules = self.rules.len(), "Rules reloaded");
        if self.running {
            self.sync_watchers(true);
        }
        Ok(())
    }

    /// Enable or disable one rule. Returns `false` for an unknown id.
    pub fn set_pattern_enabled(&mut self, id: &RuleId, enabled: bool) -> bool {
        let Some(rule) = self.rules.iter_mut().find(|r| &r.id == id) else {
            return false;
        };
        if rule.enabled == enabled {
            return true;
        }
        rule.enabled = enabled;
        let path = rule.path.clone();
        debug!(rule_id = %id, enabled, "Rule toggled");
        if self.running {
            // An enable on a path whose watcher is parked is a fresh attempt.
            if enabled && self.watchers.get(&path).is_some_and(|w| !w.state().is_active()) {
                if let Some(mut parked) = self.watchers.remove(&path) {
                    parked.stop();
                    self.metrics.watchers_stopped += 1;
                }
            }
            self.sync_watchers(false);
        }
        true
    }

    /// Drain every queued message into the aggregator without waiting.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.rx.try_recv() {
            self.handle_message(message);
            handled += 1;
        }
        handled
    }

    /// Wait for the next watcher message and apply it.
    ///
    /// Pends indefinitely while no watcher produces anything; callers
    /// usually race it against a shutdown signal.
    pub async fn next_message(&mut self) -> Option<MessageOutcome> {
        let message = self.rx.recv().await?;
        Some(self.handle_message(message))
    }

    /// Wait until a match is recorded, skipping errors and stale messages.
    pub async fn next_match(&mut self) -> Option<MatchEvent> {
        loop {
            if let MessageOutcome::Recorded(event) = self.next_message().await? {
                return Some(event);
            }
        }
    }

    fn handle_message(&mut self, message: WatcherMessage) -> MessageOutcome {
        let accepted = self
            .watchers
            .get(&message.path)
            .is_some_and(|w| w.accepts(message.generation));
        if !accepted {
            trace!(path = %message.path.display(), generation = message.generation, "Discarding message from stopped watcher");
            self.metrics.stale_messages += 1;
            return MessageOutcome::Discarded;
        }

        match message.payload {
            WatcherPayload::Failed(error) => {
                self.report(&error);
                MessageOutcome::WatcherError(error)
            }
            WatcherPayload::Matched(m) => {
                // Disabled between the read and now.
                if !self.rules.iter().any(|r| r.id == m.rule.id && r.enabled) {
                    self.metrics.stale_messages += 1;
                    return MessageOutcome::Discarded;
                }
                self.aggregator.handle_match(
                    &m.rule,
                    m.line,
                    m.line_number,
                    &message.path,
                    m.priority,
                    m.captures,
                );
                self.metrics.matches_recorded += 1;
                match self.aggregator.latest() {
                    Some(event) => MessageOutcome::Recorded(event.clone()),
                    None => MessageOutcome::Discarded,
                }
            }
        }
    }

    fn report(&mut self, error: &WatchError) {
        self.metrics.watcher_errors += 1;
        warn!(path = %error.path().display(), error = %error, "Watcher error");
        if let Some(diagnostics) = &self.diagnostics {
            diagnostics.on_watcher_error(error);
        }
    }

    fn sync_watchers(&mut self, retry_waiting: bool) {
        let desired = group_enabled_by_path(&self.rules);

        let unreferenced: Vec<PathBuf> = self
            .watchers
            .keys()
            .filter(|path| !desired.contains_key(*path))
            .cloned()
            .collect();
        for path in unreferenced {
            if let Some(mut watcher) = self.watchers.remove(&path) {
                watcher.stop();
                self.metrics.watchers_stopped += 1;
                info!(path = %path.display(), "No enabled rules left; watcher stopped");
            }
        }

        for (path, bound) in desired {
            if let Some(existing) = self.watchers.get(&path) {
                let keep = existing.state().is_active() || !retry_waiting;
                if keep {
                    existing.update_rules(bound);
                    continue;
                }
            }
            if let Some(mut previous) = self.watchers.remove(&path) {
                previous.stop();
                self.metrics.watchers_stopped += 1;
            }

            let generation = self.next_generation;
            self.next_generation += 1;
            let watcher = FileWatcher::start(&self.ctx, &path, bound, generation);
            self.metrics.watchers_started += 1;
            let failure = match watcher.state() {
                WatcherState::Waiting { error } => Some(error.clone()),
                WatcherState::Active | WatcherState::Stopped => None,
            };
            self.watchers.insert(path, watcher);
            if let Some(error) = failure {
                self.report(&error);
            }
        }
    }

    // ---- aggregator surface ----

    #[must_use]
    pub fn recent_matches(&self, limit: i64) -> Vec<MatchEvent> {
        self.aggregator.recent_matches(limit)
    }

    pub fn clear_history(&mut self) {
        self.aggregator.clear_history();
    }

    pub fn acknowledge_warning(&mut self, rule_id: &RuleId) -> bool {
        self.aggregator.acknowledge_warning(rule_id)
    }

    #[must_use]
    pub fn active_warnings(&self) -> &[FrequentMatchWarning] {
        self.aggregator.active_warnings()
    }

    #[must_use]
    pub fn aggregator(&self) -> &MatchAggregator {
        &self.aggregator
    }

    // ---- inspection ----

    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    #[must_use]
    pub fn matcher(&self) -> &Arc<PatternMatcher> {
        &self.ctx.matcher
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    #[must_use]
    pub fn watcher_state(&self, path: &std::path::Path) -> Option<&WatcherState> {
        self.watchers.get(path).map(FileWatcher::state)
    }

    #[must_use]
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.watchers.keys().cloned().collect()
    }

    #[must_use]
    pub fn metrics(&self) -> MonitorMetrics {
        self.metrics
    }

    #[must_use]
    pub fn snapshot(&self) -> MonitorStatus {
        let watchers = self
            .watchers
            .values()
            .map(|w| WatcherStatus {
                path: w.path().to_path_buf(),
                generation: w.generation(),
                state: w.state().clone(),
                rule_count: w.rules().len(),
                stats: w.stats(),
            })
            .collect();
        MonitorStatus {
            running: self.running,
            rule_count: self.rules.len(),
            watchers,
            history_len: self.aggregator.history_len(),
            active_warnings: self.aggregator.active_warnings().len(),
            regex_cache: self.ctx.matcher.cache_stats(),
            metrics: self.metrics,
        }
    }
}

impl<F, N> Drop for Monitor<F, N> {
    fn drop(&mut self) {
        for watcher in self.watchers.values_mut() {
            watcher.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFileSystem;
    use crate::notifier::{ManualNotifier, WakeReason};
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    const A: &str = "/var/log/a.log";
    const B: &str = "/var/log/b.log";

    #[derive(Default)]
    struct Errors(Mutex<Vec<WatchError>>);

    impl MonitorDiagnostics for Errors {
        fn on_watcher_error(&self, error: &WatchError) {
            self.0.lock().unwrap().push(error.clone());
        }
    }

    fn monitor(
        fs: &MemoryFileSystem,
        notifier: &ManualNotifier,
        rules: Vec<Rule>,
    ) -> Monitor<MemoryFileSystem, ManualNotifier> {
        Monitor::new(
            Arc::new(fs.clone()),
            Arc::new(notifier.clone()),
            RuntimeConfig::default(),
            rules,
        )
        .unwrap()
    }

    async fn next_match(m: &mut Monitor<MemoryFileSystem, ManualNotifier>) -> MatchEvent {
        tokio::time::timeout(Duration::from_secs(5), m.next_match())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn one_watcher_per_distinct_path() {
        let (fs, notifier) = (MemoryFileSystem::new(), ManualNotifier::new());
        fs.create(A, "");
        fs.create(B, "");
        let mut m = monitor(
            &fs,
            &notifier,
            vec![
                Rule::new("a1", "A1", "x", A),
                Rule::new("a2", "A2", "y", A),
                Rule::new("b1", "B1", "z", B),
                Rule::new("off", "Off", "z", "/var/log/off.log").with_enabled(false),
            ],
        );
        m.start();
        m.start();
        assert_eq!(m.watched_paths(), vec![PathBuf::from(A), PathBuf::from(B)]);
        assert_eq!(notifier.registrations(A), 1);
        assert_eq!(m.metrics().watchers_started, 2);

        let status = m.snapshot();
        assert_eq!(status.watchers[0].rule_count, 2);
        m.stop_all();
        assert!(m.watched_paths().is_empty());
        assert_eq!(notifier.registrations(A), 0);
    }

    #[tokio::test]
    async fn matches_flow_into_history_with_priority() {
        let (fs, notifier) = (MemoryFileSystem::new(), ManualNotifier::new());
        fs.create(A, "");
        let mut m = monitor(
            &fs,
            &notifier,
            vec![
                Rule::new("b-rule", "B", "zzz", B),
                Rule::new("a-rule", "A", "ERROR: (.*)", A),
            ],
        );
        m.start();
        fs.append(A, "ERROR: disk full\n").unwrap();
        notifier.wake(A, WakeReason::Modified);

        let event = next_match(&mut m).await;
        assert_eq!(event.rule_id.as_str(), "a-rule");
        assert_eq!(event.priority, 1);
        assert_eq!(event.captures, vec!["disk full".to_string()]);
        assert_eq!(event.line_number, 1);
        assert_eq!(m.recent_matches(10).len(), 1);
    }

    #[tokio::test]
    async fn open_failure_is_reported_once_and_retried_on_reload() {
        let (fs, notifier) = (MemoryFileSystem::new(), ManualNotifier::new());
        let errors = Arc::new(Errors::default());
        let rules = vec![Rule::new("a", "A", "x", A)];
        let mut m = monitor(&fs, &notifier, rules.clone());
        m.set_diagnostics(errors.clone());
        m.start();

        assert!(matches!(m.watcher_state(Path::new(A)), Some(WatcherState::Waiting { .. })));
        assert_eq!(errors.0.lock().unwrap().len(), 1);

        // Unrelated toggles do not retry or re-report.
        m.set_pattern_enabled(&RuleId::from("a"), true);
        assert_eq!(errors.0.lock().unwrap().len(), 1);

        fs.create(A, "");
        m.reload_patterns(rules).unwrap();
        assert_eq!(m.watcher_state(Path::new(A)), Some(&WatcherState::Active));
        assert_eq!(errors.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn enabling_a_rule_retries_a_parked_watcher_on_its_path() {
        let (fs, notifier) = (MemoryFileSystem::new(), ManualNotifier::new());
        let mut m = monitor(
            &fs,
            &notifier,
            vec![
                Rule::new("a", "A", "first", A),
                Rule::new("a2", "A2", "second", A).with_enabled(false),
            ],
        );
        m.start();
        assert!(matches!(m.watcher_state(Path::new(A)), Some(WatcherState::Waiting { .. })));

        fs.create(A, "");
        assert!(m.set_pattern_enabled(&RuleId::from("a2"), true));
        assert_eq!(m.watcher_state(Path::new(A)), Some(&WatcherState::Active));
        assert_eq!(notifier.registrations(A), 1);

        fs.append(A, "second\n").unwrap();
        notifier.wake(A, WakeReason::Modified);
        assert_eq!(next_match(&mut m).await.rule_id.as_str(), "a2");
    }

    #[tokio::test]
    async fn reload_keeps_unchanged_watchers_and_their_numbering() {
        let (fs, notifier) = (MemoryFileSystem::new(), ManualNotifier::new());
        fs.create(A, "");
        fs.create(B, "");
        let mut m = monitor(&fs, &notifier, vec![Rule::new("a", "A", "hit", A)]);
        m.start();
        fs.append(A, "hit\n").unwrap();
        notifier.wake(A, WakeReason::Modified);
        assert_eq!(next_match(&mut m).await.line_number, 1);
        let generation = m.snapshot().watchers[0].generation;

        m.reload_patterns(vec![
            Rule::new("a2", "A2", "again", A),
            Rule::new("b", "B", "hit", B),
        ])
        .unwrap();
        let status = m.snapshot();
        assert_eq!(status.watchers.len(), 2);
        assert_eq!(status.watchers[0].generation, generation);

        fs.append(A, "again\n").unwrap();
        notifier.wake(A, WakeReason::Modified);
        let event = next_match(&mut m).await;
        assert_eq!(event.rule_id.as_str(), "a2");
        assert_eq!(event.line_number, 2);
        assert_eq!(event.priority, 0);
    }

    #[tokio::test]
    async fn disabling_last_rule_stops_watcher_and_enabling_starts_it() {
        let (fs, notifier) = (MemoryFileSystem::new(), ManualNotifier::new());
        fs.create(A, "");
        let mut m = monitor(&fs, &notifier, vec![Rule::new("a", "A", "x", A)]);
        m.start();
        let id = RuleId::from("a");

        assert!(m.set_pattern_enabled(&id, false));
        assert!(m.watched_paths().is_empty());
        assert_eq!(notifier.registrations(A), 0);

        assert!(m.set_pattern_enabled(&id, true));
        assert_eq!(m.watched_paths(), vec![PathBuf::from(A)]);
        assert!(!m.set_pattern_enabled(&RuleId::from("ghost"), true));
    }

    #[tokio::test]
    async fn messages_from_stopped_watchers_are_discarded() {
        let (fs, notifier) = (MemoryFileSystem::new(), ManualNotifier::new());
        fs.create(A, "");
        let mut m = monitor(&fs, &notifier, vec![Rule::new("a", "A", "x", A)]);
        m.start();
        fs.append(A, "x\nx\nx\n").unwrap();
        notifier.wake(A, WakeReason::Modified);

        // Let the watcher queue its matches, then stop before draining.
        tokio::time::timeout(Duration::from_secs(5), async {
            while m.snapshot().watchers[0].stats.counters.lines_emitted < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        m.stop();
        m.process_pending();
        assert!(m.recent_matches(10).is_empty());
        assert_eq!(m.metrics().matches_recorded, 0);
    }

    #[tokio::test]
    async fn read_errors_reach_diagnostics_without_stopping_watcher() {
        use crate::fs::{FaultMode, FsOp};

        let (fs, notifier) = (MemoryFileSystem::new(), ManualNotifier::new());
        fs.create(A, "");
        let errors = Arc::new(Errors::default());
        let mut m = monitor(&fs, &notifier, vec![Rule::new("a", "A", "x", A)]);
        m.set_diagnostics(errors.clone());
        m.start();

        fs.append(A, "x\n").unwrap();
        fs.set_fault(
            FsOp::Read,
            FaultMode::fail_n_times(1, std::io::ErrorKind::Other, "eio"),
        );
        notifier.wake(A, WakeReason::Modified);
        let outcome = tokio::time::timeout(Duration::from_secs(5), m.next_message())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, MessageOutcome::WatcherError(WatchError::Read { .. })));
        assert_eq!(errors.0.lock().unwrap().len(), 1);

        notifier.wake(A, WakeReason::Modified);
        assert_eq!(next_match(&mut m).await.line, "x");
        assert_eq!(m.watcher_state(Path::new(A)), Some(&WatcherState::Active));
    }

    #[test]
    fn duplicate_rule_ids_are_rejected() {
        let fs = MemoryFileSystem::new();
        let notifier = ManualNotifier::new();
        let result = Monitor::new(
            Arc::new(fs),
            Arc::new(notifier),
            RuntimeConfig::default(),
            vec![Rule::new("a", "A", "x", A), Rule::new("a", "A", "y", B)],
        );
        assert!(result.is_err());
    }
}
