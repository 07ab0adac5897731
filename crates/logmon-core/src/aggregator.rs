//! Match history and frequency warnings.
//!
//! [`MatchAggregator`] turns a stream of matches into a bounded,
//! chronological history plus per-rule streak tracking. A streak counts
//! consecutive matches of the same rule with no other rule matching in
//! between; a streak reaching the threshold raises one
//! [`FrequentMatchWarning`] for that rule until it is acknowledged.
//!
//! All operations take `&mut self`: the aggregator has exactly one writer.
//! Observers are held weakly and pruned once their owner drops them.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::rules::{Rule, RuleId};

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;
pub const DEFAULT_WARNING_THRESHOLD: u32 = 50;

/// An immutable record of one rule matching one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchEvent {
    /// Monotonic per-aggregator sequence number
    pub id: u64,
    pub rule_id: RuleId,
    pub rule_name: String,
    pub line: String,
    pub line_number: u64,
    pub path: PathBuf,
    /// Registration order of the rule; lower wins
    pub priority: u32,
    pub captures: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequentMatchWarning {
    pub rule_id: RuleId,
    pub rule_name: String,
    pub message: String,
    pub triggered_at: DateTime<Utc>,
}

/// Receives aggregator notifications.
///
/// For a single `handle_match` call, `on_match_detected` always precedes
/// `on_history_updated`.
pub trait MatchObserver: Send + Sync {
    fn on_match_detected(&self, _event: &MatchEvent) {}

    /// Full history, oldest first
    fn on_history_updated(&self, _history: &[MatchEvent]) {}

    /// All active warnings, oldest trigger first
    fn on_warnings_updated(&self, _warnings: &[FrequentMatchWarning]) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorConfig {
    pub history_capacity: usize,
    pub warning_threshold: u32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
        }
    }
}

pub struct MatchAggregator {
    config: AggregatorConfig,
    history: VecDeque<MatchEvent>,
    streaks: HashMap<RuleId, u32>,
    last_matched: Option<RuleId>,
    warnings: Vec<FrequentMatchWarning>,
    observers: Vec<Weak<dyn MatchObserver>>,
    next_id: u64,
}

impl Default for MatchAggregator {
    fn default() -> Self {
        Self::new(AggregatorConfig::default())
    }
}

impl MatchAggregator {
    #[must_use]
    pub fn new(config: AggregatorConfig) -> Self {
        let config = AggregatorConfig {
            history_capacity: config.history_capacity.max(1),
            warning_threshold: config.warning_threshold.max(1),
        };
        Self {
            config,
            history: VecDeque::with_capacity(config.history_capacity),
            streaks: HashMap::new(),
            last_matched: None,
            warnings: Vec::new(),
            observers: Vec::new(),
            next_id: 1,
        }
    }

    #[must_use]
    pub fn config(&self) -> AggregatorConfig {
        self.config
    }

    /// Register an observer without taking ownership of it.
    pub fn add_observer<O: MatchObserver + 'static>(&mut self, observer: &Arc<O>) {
        let weak = Arc::downgrade(observer);
        let weak: Weak<dyn MatchObserver> = weak;
        self.observers.push(weak);
    }

    /// Number of observers still alive
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers
            .iter()
            .filter(|o| o.strong_count() > 0)
            .count()
    }

    /// Record one match.
    pub fn handle_match(
        &mut self,
        rule: &Rule,
        line: impl Into<String>,
        line_number: u64,
        path: &Path,
        priority: u32,
        captures: Vec<String>,
    ) {
        let event = MatchEvent {
            id: self.next_id,
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            line: line.into(),
            line_number,
            path: path.to_path_buf(),
            priority,
            captures,
            created_at: Utc::now(),
        };
        self.next_id += 1;

        self.history.push_back(event);
        while self.history.len() > self.config.history_capacity {
            self.history.pop_front();
        }

        let observers = self.live_observers();
        if let Some(event) = self.history.back() {
            for observer in &observers {
                observer.on_match_detected(event);
            }
        }
        let history = self.history.make_contiguous();
        for observer in &observers {
            observer.on_history_updated(history);
        }

        let streak = self.advance_streak(&rule.id);
        if streak >= self.config.warning_threshold && !self.has_warning(&rule.id) {
            let warning = FrequentMatchWarning {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                message: format!(
                    "Rule '{}' matched {streak} times in a row",
                    rule.name
                ),
                triggered_at: Utc::now(),
            };
            info!(rule_id = %rule.id, streak, "Frequent match warning raised");
            self.warnings.push(warning);
            for observer in &observers {
                observer.on_warnings_updated(&self.warnings);
            }
        }
    }

    /// Up to `limit` events, newest first. Non-positive limits yield nothing.
    #[must_use]
    pub fn recent_matches(&self, limit: i64) -> Vec<MatchEvent> {
        let Ok(limit) = usize::try_from(limit) else {
            return Vec::new();
        };
        self.history.iter().rev().take(limit).cloned().collect()
    }

    /// Whole history, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<MatchEvent> {
        self.history.iter().cloned().collect()
    }

    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Most recently recorded event
    #[must_use]
    pub fn latest(&self) -> Option<&MatchEvent> {
        self.history.back()
    }

    /// Drop history, streaks and warnings.
    pub fn clear_history(&mut self) {
        if self.history.is_empty() {
            return;
        }
        self.history.clear();
        self.streaks.clear();
        self.last_matched = None;
        let had_warnings = !self.warnings.is_empty();
        self.warnings.clear();
        debug!(had_warnings, "History cleared");

        let observers = self.live_observers();
        for observer in &observers {
            observer.on_history_updated(&[]);
        }
        if had_warnings {
            for observer in &observers {
                observer.on_warnings_updated(&[]);
            }
        }
    }

    /// Retract the warning for `rule_id` and restart its streak.
    /// Returns `false` (and notifies nobody) when no such warning exists.
    pub fn acknowledge_warning(&mut self, rule_id: &RuleId) -> bool {
        let Some(index) = self.warnings.iter().position(|w| &w.rule_id == rule_id) else {
            return false;
        };
        self.warnings.remove(index);
        self.streaks.insert(rule_id.clone(), 0);
        if self.last_matched.as_ref() == Some(rule_id) {
            self.last_matched = None;
        }
        debug!(rule_id = %rule_id, "Warning acknowledged");

        let observers = self.live_observers();
        for observer in &observers {
            observer.on_warnings_updated(&self.warnings);
        }
        true
    }

    /// Active warnings ordered by trigger time, oldest first.
    #[must_use]
    pub fn active_warnings(&self) -> &[FrequentMatchWarning] {
        &self.warnings
    }

    /// Current streak for a rule (0 if none)
    #[must_use]
    pub fn streak(&self, rule_id: &RuleId) -> u32 {
        self.streaks.get(rule_id).copied().unwrap_or(0)
    }

    fn has_warning(&self, rule_id: &RuleId) -> bool {
        self.warnings.iter().any(|w| &w.rule_id == rule_id)
    }

    fn advance_streak(&mut self, rule_id: &RuleId) -> u32 {
        if self.last_matched.as_ref() == Some(rule_id) {
            let streak = self.streaks.entry(rule_id.clone()).or_insert(0);
            *streak += 1;
            return *streak;
        }
        // Switching rules zeroes the previous streak; returning to it later
        // starts over at 1.
        if let Some(previous) = self.last_matched.replace(rule_id.clone()) {
            self.streaks.insert(previous, 0);
        }
        self.streaks.insert(rule_id.clone(), 1);
        1
    }

    fn live_observers(&mut self) -> Vec<Arc<dyn MatchObserver>> {
        let mut live = Vec::with_capacity(self.observers.len());
        self.observers.retain(|weak| match weak.upgrade() {
            Some(observer) => {
                live.push(observer);
                true
            }
            None => false,
        });
        live
    }
}
