//! Pattern matching engine
//!
//! Evaluates one log line against one rule with single-line, case-sensitive,
//! first-match semantics. Compiled expressions live in a bounded LRU cache
//! keyed by regex text that is shared by every watcher task:
//!
//! - cache hits take the shared lock only, so many watchers can match at once
//! - a miss compiles and inserts under the exclusive lock
//! - compile failures are cached too, so a broken rule is logged once and then
//!   stays silent instead of being recompiled for every line

use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use fancy_regex::Regex;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::PatternError;
use crate::rules::Rule;

/// Default number of compiled expressions kept in the cache
pub const DEFAULT_REGEX_CACHE_CAPACITY: usize = 100;

/// A successful match of one line against one rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Byte range of the whole match within the line
    pub range: Range<usize>,
    /// Capture groups 1..=k in declaration order. Always exactly k entries;
    /// a group that did not participate in the match is an empty string.
    pub captures: Vec<String>,
}

#[derive(Clone)]
enum CachedRegex {
    Compiled(Arc<Regex>),
    Invalid(PatternError),
}

impl CachedRegex {
    fn compile(pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(regex) => Self::Compiled(Arc::new(regex)),
            Err(err) => Self::Invalid(PatternError::InvalidRegex {
                pattern: pattern.to_string(),
                message: err.to_string(),
            }),
        }
    }

    fn into_result(self) -> Result<Arc<Regex>, PatternError> {
        match self {
            Self::Compiled(regex) => Ok(regex),
            Self::Invalid(err) => Err(err),
        }
    }
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
    pub capacity: usize,
}

/// Bounded, thread-safe cache of compiled expressions with LRU eviction.
pub struct RegexCache {
    entries: RwLock<LruCache<String, CachedRegex>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RegexCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fetch the compiled expression for `pattern`, compiling it on a miss.
    pub fn get_or_compile(&self, pattern: &str) -> Result<Arc<Regex>, PatternError> {
        let cached = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries.peek(pattern).cloned()
        };
        if let Some(entry) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.touch(pattern);
            return entry.into_result();
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        // Another watcher may have compiled it while we waited for the lock.
        if let Some(entry) = entries.get(pattern) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return entry.clone().into_result();
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let entry = CachedRegex::compile(pattern);
        if let CachedRegex::Invalid(err) = &entry {
            warn!(regex = pattern, error = %err, "Regex failed to compile; rule disabled until fixed");
        } else {
            trace!(regex = pattern, "Compiled regex");
        }
        entries.put(pattern.to_string(), entry.clone());
        entry.into_result()
    }

    /// Recency update for a hit. Skipped when the exclusive lock is busy:
    /// a concurrent miss is inserting and readers must not queue behind it.
    fn touch(&self, pattern: &str) {
        if let Ok(mut entries) = self.entries.try_write() {
            entries.promote(pattern);
        }
    }

    /// Whether `pattern` is currently cached (does not affect recency)
    #[must_use]
    pub fn contains(&self, pattern: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(pattern)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len: entries.len(),
            capacity: entries.cap().get(),
        }
    }
}

impl Default for RegexCache {
    fn default() -> Self {
        Self::new(DEFAULT_REGEX_CACHE_CAPACITY)
    }
}

/// Line-against-rule evaluator. Pure apart from cache mutation.
#[derive(Default)]
pub struct PatternMatcher {
    cache: RegexCache,
}

impl PatternMatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cache_capacity(capacity: usize) -> Self {
        Self {
            cache: RegexCache::new(capacity),
        }
    }

    /// Evaluate `line` against `rule`.
    ///
    /// Returns `None` for disabled rules, regexes that fail to compile, and
    /// lines without a match.
    #[must_use]
    pub fn match_line(&self, line: &str, rule: &Rule) -> Option<MatchResult> {
        if !rule.enabled {
            return None;
        }

        let regex = self.cache.get_or_compile(&rule.regex).ok()?;
        match regex.captures(line) {
            Ok(Some(captures)) => {
                let whole = captures.get(0)?;
                let group_count = regex.captures_len().saturating_sub(1);
                let groups = (1..=group_count)
                    .map(|i| {
                        captures
                            .get(i)
                            .map_or_else(String::new, |m| m.as_str().to_string())
                    })
                    .collect();
                Some(MatchResult {
                    range: whole.start()..whole.end(),
                    captures: groups,
                })
            }
            Ok(None) => None,
            Err(err) => {
                // Backtrack limit and similar runtime failures: treat as no match.
                warn!(rule_id = %rule.id, error = %err, "Regex evaluation failed");
                None
            }
        }
    }

    /// Compile `regex` (through the cache) and return its capture-group count.
    pub fn validate(&self, regex: &str) -> Result<usize, PatternError> {
        let compiled = self.cache.get_or_compile(regex)?;
        Ok(compiled.captures_len().saturating_sub(1))
    }

    #[must_use]
    pub fn cache(&self) -> &RegexCache {
        &self.cache
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
