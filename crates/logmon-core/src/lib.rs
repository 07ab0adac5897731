//! logmon-core: Core library for the logmon passive log monitor
//!
//! Tails log files, matches each new line against user-defined regex rules,
//! and aggregates matches into a bounded history with streak warnings.
//!
//! # Architecture
//!
//! ```text
//! ChangeNotifier ──wake──▶ FileWatcher (task per path)
//!                             │  FileTail::poll + PatternMatcher
//!                             ▼
//!                    bounded channel ──▶ Monitor ──▶ MatchAggregator
//!                                                       │
//!                                                 MatchObserver / EventBus
//! ```
//!
//! # Modules
//!
//! - `rules`: Rule definitions and grouping by path
//! - `patterns`: Regex matching with an LRU cache of compiled patterns
//! - `fs`, `notifier`: Filesystem and change-notification seams
//! - `tailer`: Offset tracking, line splitting, truncation and rotation
//! - `watcher`: Per-path watcher tasks
//! - `aggregator`: Match history, streaks, frequent-match warnings
//! - `monitor`: Coordinator tying watchers to the aggregator
//! - `events`: Broadcast bus for match and status events
//! - `config`, `logging`: logmon.toml loading and tracing setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod aggregator;
pub mod config;
pub mod error;
pub mod events;
pub mod fs;
pub mod logging;
pub mod monitor;
pub mod notifier;
pub mod patterns;
pub mod rules;
pub mod tailer;
pub mod watcher;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
