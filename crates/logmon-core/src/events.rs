//! Event bus for matches, warnings and watcher diagnostics
//!
//! Provides bounded broadcast channels and fanout for monitor events.
//!
//! # Architecture
//!
//! The event bus uses tokio's broadcast channels for multi-consumer fanout:
//! - The monitor publishes through a [`BusObserver`] registered with its
//!   aggregator, so bus order is aggregator notification order
//! - Subscribers can listen to all events or only matches / only status
//! - Bounded capacity provides backpressure (slow consumers get lagged)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use logmon_core::events::{BusObserver, EventBus};
//! use logmon_core::monitor::Monitor;
//!
//! # async fn run(mut monitor: Monitor) {
//! let bus = Arc::new(EventBus::new(1000));
//! let observer = Arc::new(BusObserver::new(Arc::clone(&bus)));
//! monitor.add_observer(&observer);
//! monitor.set_diagnostics(observer.clone());
//!
//! let mut subscriber = bus.subscribe();
//! while let Ok(event) = subscriber.recv().await {
//!     println!("{}", event.type_name());
//! }
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::aggregator::{FrequentMatchWarning, MatchEvent, MatchObserver};
use crate::error::WatchError;
use crate::monitor::MonitorDiagnostics;

/// Event types that flow through the system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A rule matched a line
    MatchDetected { event: MatchEvent },

    /// History changed; full snapshot, oldest first
    HistoryUpdated { history: Vec<MatchEvent> },

    /// Warning set changed; full snapshot, oldest trigger first
    WarningsUpdated { warnings: Vec<FrequentMatchWarning> },

    /// A watcher could not open or read its file
    WatcherError { error: WatchError },
}

impl Event {
    /// Returns the event type name for logging/metrics
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::MatchDetected { .. } => "match_detected",
            Self::HistoryUpdated { .. } => "history_updated",
            Self::WarningsUpdated { .. } => "warnings_updated",
            Self::WatcherError { .. } => "watcher_error",
        }
    }
}

/// Metrics for monitoring event bus health
#[derive(Debug, Default)]
pub struct EventBusMetrics {
    /// Total events published since bus creation
    pub events_published: AtomicU64,
    /// Events published that had no subscribers
    pub events_dropped_no_subscribers: AtomicU64,
    /// Number of currently active subscribers
    pub active_subscribers: AtomicU64,
    /// Total lag events (slow consumer missed messages)
    pub subscriber_lag_events: AtomicU64,
}

impl EventBusMetrics {
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_dropped_no_subscribers: self
                .events_dropped_no_subscribers
                .load(Ordering::Relaxed),
            active_subscribers: self.active_subscribers.load(Ordering::Relaxed),
            subscriber_lag_events: self.subscriber_lag_events.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of event bus metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub events_published: u64,
    pub events_dropped_no_subscribers: u64,
    pub active_subscribers: u64,
    pub subscriber_lag_events: u64,
}

/// Event bus for distributing events to subscribers via broadcast fanout
///
/// If a subscriber falls behind it receives a lag error and misses
/// intermediate messages; publishing never blocks the monitor.
pub struct EventBus {
    all_sender: broadcast::Sender<Event>,
    match_sender: broadcast::Sender<Event>,
    status_sender: broadcast::Sender<Event>,
    capacity: usize,
    metrics: Arc<EventBusMetrics>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EventBus {
    /// Create a new event bus; `capacity` is the per-subscriber backlog
    /// before lagging starts.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all_sender, _) = broadcast::channel(capacity);
        let (match_sender, _) = broadcast::channel(capacity);
        let (status_sender, _) = broadcast::channel(capacity);
        Self {
            all_sender,
            match_sender,
            status_sender,
            capacity,
            metrics: Arc::new(EventBusMetrics::default()),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.all_sender.receiver_count()
            + self.match_sender.receiver_count()
            + self.status_sender.receiver_count()
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<EventBusMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Publish an event to all subscribers
    ///
    /// Returns the number of subscribers that received the event.
    #[must_use]
    pub fn publish(&self, event: Event) -> usize {
        self.metrics
            .events_published
            .fetch_add(1, Ordering::Relaxed);
        let mut delivered = 0usize;

        if let Ok(count) = self.all_sender.send(event.clone()) {
            delivered += count;
        }

        let routed = match event {
            Event::MatchDetected { .. } => &self.match_sender,
            Event::HistoryUpdated { .. }
            | Event::WarningsUpdated { .. }
            | Event::WatcherError { .. } => &self.status_sender,
        };
        delivered += routed.send(event).unwrap_or(0);

        if delivered == 0 {
            self.metrics
                .events_dropped_no_subscribers
                .fetch_add(1, Ordering::Relaxed);
        }

        delivered
    }

    /// Subscribe to every event
    #[must_use]
    pub fn subscribe(&self) -> EventSubscriber {
        self.subscriber(&self.all_sender)
    }

    /// Subscribe to match events only
    #[must_use]
    pub fn subscribe_matches(&self) -> EventSubscriber {
        self.subscriber(&self.match_sender)
    }

    /// Subscribe to history/warning snapshots and watcher errors
    #[must_use]
    pub fn subscribe_status(&self) -> EventSubscriber {
        self.subscriber(&self.status_sender)
    }

    fn subscriber(&self, sender: &broadcast::Sender<Event>) -> EventSubscriber {
        self.metrics
            .active_subscribers
            .fetch_add(1, Ordering::Relaxed);
        EventSubscriber {
            receiver: sender.subscribe(),
            metrics: Arc::clone(&self.metrics),
            lagged_count: 0,
        }
    }
}

/// Error returned when receiving events
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    /// The event bus was closed (all senders dropped)
    #[error("event bus closed")]
    Closed,
    /// Subscriber fell behind and missed events
    #[error("subscriber lagged, missed {missed_count} events")]
    Lagged { missed_count: u64 },
}

/// Subscriber handle for receiving events from the bus
///
/// Dropping the subscriber automatically unsubscribes and decrements metrics.
pub struct EventSubscriber {
    receiver: broadcast::Receiver<Event>,
    metrics: Arc<EventBusMetrics>,
    lagged_count: u64,
}

impl EventSubscriber {
    /// Receive the next event
    ///
    /// # Errors
    /// - `RecvError::Closed` if the event bus was dropped
    /// - `RecvError::Lagged` if this subscriber fell behind (events were missed)
    pub async fn recv(&mut self) -> Result<Event, RecvError> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Closed) => Err(RecvError::Closed),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(self.lagged(n)),
        }
    }

    /// Try to receive an event without blocking
    ///
    /// Returns `None` if no event is immediately available.
    pub fn try_recv(&mut self) -> Option<Result<Event, RecvError>> {
        match self.receiver.try_recv() {
            Ok(event) => Some(Ok(event)),
            Err(broadcast::error::TryRecvError::Empty) => None,
            Err(broadcast::error::TryRecvError::Closed) => Some(Err(RecvError::Closed)),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Some(Err(self.lagged(n))),
        }
    }

    /// Total number of events this subscriber has missed due to lag
    #[must_use]
    pub fn lagged_count(&self) -> u64 {
        self.lagged_count
    }

    fn lagged(&mut self, n: u64) -> RecvError {
        self.lagged_count += n;
        self.metrics
            .subscriber_lag_events
            .fetch_add(n, Ordering::Relaxed);
        RecvError::Lagged { missed_count: n }
    }
}

impl Drop for EventSubscriber {
    fn drop(&mut self) {
        self.metrics
            .active_subscribers
            .fetch_sub(1, Ordering::Relaxed);
    }
}

/// Forwards aggregator notifications and watcher diagnostics onto a bus.
pub struct BusObserver {
    bus: Arc<EventBus>,
}

impl BusObserver {
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl MatchObserver for BusObserver {
    fn on_match_detected(&self, event: &MatchEvent) {
        let _ = self.bus.publish(Event::MatchDetected {
            event: event.clone(),
        });
    }

    fn on_history_updated(&self, history: &[MatchEvent]) {
        let _ = self.bus.publish(Event::HistoryUpdated {
            history: history.to_vec(),
        });
    }

    fn on_warnings_updated(&self, warnings: &[FrequentMatchWarning]) {
        let _ = self.bus.publish(Event::WarningsUpdated {
            warnings: warnings.to_vec(),
        });
    }
}

impl MonitorDiagnostics for BusObserver {
    fn on_watcher_error(&self, error: &WatchError) {
        let _ = self.bus.publish(Event::WatcherError {
            error: error.clone(),
        });
    }
}
