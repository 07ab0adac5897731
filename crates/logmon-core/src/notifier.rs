//! Change-notification seam
//!
//! A [`ChangeNotifier`] delivers edge-triggered wakes for one path into a
//! tokio channel. Watchers never poll on a timer: no wake, no read.
//!
//! [`FsEventNotifier`] is backed by `notify` (inotify/FSEvents/kqueue). It
//! watches the parent directory rather than the file itself so a rotated
//! path keeps producing wakes once the new file appears.
//! [`ManualNotifier`] lets tests decide exactly when a watcher wakes.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Why a watcher was woken. Informational only: the tailer re-evaluates
/// rotation and truncation on every wake regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Modified,
    Created,
    Renamed,
    Removed,
    Manual,
}

pub type WakeSender = mpsc::UnboundedSender<WakeReason>;
pub type WakeReceiver = mpsc::UnboundedReceiver<WakeReason>;

/// Live interest in one path. Cancelling (or dropping) stops further wakes.
pub trait Registration: Send {
    fn cancel(&mut self);
}

pub trait ChangeNotifier: Send + Sync + 'static {
    /// Register interest in writes, extends, renames and deletes of `path`.
    fn register(&self, path: &Path, wake: WakeSender) -> io::Result<Box<dyn Registration>>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// notify-backed implementation
// ---------------------------------------------------------------------------

struct Route {
    path: PathBuf,
    wake: WakeSender,
}

type Routes = HashMap<u64, Route>;

struct DirWatches {
    watcher: RecommendedWatcher,
    refs: HashMap<PathBuf, usize>,
}

/// OS file-change notifier shared by every watcher.
///
/// One `notify` watcher serves all paths; parent directories are watched
/// non-recursively and reference counted.
pub struct FsEventNotifier {
    // Locked by the notify callback thread; never held while calling into notify.
    routes: Arc<Mutex<Routes>>,
    dirs: Arc<Mutex<DirWatches>>,
    next_id: AtomicU64,
}

fn classify(kind: &EventKind) -> Option<WakeReason> {
    match kind {
        EventKind::Access(_) => None,
        EventKind::Create(_) => Some(WakeReason::Created),
        EventKind::Remove(_) => Some(WakeReason::Removed),
        EventKind::Modify(ModifyKind::Name(_)) => Some(WakeReason::Renamed),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => Some(WakeReason::Modified),
    }
}

fn dispatch(routes: &Mutex<Routes>, event: &Event) {
    let Some(reason) = classify(&event.kind) else {
        return;
    };
    let routes = lock(routes);
    for route in routes.values() {
        if event.paths.iter().any(|p| p == &route.path) {
            trace!(path = %route.path.display(), ?reason, "File change notification");
            // A closed receiver means the watcher is stopping; its registration
            // is about to be cancelled.
            let _ = route.wake.send(reason);
        }
    }
}

impl FsEventNotifier {
    pub fn new() -> io::Result<Self> {
        let routes: Arc<Mutex<Routes>> = Arc::new(Mutex::new(HashMap::new()));
        let handler_routes = Arc::clone(&routes);
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => dispatch(&handler_routes, &event),
            Err(err) => warn!(error = %err, "File notification backend error"),
        })
        .map_err(io::Error::other)?;

        Ok(Self {
            routes,
            dirs: Arc::new(Mutex::new(DirWatches {
                watcher,
                refs: HashMap::new(),
            })),
            next_id: AtomicU64::new(1),
        })
    }
}

impl ChangeNotifier for FsEventNotifier {
    fn register(&self, path: &Path, wake: WakeSender) -> io::Result<Box<dyn Registration>> {
        let path = std::path::absolute(path)?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;

        {
            let mut dirs = lock(&self.dirs);
            let count = dirs.refs.get(&dir).copied().unwrap_or(0);
            if count == 0 {
                dirs.watcher
                    .watch(&dir, RecursiveMode::NonRecursive)
                    .map_err(io::Error::other)?;
                debug!(dir = %dir.display(), "Watching directory");
            }
            dirs.refs.insert(dir.clone(), count + 1);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.routes).insert(id, Route { path, wake });

        Ok(Box::new(FsRegistration {
            id,
            dir,
            routes: Arc::clone(&self.routes),
            dirs: Arc::clone(&self.dirs),
            cancelled: false,
        }))
    }
}

struct FsRegistration {
    id: u64,
    dir: PathBuf,
    routes: Arc<Mutex<Routes>>,
    dirs: Arc<Mutex<DirWatches>>,
    cancelled: bool,
}

impl Registration for FsRegistration {
    fn cancel(&mut self) {
        if std::mem::replace(&mut self.cancelled, true) {
            return;
        }
        lock(&self.routes).remove(&self.id);

        let mut dirs = lock(&self.dirs);
        let remaining = match dirs.refs.get_mut(&self.dir) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };
        if remaining == 0 {
            dirs.refs.remove(&self.dir);
            if let Err(err) = dirs.watcher.unwatch(&self.dir) {
                // The directory may already be gone.
                debug!(dir = %self.dir.display(), error = %err, "Unwatch failed");
            }
        }
    }
}

impl Drop for FsRegistration {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ---------------------------------------------------------------------------
// Manual implementation for tests
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ManualState {
    routes: HashMap<u64, Route>,
    next_id: u64,
    failing: HashSet<PathBuf>,
}

/// Notifier whose wakes are triggered explicitly with [`ManualNotifier::wake`].
#[derive(Clone, Default)]
pub struct ManualNotifier {
    state: Arc<Mutex<ManualState>>,
}

impl ManualNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every live registration for `path`. Returns how many were woken.
    pub fn wake(&self, path: impl AsRef<Path>, reason: WakeReason) -> usize {
        let state = lock(&self.state);
        state
            .routes
            .values()
            .filter(|r| r.path == path.as_ref())
            .filter(|r| r.wake.send(reason).is_ok())
            .count()
    }

    /// Number of live registrations for `path`
    #[must_use]
    pub fn registrations(&self, path: impl AsRef<Path>) -> usize {
        lock(&self.state)
            .routes
            .values()
            .filter(|r| r.path == path.as_ref())
            .count()
    }

    /// Make future registrations for `path` fail (or succeed again).
    pub fn set_failing(&self, path: impl AsRef<Path>, failing: bool) {
        let mut state = lock(&self.state);
        if failing {
            state.failing.insert(path.as_ref().to_path_buf());
        } else {
            state.failing.remove(path.as_ref());
        }
    }
}

impl ChangeNotifier for ManualNotifier {
    fn register(&self, path: &Path, wake: WakeSender) -> io::Result<Box<dyn Registration>> {
        let mut state = lock(&self.state);
        if state.failing.contains(path) {
            return Err(io::Error::other("watch limit reached"));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.routes.insert(
            id,
            Route {
                path: path.to_path_buf(),
                wake,
            },
        );
        Ok(Box::new(ManualRegistration {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

struct ManualRegistration {
    id: u64,
    state: Arc<Mutex<ManualState>>,
}

impl Registration for ManualRegistration {
    fn cancel(&mut self) {
        lock(&self.state).routes.remove(&self.id);
    }
}

impl Drop for ManualRegistration {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RenameMode};

    #[test]
    fn manual_wake_reaches_registered_path_only() {
        let notifier = ManualNotifier::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let _a = notifier.register(Path::new("/a.log"), tx_a).unwrap();
        let _b = notifier.register(Path::new("/b.log"), tx_b).unwrap();

        assert_eq!(notifier.wake("/a.log", WakeReason::Modified), 1);
        assert_eq!(rx_a.try_recv().unwrap(), WakeReason::Modified);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn dropping_registration_stops_wakes() {
        let notifier = ManualNotifier::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registration = notifier.register(Path::new("/a.log"), tx).unwrap();
        assert_eq!(notifier.registrations("/a.log"), 1);
        drop(registration);
        assert_eq!(notifier.registrations("/a.log"), 0);
        assert_eq!(notifier.wake("/a.log", WakeReason::Manual), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn failing_registration_is_reported() {
        let notifier = ManualNotifier::new();
        notifier.set_failing("/a.log", true);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(notifier.register(Path::new("/a.log"), tx.clone()).is_err());
        notifier.set_failing("/a.log", false);
        assert!(notifier.register(Path::new("/a.log"), tx).is_ok());
    }

    #[test]
    fn classify_maps_event_kinds() {
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(WakeReason::Modified)
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::From))),
            Some(WakeReason::Renamed)
        );
        assert_eq!(
            classify(&EventKind::Create(CreateKind::File)),
            Some(WakeReason::Created)
        );
        assert_eq!(
            classify(&EventKind::Access(notify::event::AccessKind::Any)),
            None
        );
    }

    #[test]
    fn dispatch_filters_by_exact_path() {
        let routes = Mutex::new(HashMap::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        routes.lock().unwrap().insert(
            1,
            Route {
                path: PathBuf::from("/var/log/app.log"),
                wake: tx,
            },
        );

        let other = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/var/log/other.log"));
        dispatch(&routes, &other);
        assert!(rx.try_recv().is_err());

        let ours = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/var/log/app.log"));
        dispatch(&routes, &ours);
        assert_eq!(rx.try_recv().unwrap(), WakeReason::Modified);
    }

    #[test]
    fn fs_notifier_registers_and_cancels_directory_watch() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = FsEventNotifier::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let path = dir.path().join("app.log");

        let mut first = notifier.register(&path, tx.clone()).unwrap();
        let second = notifier.register(&path, tx).unwrap();
        assert_eq!(lock(&notifier.dirs).refs.get(dir.path()), Some(&2));

        first.cancel();
        first.cancel();
        assert_eq!(lock(&notifier.dirs).refs.get(dir.path()), Some(&1));
        drop(second);
        assert!(lock(&notifier.dirs).refs.is_empty());
        assert!(lock(&notifier.routes).is_empty());
    }

    #[test]
    fn fs_notifier_rejects_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = FsEventNotifier::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let path = dir.path().join("missing").join("app.log");
        assert!(notifier.register(&path, tx).is_err());
        assert!(lock(&notifier.dirs).refs.is_empty());
    }
}
