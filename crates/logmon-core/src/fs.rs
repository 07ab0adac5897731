//! File-system access seam
//!
//! The tailer never touches `std::fs` directly. It goes through [`FileSystem`]
//! and [`LogFile`] so tests can drive truncation, rotation and every I/O
//! failure deterministically with [`MemoryFileSystem`].
//!
//! Errors are plain `std::io::Error`; the kinds that matter to callers are
//! `NotFound`, `PermissionDenied` and `InvalidInput`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Device/inode pair used to detect that a path now names a different file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub identity: FileIdentity,
}

/// An open, readable log file.
pub trait LogFile: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Seek to an absolute offset from the start of the file.
    fn seek_to(&mut self, offset: u64) -> io::Result<u64>;

    /// Seek to end-of-file and return the new offset.
    fn seek_end(&mut self) -> io::Result<u64>;

    /// Stat the open handle (not the path).
    fn stat(&self) -> io::Result<FileStat>;

    /// Release the handle. Failures are reported but the handle is gone either way.
    fn close(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}

/// Opens and stats files by path.
pub trait FileSystem: Send + Sync + 'static {
    fn open(&self, path: &Path) -> io::Result<Box<dyn LogFile>>;

    /// Stat whatever the path currently names.
    fn stat(&self, path: &Path) -> io::Result<FileStat>;
}

// ---------------------------------------------------------------------------
// Real file system
// ---------------------------------------------------------------------------

/// `std::fs` backed implementation
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileSystem;

fn stat_from_metadata(metadata: &std::fs::Metadata) -> FileStat {
    #[cfg(unix)]
    let identity = {
        use std::os::unix::fs::MetadataExt;
        FileIdentity {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    };
    // Without inode numbers rotation is only visible as truncation.
    #[cfg(not(unix))]
    let identity = FileIdentity::default();

    FileStat {
        size: metadata.len(),
        identity,
    }
}

impl FileSystem for OsFileSystem {
    fn open(&self, path: &Path) -> io::Result<Box<dyn LogFile>> {
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        Ok(Box::new(OsLogFile { file }))
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        std::fs::metadata(path).map(|m| stat_from_metadata(&m))
    }
}

struct OsLogFile {
    file: File,
}

impl LogFile for OsLogFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn seek_to(&mut self, offset: u64) -> io::Result<u64> {
        self.file.seek(SeekFrom::Start(offset))
    }

    fn seek_end(&mut self) -> io::Result<u64> {
        self.file.seek(SeekFrom::End(0))
    }

    fn stat(&self) -> io::Result<FileStat> {
        self.file.metadata().map(|m| stat_from_metadata(&m))
    }
}

// ---------------------------------------------------------------------------
// In-memory file system with fault injection
// ---------------------------------------------------------------------------

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsOp {
    Open,
    Read,
    Seek,
    Stat,
    Close,
}

/// How an injected fault behaves.
#[derive(Debug, Clone)]
pub enum FaultMode {
    /// Fail every call until cleared.
    AlwaysFail { kind: io::ErrorKind, message: String },
    /// Fail the next N calls, then succeed.
    FailNTimes {
        remaining: u32,
        kind: io::ErrorKind,
        message: String,
    },
}

impl FaultMode {
    #[must_use]
    pub fn always_fail(kind: io::ErrorKind, message: impl Into<String>) -> Self {
        Self::AlwaysFail {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn fail_n_times(n: u32, kind: io::ErrorKind, message: impl Into<String>) -> Self {
        Self::FailNTimes {
            remaining: n,
            kind,
            message: message.into(),
        }
    }
}

const MEMORY_DEV: u64 = 1;

struct MemoryInode {
    ino: u64,
    data: Vec<u8>,
}

#[derive(Default)]
struct MemoryState {
    files: HashMap<PathBuf, Arc<Mutex<MemoryInode>>>,
    next_ino: u64,
    faults: HashMap<FsOp, FaultMode>,
    fault_hits: HashMap<FsOp, u32>,
}

impl MemoryState {
    fn check(&mut self, op: FsOp) -> io::Result<()> {
        let (result, exhausted) = match self.faults.get_mut(&op) {
            None => return Ok(()),
            Some(FaultMode::AlwaysFail { kind, message }) => {
                (Err(io::Error::new(*kind, message.clone())), false)
            }
            Some(FaultMode::FailNTimes {
                remaining,
                kind,
                message,
            }) => {
                if *remaining == 0 {
                    (Ok(()), true)
                } else {
                    *remaining -= 1;
                    (Err(io::Error::new(*kind, message.clone())), *remaining == 0)
                }
            }
        };
        if exhausted {
            self.faults.remove(&op);
        }
        if result.is_err() {
            *self.fault_hits.entry(op).or_default() += 1;
        }
        result
    }

    fn create(&mut self, path: &Path, data: Vec<u8>) {
        self.next_ino += 1;
        let inode = MemoryInode {
            ino: self.next_ino,
            data,
        };
        self.files
            .insert(path.to_path_buf(), Arc::new(Mutex::new(inode)));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{}: no such file", path.display()),
    )
}

/// In-memory file system for deterministic tests.
///
/// Handles keep pointing at the inode they opened, so renaming a path away
/// and creating a new file under it behaves like log rotation on a real
/// file system.
#[derive(Clone, Default)]
pub struct MemoryFileSystem {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryFileSystem {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace with a fresh identity) a file with the given contents.
    pub fn create(&self, path: impl AsRef<Path>, contents: impl AsRef<[u8]>) {
        lock(&self.state).create(path.as_ref(), contents.as_ref().to_vec());
    }

    /// Append bytes to an existing file.
    pub fn append(&self, path: impl AsRef<Path>, bytes: impl AsRef<[u8]>) -> io::Result<()> {
        let path = path.as_ref();
        let inode = lock(&self.state)
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))?;
        lock(&inode).data.extend_from_slice(bytes.as_ref());
        Ok(())
    }

    /// Shrink (or zero-extend) a file in place, keeping its identity.
    pub fn truncate(&self, path: impl AsRef<Path>, len: usize) -> io::Result<()> {
        let path = path.as_ref();
        let inode = lock(&self.state)
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))?;
        lock(&inode).data.resize(len, 0);
        Ok(())
    }

    /// Move a file to a new path, replacing whatever was there.
    pub fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> io::Result<()> {
        let (from, to) = (from.as_ref(), to.as_ref());
        let mut state = lock(&self.state);
        let inode = state.files.remove(from).ok_or_else(|| not_found(from))?;
        state.files.insert(to.to_path_buf(), inode);
        Ok(())
    }

    /// Unlink a path. Open handles keep reading the old contents.
    pub fn remove(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = path.as_ref();
        lock(&self.state)
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    /// Current contents of a file
    #[must_use]
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        let inode = lock(&self.state).files.get(path.as_ref()).cloned()?;
        let data = lock(&inode).data.clone();
        Some(data)
    }

    pub fn set_fault(&self, op: FsOp, mode: FaultMode) {
        lock(&self.state).faults.insert(op, mode);
    }

    pub fn clear_fault(&self, op: FsOp) {
        lock(&self.state).faults.remove(&op);
    }

    pub fn clear_faults(&self) {
        lock(&self.state).faults.clear();
    }

    /// How many times an injected fault fired for `op`.
    #[must_use]
    pub fn fault_hits(&self, op: FsOp) -> u32 {
        lock(&self.state).fault_hits.get(&op).copied().unwrap_or(0)
    }
}

impl FileSystem for MemoryFileSystem {
    fn open(&self, path: &Path) -> io::Result<Box<dyn LogFile>> {
        let mut state = lock(&self.state);
        state.check(FsOp::Open)?;
        let inode = state.files.get(path).cloned().ok_or_else(|| not_found(path))?;
        Ok(Box::new(MemoryLogFile {
            state: Arc::clone(&self.state),
            inode,
            pos: 0,
        }))
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let inode = {
            let mut state = lock(&self.state);
            state.check(FsOp::Stat)?;
            state.files.get(path).cloned().ok_or_else(|| not_found(path))?
        };
        let inode = lock(&inode);
        Ok(FileStat {
            size: inode.data.len() as u64,
            identity: FileIdentity {
                dev: MEMORY_DEV,
                ino: inode.ino,
            },
        })
    }
}

struct MemoryLogFile {
    state: Arc<Mutex<MemoryState>>,
    inode: Arc<Mutex<MemoryInode>>,
    pos: u64,
}

impl MemoryLogFile {
    fn check(&self, op: FsOp) -> io::Result<()> {
        lock(&self.state).check(op)
    }
}

impl LogFile for MemoryLogFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check(FsOp::Read)?;
        let inode = lock(&self.inode);
        let start = usize::try_from(self.pos).unwrap_or(usize::MAX);
        if start >= inode.data.len() {
            return Ok(0);
        }
        let available = &inode.data[start..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn seek_to(&mut self, offset: u64) -> io::Result<u64> {
        self.check(FsOp::Seek)?;
        self.pos = offset;
        Ok(offset)
    }

    fn seek_end(&mut self) -> io::Result<u64> {
        self.check(FsOp::Seek)?;
        self.pos = lock(&self.inode).data.len() as u64;
        Ok(self.pos)
    }

    fn stat(&self) -> io::Result<FileStat> {
        self.check(FsOp::Stat)?;
        let inode = lock(&self.inode);
        Ok(FileStat {
            size: inode.data.len() as u64,
            identity: FileIdentity {
                dev: MEMORY_DEV,
                ino: inode.ino,
            },
        })
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        self.check(FsOp::Close)
    }
}
