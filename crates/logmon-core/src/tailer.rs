//! Incremental file tailing.
//!
//! [`FileTail`] is the synchronous per-path state machine behind each
//! watcher: read offset, pending fragment, identity marker and line counter.
//! It is driven one wake at a time by [`FileTail::poll`], which always runs
//! on a blocking thread.
//!
//! Every poll re-evaluates, in order:
//!
//! 1. rotation: the path names a different device/inode than the open
//!    handle. The old handle is drained, then the new file is read from
//!    offset 0 and line numbering restarts.
//! 2. truncation: the handle's size is below the read offset. The offset
//!    and pending fragment reset and reading restarts from 0. Line
//!    numbering continues.
//! 3. reading everything currently available.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::WatchError;
use crate::fs::{FileIdentity, FileSystem, LogFile};

/// Upper bound on a single read call.
pub const DEFAULT_MAX_READ_BYTES: usize = 8 * 1024 * 1024;

/// An unterminated fragment longer than this is discarded.
pub const MAX_PENDING_FRAGMENT: usize = 1024 * 1024;

const MIN_READ_CHUNK: usize = 4096;

/// One complete line read from the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailLine {
    /// 1-based, counted since the watcher opened (or re-opened after rotation)
    pub number: u64,
    pub text: String,
}

/// Running counters for one tail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailCounters {
    pub lines_emitted: u64,
    pub bytes_read: u64,
    pub truncations: u64,
    pub rotations: u64,
    pub read_errors: u64,
    pub fragments_discarded: u64,
}

/// Result of one wake.
#[derive(Debug, Default)]
pub struct PollOutcome {
    pub lines: Vec<TailLine>,
    pub errors: Vec<WatchError>,
    pub rotated: bool,
    pub truncated: bool,
}

pub struct FileTail {
    path: PathBuf,
    file: Option<Box<dyn LogFile>>,
    identity: FileIdentity,
    offset: u64,
    pending: Vec<u8>,
    // Set after an oversized fragment is dropped: skip through the next newline.
    skipping: bool,
    line_number: u64,
    max_read_bytes: usize,
    counters: TailCounters,
}

impl std::fmt::Debug for FileTail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTail")
            .field("path", &self.path)
            .field("identity", &self.identity)
            .field("offset", &self.offset)
            .field("pending", &self.pending.len())
            .field("line_number", &self.line_number)
            .finish_non_exhaustive()
    }
}

impl FileTail {
    /// Open `path` positioned at end-of-file. Existing content is never emitted.
    pub fn open<F: FileSystem + ?Sized>(
        fs: &F,
        path: &Path,
        max_read_bytes: usize,
    ) -> Result<Self, WatchError> {
        let mut file = fs.open(path).map_err(|e| WatchError::file_access(path, &e))?;
        let stat = file.stat().map_err(|e| WatchError::file_access(path, &e))?;
        let offset = file.seek_end().map_err(|e| WatchError::file_access(path, &e))?;
        debug!(path = %path.display(), offset, "Tail opened at end of file");

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            identity: stat.identity,
            offset,
            pending: Vec::new(),
            skipping: false,
            line_number: 0,
            max_read_bytes: max_read_bytes.max(1),
            counters: TailCounters::default(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of the last emitted line (0 if none yet)
    #[must_use]
    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    #[must_use]
    pub fn counters(&self) -> TailCounters {
        self.counters
    }

    /// Handle one wake.
    pub fn poll<F: FileSystem + ?Sized>(&mut self, fs: &F) -> PollOutcome {
        let mut out = PollOutcome::default();
        if self.file.is_none() {
            return out;
        }

        self.check_rotation(fs, &mut out);
        self.check_truncation(&mut out);
        self.read_available(&mut out);
        out
    }

    /// Release the handle; close failures are logged, never propagated.
    pub fn close(mut self) {
        self.close_handle();
    }

    fn close_handle(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(err) = file.close() {
                warn!(path = %self.path.display(), error = %err, "Closing log file failed");
            }
        }
    }

    fn check_rotation<F: FileSystem + ?Sized>(&mut self, fs: &F, out: &mut PollOutcome) {
        let current = match fs.stat(&self.path) {
            Ok(stat) => stat,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // Rotated away and not recreated yet; keep reading the old handle.
                trace!(path = %self.path.display(), "Path missing; following old handle");
                return;
            }
            Err(err) => {
                debug!(path = %self.path.display(), error = %err, "Stat by path failed");
                return;
            }
        };
        if current.identity == self.identity {
            return;
        }

        // Whatever the writer appended before the rename still belongs to us.
        self.read_available(out);
        if !self.pending.is_empty() {
            debug!(
                path = %self.path.display(),
                bytes = self.pending.len(),
                "Dropping unterminated fragment from rotated file"
            );
        }

        let mut file = match fs.open(&self.path) {
            Ok(file) => file,
            Err(err) => {
                // Identity still differs, so the next wake retries.
                out.errors.push(WatchError::file_access(&self.path, &err));
                return;
            }
        };
        let identity = match file.stat() {
            Ok(stat) => stat.identity,
            Err(_) => current.identity,
        };
        if let Err(err) = file.seek_to(0) {
            out.errors.push(WatchError::read(&self.path, &err));
            self.counters.read_errors += 1;
            return;
        }

        self.close_handle();
        self.file = Some(file);
        self.identity = identity;
        self.offset = 0;
        self.pending.clear();
        self.skipping = false;
        self.line_number = 0;
        self.counters.rotations += 1;
        out.rotated = true;
        debug!(path = %self.path.display(), "Log rotation detected; reopened from start");
    }

    fn check_truncation(&mut self, out: &mut PollOutcome) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let size = match file.stat() {
            Ok(stat) => stat.size,
            Err(err) => {
                self.counters.read_errors += 1;
                out.errors.push(WatchError::read(&self.path, &err));
                return;
            }
        };
        if size >= self.offset {
            return;
        }

        if let Err(err) = file.seek_to(0) {
            self.counters.read_errors += 1;
            out.errors.push(WatchError::read(&self.path, &err));
            return;
        }
        debug!(
            path = %self.path.display(),
            old_offset = self.offset,
            size,
            "Log truncation detected; reading from start"
        );
        self.offset = 0;
        self.pending.clear();
        self.skipping = false;
        self.counters.truncations += 1;
        out.truncated = true;
    }

    fn read_available(&mut self, out: &mut PollOutcome) {
        let hint = self
            .file
            .as_ref()
            .and_then(|f| f.stat().ok())
            .map_or(0, |s| s.size.saturating_sub(self.offset));
        let chunk = usize::try_from(hint)
            .unwrap_or(usize::MAX)
            .clamp(MIN_READ_CHUNK, self.max_read_bytes.max(MIN_READ_CHUNK))
            .min(self.max_read_bytes);
        let mut buf = vec![0u8; chunk];

        loop {
            let Some(file) = self.file.as_mut() else {
                return;
            };
            let n = match file.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.counters.read_errors += 1;
                    warn!(path = %self.path.display(), error = %err, "Log read failed");
                    out.errors.push(WatchError::read(&self.path, &err));
                    return;
                }
            };
            self.offset += n as u64;
            self.counters.bytes_read += n as u64;
            self.ingest(&buf[..n], &mut out.lines);
        }
    }

    fn ingest(&mut self, chunk: &[u8], lines: &mut Vec<TailLine>) {
        let mut start = 0;
        for newline in memchr::memchr_iter(b'\n', chunk) {
            let piece = &chunk[start..newline];
            start = newline + 1;
            if self.skipping {
                self.skipping = false;
                continue;
            }
            if self.pending.is_empty() {
                self.emit(piece, lines);
            } else {
                let mut joined = std::mem::take(&mut self.pending);
                joined.extend_from_slice(piece);
                self.emit(&joined, lines);
            }
        }

        let rest = &chunk[start..];
        if self.skipping || rest.is_empty() {
            return;
        }
        self.pending.extend_from_slice(rest);
        if self.pending.len() > MAX_PENDING_FRAGMENT {
            warn!(
                path = %self.path.display(),
                bytes = self.pending.len(),
                "Discarding oversized line without terminator"
            );
            self.pending.clear();
            self.skipping = true;
            self.counters.fragments_discarded += 1;
        }
    }

    fn emit(&mut self, raw: &[u8], lines: &mut Vec<TailLine>) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let mut text = String::with_capacity(raw.len());
        for chunk in raw.utf8_chunks() {
            text.push_str(chunk.valid());
        }
        self.line_number += 1;
        self.counters.lines_emitted += 1;
        trace!(path = %self.path.display(), line_number = self.line_number, line = %text, "Line read");
        lines.push(TailLine {
            number: self.line_number,
            text,
        });
    }
}
