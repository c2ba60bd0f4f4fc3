//! Rotation-aware log following.
//!
//! A [`Tailer`] is a blocking iterator over the lines of one file. It reopens
//! the path from offset 0 when the file is replaced (new device/inode) or
//! truncated below the read offset, and holds back a trailing partial line
//! until its newline arrives.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, ErrorKind};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::TailConfig;
use crate::signal::ShutdownToken;

/// Device + inode of an open file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
}

impl FileIdentity {
    fn of(meta: &fs::Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }
}

/// Read position within the currently open file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailCursor {
    pub offset: u64,
    pub identity: FileIdentity,
}

#[derive(Debug, Clone, Copy)]
pub struct TailOptions {
    /// Sleep between end-of-file checks
    pub poll_interval: Duration,
    /// Pause after every returned line
    pub line_pause: Duration,
    /// Stop at the first end-of-file instead of following
    pub run_once: bool,
}

impl TailOptions {
    pub fn from_config(tail: &TailConfig, run_once: bool) -> Self {
        Self {
            poll_interval: Duration::from_millis(tail.poll_interval_ms),
            line_pause: Duration::from_micros(tail.line_pause_micros),
            run_once,
        }
    }
}

pub struct Tailer {
    path: PathBuf,
    reader: BufReader<File>,
    cursor: TailCursor,
    pending: Vec<u8>,
    options: TailOptions,
    token: ShutdownToken,
}

impl Tailer {
    /// Open `path` from the start. A missing file is an error; callers skip
    /// the source rather than wait for it.
    pub fn open<P: AsRef<Path>>(path: P, options: TailOptions, token: ShutdownToken) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (reader, identity) =
            Self::open_reader(&path).with_context(|| format!("Failed to open {}", path.display()))?;

        Ok(Self {
            path,
            reader,
            cursor: TailCursor {
                offset: 0,
                identity,
            },
            pending: Vec::new(),
            options,
            token,
        })
    }

    fn open_reader(path: &Path) -> std::io::Result<(BufReader<File>, FileIdentity)> {
        let file = File::open(path)?;
        let identity = FileIdentity::of(&file.metadata()?);
        Ok((BufReader::new(file), identity))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cursor(&self) -> TailCursor {
        self.cursor
    }

    /// The path now names a different file, or ours shrank below the offset.
    /// A vanished path is not a rotation yet; we wait for it to reappear.
    fn rotated(&self) -> bool {
        match fs::metadata(&self.path) {
            Ok(meta) => {
                FileIdentity::of(&meta) != self.cursor.identity || meta.len() < self.cursor.offset
            }
            Err(_) => false,
        }
    }

    fn reopen(&mut self) -> bool {
        match Self::open_reader(&self.path) {
            Ok((reader, identity)) => {
                info!("{} rotated, reading from the start", self.path.display());
                self.reader = reader;
                self.cursor = TailCursor {
                    offset: 0,
                    identity,
                };
                true
            }
            Err(e) => {
                debug!("Waiting for {} to reappear: {}", self.path.display(), e);
                false
            }
        }
    }

    fn take_pending(&mut self) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn idle(&self) {
        thread::sleep(self.options.poll_interval);
    }
}

impl Iterator for Tailer {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            if self.token.is_cancelled() {
                return None;
            }

            match self.reader.read_until(b'\n', &mut self.pending) {
                Ok(0) => {
                    if self.options.run_once {
                        if self.pending.is_empty() {
                            return None;
                        }
                        return Some(self.take_pending());
                    }

                    if self.rotated() {
                        // The old file is fully read; a partial tail of it
                        // will never be completed
                        let leftover = (!self.pending.is_empty()).then(|| self.take_pending());
                        if self.reopen() {
                            if let Some(line) = leftover {
                                return Some(line);
                            }
                            continue;
                        }
                        if let Some(line) = leftover {
                            return Some(line);
                        }
                    }
                    self.idle();
                }
                Ok(n) => {
                    self.cursor.offset += n as u64;
                    if self.pending.last() != Some(&b'\n') {
                        // Partial line; the next read returns 0 at EOF
                        continue;
                    }
                    let line = self.take_pending();
                    if !self.options.line_pause.is_zero() {
                        thread::sleep(self.options.line_pause);
                    }
                    return Some(line);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Read error on {}: {}", self.path.display(), e);
                    if self.options.run_once {
                        return None;
                    }
                    self.idle();
                }
            }
        }
    }
}
