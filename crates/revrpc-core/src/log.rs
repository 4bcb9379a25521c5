//! Frame-level transport log.
//!
//! Channels write one line per frame sent or received to a [`TransportLog`]
//! handed to them at construction. Application logging goes through
//! `tracing` as usual; this sink only records traffic.

use crate::codec::Frame;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Append-only line sink.
pub trait TransportLog: Send + Sync {
    fn write(&self, line: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLog;

impl TransportLog for NoopLog {
    fn write(&self, _line: &str) {}
}

/// Forwards lines to `tracing` at trace level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl TransportLog for TracingLog {
    fn write(&self, line: &str) {
        tracing::trace!(target: "revrpc::transport", "{line}");
    }
}

/// Appends lines to a file.
pub struct FileLog {
    file: Mutex<File>,
}

impl FileLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl TransportLog for FileLog {
    fn write(&self, line: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{line}");
        }
    }
}

/// Shared handle used by channels.
pub type SharedLog = Arc<dyn TransportLog>;

pub fn noop() -> SharedLog {
    Arc::new(NoopLog)
}

/// Tracing-backed log when `enabled`, otherwise a no-op.
pub fn from_flag(enabled: bool) -> SharedLog {
    if enabled {
        Arc::new(TracingLog)
    } else {
        noop()
    }
}

/// File-backed log appending to `path`.
pub fn to_file(path: &Path) -> std::io::Result<SharedLog> {
    Ok(Arc::new(FileLog::open(path)?))
}

/// One log line for a frame: direction, peer label, index, code, length.
pub(crate) fn frame_line(dir: &str, peer: &str, frame: &Frame) -> String {
    format!(
        "{dir} {peer} index={} code={:#010x} len={}",
        frame.index,
        frame.code,
        frame.data.len()
    )
}
