//! Append-only JSON trace persistence.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

use crate::errors::IoError;

/// Append-only JSON array writer for persisted traces.
///
/// Supports two emission modes against the same base path: a single growing "aggregate" file
/// (`save_traces(_, false)`), and indexed rotation where each flush opens a brand new
/// `<path>.<n>` file (`save_traces(_, true)`). The two modes don't interfere with each other;
/// indexed flushes each produce an independent, already-closed JSON array.
#[non_exhaustive]
pub struct TraceFile {
    /// Base path traces are persisted under.
    path: PathBuf,
    /// Monotonic index handed out to the next indexed flush.
    next_index: AtomicU64,
    /// Open aggregate file, once the first aggregate write has occurred.
    aggregate: Mutex<Option<fs::File>>,
}

impl TraceFile {
    /// Prepare a trace file rooted at `path`. No file is opened until the first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            next_index: AtomicU64::new(0),
            aggregate: Mutex::new(None),
        }
    }

    /// Base path this trace file was constructed with.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `stream`, the already-serialized concatenation of this flush's trace fragments.
    ///
    /// Best-effort: I/O failures are logged and swallowed, never returned to the caller, so
    /// persistence can never disturb the request path. A partial file on crash is acceptable.
    pub fn save_traces(&self, stream: &str, to_index_file: bool) {
        if to_index_file {
            self.save_indexed(stream);
        } else {
            self.save_aggregate(stream);
        }
    }

    fn indexed_path(&self, index: u64) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    fn save_indexed(&self, stream: &str) {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let path = self.indexed_path(index);
        if let Err(err) = Self::write_closed_file(&path, stream) {
            let err = IoError::from(err);
            tracing::warn!(path = %path.display(), %err, "failed to write indexed trace file");
        }
    }

    fn save_aggregate(&self, stream: &str) {
        let mut guard = self.aggregate.lock();
        let result = match guard.as_mut() {
            Some(file) => file.write_all(b",").and_then(|()| file.write_all(stream.as_bytes())),
            None => Self::open_for_append(&self.path).and_then(|mut file| {
                file.write_all(b"[")?;
                file.write_all(stream.as_bytes())?;
                *guard = Some(file);
                Ok(())
            }),
        };
        if let Err(err) = result {
            let err = IoError::from(err);
            tracing::warn!(path = %self.path.display(), %err, "failed to write aggregate trace file");
        }
    }

    fn open_for_append(path: &Path) -> std::io::Result<fs::File> {
        fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
    }

    fn write_closed_file(path: &Path, stream: &str) -> std::io::Result<()> {
        let mut file = Self::open_for_append(path)?;
        file.write_all(b"[")?;
        file.write_all(stream.as_bytes())?;
        file.write_all(b"]")
    }
}

impl Drop for TraceFile {
    fn drop(&mut self) {
        let mut guard = self.aggregate.lock();
        if let Some(mut file) = guard.take() {
            if let Err(err) = file.write_all(b"]") {
                let err = IoError::from(err);
                tracing::warn!(path = %self.path.display(), %err, "failed to close aggregate trace file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        sync::atomic::{AtomicU64, Ordering},
    };

    use super::*;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn scratch_path(label: &str) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "modeltrace-test-{label}-{}-{n}.json",
            std::process::id()
        ))
    }

    #[test]
    fn aggregate_mode_wraps_single_array() {
        let path = scratch_path("agg");
        let file = TraceFile::new(&path);
        file.save_traces("{\"a\":1}", false);
        file.save_traces("{\"a\":2}", false);
        drop(file);
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "[{\"a\":1},{\"a\":2}]");
        let _: serde_json::Value = serde_json::from_str(&contents).unwrap();
        fs::remove_file(&path).ok();
    }

    #[test]
    fn indexed_mode_produces_independent_files() {
        let path = scratch_path("idx");
        let file = TraceFile::new(&path);
        file.save_traces("{\"a\":1}", true);
        file.save_traces("{\"a\":2}", true);
        let path0 = PathBuf::from(format!("{}.0", path.display()));
        let path1 = PathBuf::from(format!("{}.1", path.display()));
        assert_eq!(fs::read_to_string(&path0).unwrap(), "[{\"a\":1}]");
        assert_eq!(fs::read_to_string(&path1).unwrap(), "[{\"a\":2}]");
        fs::remove_file(&path0).ok();
        fs::remove_file(&path1).ok();
    }
}
