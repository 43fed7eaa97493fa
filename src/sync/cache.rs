//! Durable local cache of the replicated document.
//!
//! The cache holds the last full document state of a session so a replica
//! can start from it offline and only fetch what changed since. Writes go
//! through `CacheWriter`, a background thread that coalesces snapshots and
//! logs failures without ever reporting them back.
//!
//! # File format
//!
//! ```text
//! topomap-cache 1 <blake3 hex of payload>\n
//! {"key": "map/<session>", "entries": {...}}
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::doc::Update;
use crate::{debug, log};

const MAGIC: &str = "topomap-cache";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt cache file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("cannot encode cache: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Contract of the per-session durable store.
pub trait DurableCache: Send {
    /// Last stored state, or `None` if nothing was stored yet.
    fn load(&self) -> Result<Option<Update>, CacheError>;

    /// Replace the stored state.
    fn store(&mut self, state: &Update) -> Result<(), CacheError>;
}

/// Cache namespace of a session.
pub fn session_key(session: &str) -> String {
    format!("map/{session}")
}

// =============================================================================
// File Cache
// =============================================================================

#[derive(Serialize)]
struct PayloadRef<'a> {
    key: &'a str,
    entries: &'a Update,
}

#[derive(Deserialize)]
struct Payload {
    key: String,
    entries: Update,
}

/// One JSON file per namespace inside `dir`.
#[derive(Debug, Clone)]
pub struct FileCache {
    key: String,
    path: PathBuf,
}

impl FileCache {
    pub fn open(dir: &Path, key: impl Into<String>) -> Result<Self, CacheError> {
        fs::create_dir_all(dir)?;
        let key = key.into();
        let name = blake3::hash(key.as_bytes()).to_hex();
        let path = dir.join(format!("{}.json", &name[..32]));
        Ok(Self { key, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt(&self, reason: impl Into<String>) -> CacheError {
        CacheError::Corrupt {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }
}

impl DurableCache for FileCache {
    fn load(&self) -> Result<Option<Update>, CacheError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let split = bytes
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| self.corrupt("missing header"))?;
        let (header, payload) = (&bytes[..split], &bytes[split + 1..]);
        let header = std::str::from_utf8(header).map_err(|_| self.corrupt("header is not utf-8"))?;

        let mut parts = header.split(' ');
        let (Some(MAGIC), Some(version), Some(checksum), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(self.corrupt("malformed header"));
        };
        if version != FORMAT_VERSION.to_string() {
            return Err(self.corrupt(format!("unsupported version {version}")));
        }
        if blake3::hash(payload).to_hex().as_str() != checksum {
            return Err(self.corrupt("checksum mismatch"));
        }

        let payload: Payload =
            serde_json::from_slice(payload).map_err(|e| self.corrupt(e.to_string()))?;
        if payload.key != self.key {
            return Err(self.corrupt(format!("belongs to `{}`", payload.key)));
        }
        Ok(Some(payload.entries))
    }

    fn store(&mut self, state: &Update) -> Result<(), CacheError> {
        let payload = serde_json::to_vec(&PayloadRef {
            key: &self.key,
            entries: state,
        })?;
        let checksum = blake3::hash(&payload).to_hex();

        let mut bytes = format!("{MAGIC} {FORMAT_VERSION} {checksum}\n").into_bytes();
        bytes.extend_from_slice(&payload);

        // Write then rename, so a crash never leaves a half-written file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// =============================================================================
// Memory Cache
// =============================================================================

/// In-memory cache. Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    state: Arc<Mutex<Option<Update>>>,
    failing: Arc<Mutex<bool>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `store` fail.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn snapshot(&self) -> Option<Update> {
        self.state.lock().clone()
    }
}

impl DurableCache for MemoryCache {
    fn load(&self) -> Result<Option<Update>, CacheError> {
        Ok(self.state.lock().clone())
    }

    fn store(&mut self, state: &Update) -> Result<(), CacheError> {
        if *self.failing.lock() {
            return Err(io::Error::other("disk full").into());
        }
        *self.state.lock() = Some(state.clone());
        Ok(())
    }
}

// =============================================================================
// Background Writer
// =============================================================================

enum WriterMsg {
    Store(Update),
    Flush(Sender<()>),
}

/// Writes snapshots on a dedicated thread.
///
/// Only the newest pending snapshot is written; older ones queued behind it
/// are skipped.
pub struct CacheWriter {
    tx: Option<Sender<WriterMsg>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CacheWriter {
    pub fn spawn(mut cache: Box<dyn DurableCache>) -> Self {
        let (tx, rx) = channel::unbounded::<WriterMsg>();
        let handle = thread::spawn(move || {
            while let Ok(msg) = rx.recv() {
                let mut latest = None;
                let mut flushed = Vec::new();
                for msg in std::iter::once(msg).chain(rx.try_iter()) {
                    match msg {
                        WriterMsg::Store(state) => latest = Some(state),
                        WriterMsg::Flush(done) => flushed.push(done),
                    }
                }
                if let Some(state) = latest {
                    match cache.store(&state) {
                        Ok(()) => debug!("cache"; "stored {} entries", state.len()),
                        Err(e) => log!("cache"; "write failed: {}", e),
                    }
                }
                for done in flushed {
                    let _ = done.send(());
                }
            }
        });
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Queue a full snapshot. Never blocks on disk.
    pub fn write(&self, state: Update) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(WriterMsg::Store(state));
        }
    }

    /// Wait until everything queued so far is written.
    pub fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (done, wait) = channel::bounded(1);
        if tx.send(WriterMsg::Flush(done)).is_ok() {
            let _ = wait.recv();
        }
    }

    /// Write what is pending and stop the thread.
    pub fn close(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::doc::{LwwDoc, ReplicatedDoc};
    use serde_json::json;
    use tempfile::TempDir;

    fn sample() -> Update {
        let mut doc = LwwDoc::new(1);
        doc.apply_local(vec![
            ("features/a".into(), Some(json!({"type": "group", "at": "root.V"}))),
            ("layers".into(), Some(json!([]))),
        ]);
        doc.apply_local(vec![("features/a".into(), None)]);
        doc.encode_state()
    }

    #[test]
    fn test_file_cache_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut cache = FileCache::open(dir.path(), session_key("s1")).unwrap();
        assert!(cache.load().unwrap().is_none());

        let state = sample();
        cache.store(&state).unwrap();
        assert_eq!(cache.load().unwrap(), Some(state));
    }

    #[test]
    fn test_sessions_do_not_share_files() {
        let dir = TempDir::new().unwrap();
        let mut s1 = FileCache::open(dir.path(), session_key("s1")).unwrap();
        let s2 = FileCache::open(dir.path(), session_key("s2")).unwrap();
        s1.store(&sample()).unwrap();
        assert_ne!(s1.path(), s2.path());
        assert!(s2.load().unwrap().is_none());
    }

    #[test]
    fn test_tampered_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let mut cache = FileCache::open(dir.path(), session_key("s1")).unwrap();
        cache.store(&sample()).unwrap();

        let mut bytes = fs::read(cache.path()).unwrap();
        let last = bytes.len() - 2;
        bytes[last] = b' ';
        fs::write(cache.path(), bytes).unwrap();

        assert!(matches!(cache.load(), Err(CacheError::Corrupt { .. })));
    }

    #[test]
    fn test_writer_keeps_latest_snapshot() {
        let cache = MemoryCache::new();
        let writer = CacheWriter::spawn(Box::new(cache.clone()));
        writer.write(Update::new());
        writer.write(sample());
        writer.flush();
        assert_eq!(cache.snapshot(), Some(sample()));
    }

    #[test]
    fn test_writer_survives_failures() {
        let cache = MemoryCache::new();
        cache.set_failing(true);
        let mut writer = CacheWriter::spawn(Box::new(cache.clone()));
        writer.write(sample());
        writer.flush();
        assert!(cache.snapshot().is_none());

        cache.set_failing(false);
        writer.write(sample());
        writer.close();
        assert_eq!(cache.snapshot(), Some(sample()));
    }
}
