//! Presence-marker bus lock
//!
//! Each contender drops a marker file named
//! `<prefix>.<unix-nanos>.<pid>.<seq>.wants-it` into a shared scratch
//! directory and holds the bus while its marker is the oldest one present.
//!
//! This is NOT a correctness guarantee. Two processes can create their
//! markers, list the directory and decide concurrently, and clock steps
//! reorder markers. It only makes collisions unlikely on a lightly loaded
//! bus; prefer the semaphore backend where it is available.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::LockBackend;
use crate::error::BusLockError;

const MARKER_SUFFIX: &str = "wants-it";

// Unique per process, so markers never compare equal
static MARKER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Default scratch directory: tmpfs when present
pub fn default_marker_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Sort key of a marker: creation time, then pid, then sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct MarkerKey {
    nanos: u128,
    pid: u32,
    seq: u64,
}

fn parse_marker(prefix: &str, file_name: &str) -> Option<MarkerKey> {
    let rest = file_name.strip_prefix(prefix)?.strip_prefix('.')?;
    let rest = rest.strip_suffix(MARKER_SUFFIX)?.strip_suffix('.')?;
    let mut parts = rest.split('.');
    let key = MarkerKey {
        nanos: parts.next()?.parse().ok()?,
        pid: parts.next()?.parse().ok()?,
        seq: parts.next()?.parse().ok()?,
    };
    parts.next().is_none().then_some(key)
}

#[derive(Debug)]
struct OwnMarker {
    path: PathBuf,
    key: MarkerKey,
}

/// Marker-file backend
#[derive(Debug)]
pub struct MarkerBackend {
    dir: PathBuf,
    prefix: String,
    own: Mutex<Option<OwnMarker>>,
}

impl MarkerBackend {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self, BusLockError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            prefix: prefix.into(),
            own: Mutex::new(None),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every marker sharing our prefix, with its sort key
    fn markers(&self) -> Result<Vec<(PathBuf, MarkerKey)>, BusLockError> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(key) = name.to_str().and_then(|n| parse_marker(&self.prefix, n)) {
                found.push((entry.path(), key));
            }
        }
        Ok(found)
    }

    fn create_marker(&self, identity: &str) -> Result<OwnMarker, BusLockError> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let key = MarkerKey {
            nanos,
            pid: std::process::id(),
            seq: MARKER_SEQ.fetch_add(1, Ordering::Relaxed),
        };
        let path = self.dir.join(format!(
            "{}.{:020}.{}.{}.{}",
            self.prefix, key.nanos, key.pid, key.seq, MARKER_SUFFIX
        ));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        writeln!(file, "{}", identity)?;
        debug!("Created bus marker {}", path.display());
        Ok(OwnMarker { path, key })
    }

    fn remove_own(&self) -> Result<(), BusLockError> {
        if let Some(own) = self.own.lock().take() {
            match fs::remove_file(&own.path) {
                Ok(()) => {},
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!("Bus marker {} was removed by another process", own.path.display());
                },
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl LockBackend for MarkerBackend {
    fn name(&self) -> &str {
        &self.prefix
    }

    fn try_acquire(&self, identity: &str) -> Result<bool, BusLockError> {
        let mut own = self.own.lock();
        let own_key = match own.as_ref() {
            Some(marker) if marker.path.exists() => marker.key,
            _ => {
                let marker = self.create_marker(identity)?;
                let key = marker.key;
                *own = Some(marker);
                key
            },
        };
        drop(own);

        let older = self
            .markers()?
            .iter()
            .filter(|(_, key)| *key < own_key)
            .count();
        if older > 0 {
            debug!("{} older bus marker(s) ahead of {}", older, identity);
        }
        Ok(older == 0)
    }

    fn release(&self, _identity: &str) -> Result<(), BusLockError> {
        self.remove_own()
    }

    fn recover(&self, _identity: &str) -> Result<(), BusLockError> {
        let own_path = self.own.lock().as_ref().map(|m| m.path.clone());
        for (path, _) in self.markers()? {
            if Some(&path) == own_path.as_ref() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => warn!("Removed stale bus marker {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn abandon(&self, _identity: &str) -> Result<(), BusLockError> {
        self.remove_own()
    }
}

impl Drop for MarkerBackend {
    fn drop(&mut self) {
        if let Err(e) = self.remove_own() {
            warn!("Failed to remove bus marker for '{}': {}", self.prefix, e);
        }
    }
}
