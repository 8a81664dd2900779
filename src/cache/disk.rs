//! Persistent, filesystem-backed byte cache.
//!
//! Every key is stored as one flat file under the cache root, named by the
//! SHA-256 address token of the key:
//!
//! ```text
//! {root}/{64 hex chars}
//! ```
//!
//! Each file starts with a fixed 12-byte header (`VPC1` magic followed by
//! the big-endian creation time in epoch milliseconds) and then the raw
//! payload.  Expiry is computed from that header, never from filesystem
//! timestamps.
//!
//! Writes go to a uniquely named temporary file in the same directory and
//! are then renamed over the entry, so readers only ever see a complete old
//! value or a complete new one.
//!
//! Expired and corrupt entries are deleted only if the file still carries
//! the header they were judged on.  A `set` that renames a fresh file into
//! place between that re-check and the unlink can still lose its entry;
//! the cost is one extra miss, never a torn value.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::clock::{self, Clock};
use super::key::{self, TOKEN_LEN};
use super::{BackendKind, CacheBackend, CacheError};

const MAGIC: &[u8; 4] = b"VPC1";
const HEADER_LEN: usize = 12;
const TMP_SUFFIX: &str = ".tmp";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// DiskCache
// ---------------------------------------------------------------------------

pub struct DiskCache {
    root: PathBuf,
    ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>, ttl: Option<Duration>) -> Self {
        Self::with_clock(root, ttl, clock::system())
    }

    pub fn with_clock(
        root: impl Into<PathBuf>,
        ttl: Option<Duration>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            root: root.into(),
            ttl,
            clock,
        }
    }

    /// On-disk location of the entry for `key`.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(key::hash_key(key))
    }

    /// Delete `path`, returning `true` if this call removed it.
    async fn remove(&self, path: &Path) -> bool {
        match tokio::fs::remove_file(path).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove cache file");
                false
            }
        }
    }

    /// Delete the entry at `path` if its header is still `seen`.  A
    /// concurrent `set` may have replaced the file since it was judged
    /// stale; the replacement is kept.
    async fn remove_entry(&self, path: &Path, seen: Option<i64>) -> bool {
        match read_header(path).await {
            Ok(current) if current == seen => self.remove(path).await,
            Ok(_) => {
                debug!(path = %path.display(), "cache entry replaced concurrently; keeping it");
                false
            }
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to re-read cache header");
                false
            }
        }
    }

    /// Decide whether a directory entry should be swept.  `None` means keep
    /// it: it is live, not ours, or vanished while we looked at it.
    async fn stale(&self, path: &Path, name: &str, now: i64) -> Option<Stale> {
        if key::is_token(name) {
            return match read_header(path).await {
                Ok(Some(created_at)) if clock::is_expired(created_at, now, self.ttl) => {
                    Some(Stale::Entry(Some(created_at)))
                }
                Ok(Some(_)) => None,
                Ok(None) => Some(Stale::Entry(None)),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read cache header");
                    None
                }
            };
        }

        if is_temp_name(name) {
            // Leftovers of interrupted writes: age them by modification time.
            let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
            let modified = chrono::DateTime::<chrono::Utc>::from(modified).timestamp_millis();
            return clock::is_expired(modified, now, self.ttl).then_some(Stale::Temp);
        }

        None
    }
}

/// A directory entry the sweeper should delete.
enum Stale {
    /// Expired or corrupt entry, with the header it was judged on.
    Entry(Option<i64>),
    /// Leftover of an interrupted write.
    Temp,
}

#[async_trait]
impl CacheBackend<Bytes> for DiskCache {
    async fn get(&self, key: &str) -> Option<Bytes> {
        let path = self.entry_path(key);

        match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                debug!(key, path = %path.display(), "cache path is not a regular file");
                return None;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(key, path = %path.display(), error = %e, "cache stat failed; treating as miss");
                return None;
            }
        }

        // The file can disappear between stat and read (sweeper, another
        // reader expiring it); that is an ordinary miss.
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(key, path = %path.display(), error = %e, "cache read failed; treating as miss");
                return None;
            }
        };

        let Some(created_at) = decode_header(&raw) else {
            warn!(key, path = %path.display(), "corrupt cache file; discarding");
            self.remove_entry(&path, None).await;
            return None;
        };

        if clock::is_expired(created_at, self.clock.now_millis(), self.ttl) {
            debug!(key, path = %path.display(), "cache entry expired");
            self.remove_entry(&path, Some(created_at)).await;
            return None;
        }

        Some(Bytes::from(raw).slice(HEADER_LEN..))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CacheError::write(&self.root, e))?;

        let token = key::hash_key(key);
        let path = self.root.join(&token);
        let tmp_path = self.root.join(format!(
            "{token}.{}.{}{TMP_SUFFIX}",
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        let header = encode_header(self.clock.now_millis());
        if let Err(e) = write_file(&tmp_path, &header, &value).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(CacheError::write(&tmp_path, e));
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(CacheError::write(&path, e));
        }

        debug!(key, path = %path.display(), bytes = value.len(), "cache entry written");
        Ok(())
    }

    async fn clean(&self) -> usize {
        if self.ttl.is_none() {
            return 0;
        }

        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "failed to list cache directory");
                return 0;
            }
        };

        let now = self.clock.now_millis();
        let mut removed = 0;

        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(root = %self.root.display(), error = %e, "cache directory scan aborted");
                    break;
                }
            };

            match entry.file_type().await {
                Ok(ft) if ft.is_file() => {}
                _ => continue,
            }

            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();

            let gone = match self.stale(&path, &name, now).await {
                Some(Stale::Entry(seen)) => self.remove_entry(&path, seen).await,
                Some(Stale::Temp) => self.remove(&path).await,
                None => false,
            };
            if gone {
                removed += 1;
            }
        }

        debug!(root = %self.root.display(), removed, "disk cache sweep finished");
        removed
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Disk
    }
}

// ---------------------------------------------------------------------------
// File format helpers
// ---------------------------------------------------------------------------

fn encode_header(created_at: i64) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(MAGIC);
    header[4..].copy_from_slice(&created_at.to_be_bytes());
    header
}

fn decode_header(buf: &[u8]) -> Option<i64> {
    let header = buf.get(..HEADER_LEN)?;
    if &header[..4] != MAGIC {
        return None;
    }
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&header[4..]);
    Some(i64::from_be_bytes(ts))
}

/// Read only the header of a cache file.  `Ok(None)` means the file is too
/// short or not in our format.
async fn read_header(path: &Path) -> std::io::Result<Option<i64>> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut header = [0u8; HEADER_LEN];
    match file.read_exact(&mut header).await {
        Ok(_) => Ok(decode_header(&header)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

async fn write_file(path: &Path, header: &[u8], payload: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(header).await?;
    file.write_all(payload).await?;
    file.flush().await?;
    Ok(())
}

fn is_temp_name(name: &str) -> bool {
    name.ends_with(TMP_SUFFIX) && name.get(..TOKEN_LEN).is_some_and(key::is_token)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;

    const T: Duration = Duration::from_secs(60);

    fn cache_at(root: &Path, ttl: Option<Duration>) -> (DiskCache, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        (DiskCache::with_clock(root, ttl, Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, _) = cache_at(tmp.path(), Some(T));
        let payload = Bytes::from_static(&[0, 1, 2, 255, b'\n', 0]);

        cache.set("k", payload.clone()).await.unwrap();
        assert_eq!(cache.get("k").await, Some(payload));
    }

    #[tokio::test]
    async fn empty_payload_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, _) = cache_at(tmp.path(), None);
        cache.set("k", Bytes::new()).await.unwrap();
        assert_eq!(cache.get("k").await, Some(Bytes::new()));
    }

    #[tokio::test]
    async fn missing_key_is_a_miss() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, _) = cache_at(&tmp.path().join("never-created"), None);
        assert!(cache.get("absent").await.is_none());
    }

    #[tokio::test]
    async fn set_creates_root_recursively() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("a").join("b").join("c");
        let (cache, _) = cache_at(&root, None);

        cache.set("k", Bytes::from_static(b"v")).await.unwrap();
        assert!(root.is_dir());
        assert!(cache.entry_path("k").is_file());
    }

    #[tokio::test]
    async fn file_layout_is_header_then_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, clock) = cache_at(tmp.path(), None);
        cache.set("k", Bytes::from_static(b"payload")).await.unwrap();

        let path = cache.entry_path("k");
        assert_eq!(path.file_name().unwrap().to_string_lossy(), key::hash_key("k"));

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[..4], MAGIC);
        assert_eq!(decode_header(&raw), Some(clock.now_millis()));
        assert_eq!(&raw[HEADER_LEN..], b"payload");
    }

    #[tokio::test]
    async fn set_overwrites_previous_value() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, _) = cache_at(tmp.path(), None);
        cache
            .set("k", Bytes::from_static(b"a much longer old value"))
            .await
            .unwrap();
        cache.set("k", Bytes::from_static(b"new")).await.unwrap();

        assert_eq!(cache.get("k").await, Some(Bytes::from_static(b"new")));
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1, "temporary files must not be left behind");
    }

    #[tokio::test]
    async fn distinct_keys_do_not_interfere() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, _) = cache_at(tmp.path(), None);
        cache.set("/r?page=1", Bytes::from_static(b"one")).await.unwrap();
        cache.set("/r?page=2", Bytes::from_static(b"two")).await.unwrap();

        assert_ne!(cache.entry_path("/r?page=1"), cache.entry_path("/r?page=2"));
        assert_eq!(cache.get("/r?page=1").await, Some(Bytes::from_static(b"one")));
        assert_eq!(cache.get("/r?page=2").await, Some(Bytes::from_static(b"two")));
    }

    #[tokio::test]
    async fn entry_expires_after_ttl_and_file_is_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, clock) = cache_at(tmp.path(), Some(T));
        cache.set("k", Bytes::from_static(b"v")).await.unwrap();

        clock.advance(T - Duration::from_millis(1));
        assert!(cache.get("k").await.is_some());

        clock.advance(Duration::from_millis(2));
        assert!(cache.get("k").await.is_none());
        assert!(!cache.entry_path("k").exists());
    }

    #[tokio::test]
    async fn replaced_entry_survives_stale_removal() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, clock) = cache_at(tmp.path(), Some(T));
        cache.set("k", Bytes::from_static(b"old")).await.unwrap();
        let path = cache.entry_path("k");
        let judged = read_header(&path).await.unwrap();

        // A writer replaces the entry after it was judged expired.
        clock.advance(T * 2);
        cache.set("k", Bytes::from_static(b"new")).await.unwrap();

        assert!(!cache.remove_entry(&path, judged).await);
        assert_eq!(cache.get("k").await, Some(Bytes::from_static(b"new")));

        let current = read_header(&path).await.unwrap();
        assert!(cache.remove_entry(&path, current).await);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn wall_clock_expiry_scenario() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(tmp.path(), Some(Duration::from_millis(1000)));

        cache.set("a", Bytes::from_static(&[1, 2, 3])).await.unwrap();
        assert_eq!(cache.get("a").await, Some(Bytes::from_static(&[1, 2, 3])));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(cache.get("a").await.is_none());
        assert!(!cache.entry_path("a").exists());
    }

    #[tokio::test]
    async fn externally_removed_file_is_a_miss() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, _) = cache_at(tmp.path(), None);
        cache.set("k", Bytes::from_static(b"v")).await.unwrap();
        std::fs::remove_file(cache.entry_path("k")).unwrap();
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn directory_at_entry_path_is_a_miss() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, _) = cache_at(tmp.path(), None);
        std::fs::create_dir_all(cache.entry_path("k")).unwrap();
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_miss_and_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, _) = cache_at(tmp.path(), None);
        let path = cache.entry_path("k");
        std::fs::write(&path, b"raw bytes without a header").unwrap();

        assert!(cache.get("k").await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn set_into_unwritable_root_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("file-not-dir");
        std::fs::write(&root, b"x").unwrap();
        let (cache, _) = cache_at(&root, None);

        let err = cache.set("k", Bytes::from_static(b"v")).await.unwrap_err();
        assert!(matches!(err, CacheError::Write { .. }));
    }

    #[tokio::test]
    async fn clean_removes_only_expired_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, clock) = cache_at(tmp.path(), Some(T));
        let t = clock.now_millis();
        let ttl_ms = clock::duration_millis(T);

        clock.set(t - 2 * ttl_ms);
        cache.set("old", Bytes::from_static(b"1")).await.unwrap();
        clock.set(t - ttl_ms / 2);
        cache.set("middle", Bytes::from_static(b"2")).await.unwrap();
        clock.set(t);
        cache.set("new", Bytes::from_static(b"3")).await.unwrap();

        assert_eq!(cache.clean().await, 1);
        assert!(!cache.entry_path("old").exists());
        assert!(cache.entry_path("middle").exists());
        assert!(cache.entry_path("new").exists());
    }

    #[tokio::test]
    async fn clean_without_ttl_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, clock) = cache_at(tmp.path(), None);
        cache.set("k", Bytes::from_static(b"v")).await.unwrap();
        clock.advance(Duration::from_secs(365 * 24 * 3600));

        assert_eq!(cache.clean().await, 0);
        assert!(cache.entry_path("k").exists());
    }

    #[tokio::test]
    async fn clean_leaves_foreign_files_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, clock) = cache_at(tmp.path(), Some(T));
        std::fs::write(tmp.path().join("README"), b"not a cache entry").unwrap();
        std::fs::create_dir(tmp.path().join(key::hash_key("dir"))).unwrap();
        clock.advance(T * 10);

        assert_eq!(cache.clean().await, 0);
        assert!(tmp.path().join("README").exists());
    }

    #[tokio::test]
    async fn clean_on_missing_root_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let (cache, _) = cache_at(&tmp.path().join("missing"), Some(T));
        assert_eq!(cache.clean().await, 0);
    }

    #[tokio::test]
    async fn clean_removes_stale_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        // Temp files are aged by mtime, so drive this cache with the wall clock.
        let clock = ManualClock::new(chrono::Utc::now().timestamp_millis());
        let cache = DiskCache::with_clock(tmp.path(), Some(T), Arc::new(clock.clone()));
        let stale = tmp.path().join(format!("{}.1.0{TMP_SUFFIX}", key::hash_key("k")));
        std::fs::write(&stale, b"partial").unwrap();

        assert_eq!(cache.clean().await, 0);
        clock.advance(T * 2);
        assert_eq!(cache.clean().await, 1);
        assert!(!stale.exists());
    }

    #[test]
    fn header_round_trip_and_rejects_garbage() {
        let header = encode_header(-42);
        assert_eq!(decode_header(&header), Some(-42));
        assert_eq!(decode_header(b"VPC1"), None);
        assert_eq!(decode_header(b"XXXX00000000"), None);
    }
}
