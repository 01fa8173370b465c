//! Filesystem [`StateStore`]: one file per key under a directory.
//!
//! Each file starts with an 8-byte big-endian expiry (unix millis, 0 for
//! never) followed by the raw value. Writes go to a temporary file that is
//! renamed into place, so a crash leaves either the old or the new record.

use super::{StateStore, StoreError, StoreFuture};
use crate::time::{Clock, SystemClock};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

const HEADER_LEN: usize = 8;
const RECORD_EXT: &str = "rec";
const TMP_EXT: &str = "tmp";

#[derive(Clone)]
pub struct FsStateStore<C: Clock = SystemClock> {
    dir: PathBuf,
    clock: C,
}

impl FsStateStore<SystemClock> {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with_clock(dir, SystemClock).await
    }
}

impl<C: Clock> FsStateStore<C> {
    pub async fn open_with_clock(dir: impl Into<PathBuf>, clock: C) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir, clock })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{RECORD_EXT}", escape_key(key)))
    }

    async fn read_live(&self, key: &str, path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
        let mut bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if bytes.len() < HEADER_LEN {
            return Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("record shorter than header ({} bytes)", bytes.len()),
            });
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&bytes[..HEADER_LEN]);
        let expires_at_ms = u64::from_be_bytes(header);
        if expires_at_ms != 0 && self.clock.unix_millis() >= expires_at_ms {
            if let Err(err) = fs::remove_file(path).await {
                tracing::debug!(key, "expired record not removed: {err}");
            }
            return Ok(None);
        }
        Ok(Some(bytes.split_off(HEADER_LEN)))
    }
}

impl<C: Clock> StateStore for FsStateStore<C> {
    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>, ttl: Option<Duration>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let expires_at_ms = ttl
                .map(|ttl| {
                    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
                    self.clock.unix_millis().saturating_add(ttl_ms).max(1)
                })
                .unwrap_or(0);
            let mut record = Vec::with_capacity(HEADER_LEN + value.len());
            record.extend_from_slice(&expires_at_ms.to_be_bytes());
            record.extend_from_slice(&value);
            let path = self.path_for(key);
            let tmp = path.with_extension(TMP_EXT);
            fs::write(&tmp, &record).await?;
            fs::rename(&tmp, &path).await?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move { self.read_live(key, &self.path_for(key)).await })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            match fs::remove_file(self.path_for(key)).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            }
        })
    }

    fn scan_prefix<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut keys = Vec::new();
            let mut dir = fs::read_dir(&self.dir).await?;
            while let Some(entry) = dir.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXT) {
                    continue;
                }
                let Some(key) = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(unescape_key)
                else {
                    tracing::debug!(path = %path.display(), "skipping unrecognised store file");
                    continue;
                };
                if !key.starts_with(prefix) {
                    continue;
                }
                match self.read_live(&key, &path).await {
                    Ok(Some(_)) => keys.push(key),
                    Ok(None) => {}
                    Err(err) => tracing::warn!(key = %key, "skipping unreadable store record: {err}"),
                }
            }
            keys.sort();
            Ok(keys)
        })
    }
}

/// Keys carry user-chosen group/node/device ids; anything outside
/// `[A-Za-z0-9_-]` is percent-encoded so every key is one flat file name.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn unescape_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    #[test]
    fn escaping_is_reversible() {
        for key in [
            "state:nodes:G1:N1",
            "state:devices:Plant 1:Line/2:Pump.3",
            "state:sessions:client%42",
        ] {
            let escaped = escape_key(key);
            assert!(!escaped.contains(':') && !escaped.contains('/') && !escaped.contains('.'));
            assert_eq!(unescape_key(&escaped).as_deref(), Some(key));
        }
        assert_eq!(unescape_key("bad%4"), None);
    }

    #[tokio::test]
    async fn put_get_delete_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStateStore::open(dir.path()).await.unwrap();
        store
            .put("state:births:NBIRTH:G1:N1", b"birth".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(
            store.get("state:births:NBIRTH:G1:N1").await.unwrap(),
            Some(b"birth".to_vec())
        );

        let reopened = FsStateStore::open(dir.path()).await.unwrap();
        assert_eq!(
            reopened.scan_prefix("state:births:").await.unwrap(),
            vec!["state:births:NBIRTH:G1:N1".to_string()]
        );
        reopened.delete("state:births:NBIRTH:G1:N1").await.unwrap();
        reopened.delete("state:births:NBIRTH:G1:N1").await.unwrap();
        assert_eq!(reopened.get("state:births:NBIRTH:G1:N1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_records_read_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_at(1_000_000);
        let store = FsStateStore::open_with_clock(dir.path(), clock.clone())
            .await
            .unwrap();
        store
            .put("state:sessions:C1", b"s".to_vec(), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(59));
        assert!(store.get("state:sessions:C1").await.unwrap().is_some());
        clock.advance(Duration::from_secs(1));
        assert!(store.get("state:sessions:C1").await.unwrap().is_none());
        assert!(store.scan_prefix("state:sessions:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scan_skips_a_truncated_record_next_to_good_ones() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStateStore::open(dir.path()).await.unwrap();
        store
            .put("state:nodes:G1:N1", b"{}".to_vec(), None)
            .await
            .unwrap();
        std::fs::write(store.path_for("state:nodes:G1:broken"), b"abc").unwrap();
        assert_eq!(
            store.scan_prefix("state:nodes:").await.unwrap(),
            vec!["state:nodes:G1:N1".to_string()]
        );
    }

    #[tokio::test]
    async fn truncated_record_is_reported_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStateStore::open(dir.path()).await.unwrap();
        std::fs::write(store.path_for("state:nodes:G1:N1"), b"abc").unwrap();
        assert!(matches!(
            store.get("state:nodes:G1:N1").await,
            Err(StoreError::Corrupt { .. })
        ));
    }
}
