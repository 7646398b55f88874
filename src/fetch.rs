// 📥 Extractor - fetch a raw extract from a keyed blob store
// Only the collaborator contract lives here; LocalDirFetcher treats a
// directory tree as the blob store (<root>/<bucket>/<key>).

use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::FetchError;

/// "fetch bytes by key" collaborator
pub trait BlobFetcher {
    /// Copy `bucket/key` to `dest` and return the local path.
    /// Must give up with `FetchError::TimedOut` once `timeout` has elapsed.
    fn fetch(&self, bucket: &str, key: &str, dest: &Path, timeout: Duration) -> Result<PathBuf, FetchError>;
}

pub struct LocalDirFetcher {
    root: PathBuf,
}

const CHUNK_SIZE: usize = 64 * 1024;

impl LocalDirFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalDirFetcher { root: root.into() }
    }

    fn blob_path(&self, bucket: &str, key: &str) -> Option<PathBuf> {
        // keys may contain '/', but never climb out of the bucket
        let key_path = Path::new(key);
        let key_safe = !key.is_empty()
            && key_path
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        let bucket_parts: Vec<Component> = Path::new(bucket).components().collect();
        let bucket_safe = matches!(bucket_parts.as_slice(), [Component::Normal(_)]);
        if !key_safe || !bucket_safe {
            return None;
        }
        Some(self.root.join(bucket).join(key_path))
    }
}

impl BlobFetcher for LocalDirFetcher {
    fn fetch(&self, bucket: &str, key: &str, dest: &Path, timeout: Duration) -> Result<PathBuf, FetchError> {
        let not_found = || FetchError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
        let unreadable = |source: std::io::Error| FetchError::Unreadable {
            bucket: bucket.to_string(),
            key: key.to_string(),
            source,
        };
        let staging = |source: std::io::Error| FetchError::Staging {
            path: dest.to_path_buf(),
            source,
        };

        let source_path = self.blob_path(bucket, key).ok_or_else(not_found)?;
        let mut input = match File::open(&source_path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(unreadable(e)),
        };

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(staging)?;
        }

        let mut partial_name = dest.as_os_str().to_os_string();
        partial_name.push(".partial");
        let partial = PathBuf::from(partial_name);

        let started = Instant::now();
        let mut copy = || -> Result<(), FetchError> {
            let mut output = File::create(&partial).map_err(staging)?;
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                if started.elapsed() >= timeout {
                    return Err(FetchError::TimedOut {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        after: timeout,
                    });
                }
                let n = input.read(&mut buf).map_err(unreadable)?;
                if n == 0 {
                    break;
                }
                output.write_all(&buf[..n]).map_err(staging)?;
            }
            output.sync_all().map_err(staging)
        };

        if let Err(e) = copy() {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }

        fs::rename(&partial, dest).map_err(staging)?;
        Ok(dest.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fetch_copies_blob() {
        let store = tempdir().unwrap();
        let staging = tempdir().unwrap();
        fs::create_dir_all(store.path().join("raw-bucket/daily")).unwrap();
        fs::write(store.path().join("raw-bucket/daily/transactions.csv"), "bank_id,amount,timestamp\n").unwrap();

        let fetcher = LocalDirFetcher::new(store.path());
        let dest = staging.path().join("tmp/transactions.csv");
        let path = fetcher
            .fetch("raw-bucket", "daily/transactions.csv", &dest, Duration::from_secs(5))
            .unwrap();

        assert_eq!(path, dest);
        assert_eq!(fs::read_to_string(&dest).unwrap(), "bank_id,amount,timestamp\n");
    }

    #[test]
    fn test_missing_blob_is_not_found() {
        let store = tempdir().unwrap();
        let staging = tempdir().unwrap();
        let fetcher = LocalDirFetcher::new(store.path());

        let result = fetcher.fetch("raw-bucket", "nope.csv", &staging.path().join("t.csv"), Duration::from_secs(5));
        assert!(matches!(result, Err(FetchError::NotFound { .. })));
    }

    #[test]
    fn test_key_cannot_escape_bucket() {
        let store = tempdir().unwrap();
        let staging = tempdir().unwrap();
        let fetcher = LocalDirFetcher::new(store.path());

        let result = fetcher.fetch("raw-bucket", "../secret.csv", &staging.path().join("t.csv"), Duration::from_secs(5));
        assert!(matches!(result, Err(FetchError::NotFound { .. })));
    }

    #[test]
    fn test_expired_timeout_leaves_no_file() {
        let store = tempdir().unwrap();
        let staging = tempdir().unwrap();
        fs::create_dir_all(store.path().join("b")).unwrap();
        fs::write(store.path().join("b/k.csv"), "x").unwrap();

        let fetcher = LocalDirFetcher::new(store.path());
        let dest = staging.path().join("k.csv");
        let result = fetcher.fetch("b", "k.csv", &dest, Duration::ZERO);

        assert!(matches!(result, Err(FetchError::TimedOut { .. })));
        assert!(!dest.exists());
        assert!(!staging.path().join("k.csv.partial").exists());
    }
}
