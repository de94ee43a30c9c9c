//! Local content-addressed blob store
//!
//! Layout:
//! - Blobs live at `root/blobs/aa/bb/<hash>` where `aa`/`bb` are the first
//!   two byte pairs of the hex BLAKE3 hash (balanced two-level fan-out)
//! - In-flight writes stream into `root/tmp/<uuid>` and are renamed into
//!   place once the content hash is known
//!
//! The hash of the bytes actually written is the only key: a writer commits
//! under its computed hash regardless of what the caller expected, and two
//! concurrent writers of the same content converge on one file.

use crate::common::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;

pub struct BlobStore {
    root: PathBuf,
    space_used: AtomicU64,
}

/// Fan-out directories for a hex hash.
fn blob_prefix(oid: &str) -> (&str, &str) {
    (&oid[0..2], &oid[2..4])
}

/// Hashes are lowercase hex; anything else is not a key we ever produced.
fn valid_oid(oid: &str) -> bool {
    oid.len() >= 4 && oid.bytes().all(|b| b.is_ascii_hexdigit())
}

impl BlobStore {
    /// Open or create the store under `root`, discarding half-written temp
    /// files and seeding the space-used counter from the blobs on disk.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("blobs"))?;

        let tmp = root.join("tmp");
        if tmp.exists() {
            std::fs::remove_dir_all(&tmp)?;
        }
        std::fs::create_dir_all(&tmp)?;

        let store = Self {
            root,
            space_used: AtomicU64::new(0),
        };
        let blobs = store.iter_blobs()?;
        let used: u64 = blobs.iter().map(|(_, size)| size).sum();
        store.space_used.store(used, Ordering::Relaxed);

        tracing::info!(
            "Blob store opened: {} blobs, {} used",
            blobs.len(),
            crate::common::format_bytes(used)
        );
        Ok(store)
    }

    fn blob_path(&self, oid: &str) -> PathBuf {
        let (aa, bb) = blob_prefix(oid);
        self.root.join("blobs").join(aa).join(bb).join(oid)
    }

    pub fn contains(&self, oid: &str) -> bool {
        valid_oid(oid) && self.blob_path(oid).exists()
    }

    pub fn blob_size(&self, oid: &str) -> Result<u64> {
        if !valid_oid(oid) {
            return Err(Error::BadRecord(format!("bad blob id: {}", oid)));
        }
        let meta = std::fs::metadata(self.blob_path(oid))
            .map_err(|_| Error::NotFound(oid.to_string()))?;
        Ok(meta.len())
    }

    pub async fn open_blob(&self, oid: &str) -> Result<tokio::fs::File> {
        if !valid_oid(oid) {
            return Err(Error::BadRecord(format!("bad blob id: {}", oid)));
        }
        tokio::fs::File::open(self.blob_path(oid))
            .await
            .map_err(|_| Error::NotFound(oid.to_string()))
    }

    /// Start a streaming write. The blob's identity is decided by the bytes
    /// pushed through the writer, not by the caller.
    pub async fn writer(&self) -> Result<BlobWriter<'_>> {
        let tmp = self.root.join("tmp").join(uuid::Uuid::new_v4().to_string());
        let file = tokio::fs::File::create(&tmp).await?;
        Ok(BlobWriter {
            store: self,
            tmp: Some(tmp),
            file,
            hasher: blake3::Hasher::new(),
            length: 0,
        })
    }

    /// One-shot ingest of an in-memory buffer.
    pub async fn store_bytes(&self, data: &[u8]) -> Result<(String, u64)> {
        let mut writer = self.writer().await?;
        writer.write_chunk(data).await?;
        writer.commit().await
    }

    /// Delete a blob, returning the bytes freed.
    pub fn delete_blob(&self, oid: &str) -> Result<u64> {
        let size = self.blob_size(oid)?;
        std::fs::remove_file(self.blob_path(oid))?;
        self.space_used.fetch_sub(size, Ordering::Relaxed);
        Ok(size)
    }

    /// Every stored blob as `(hash, size)`.
    pub fn iter_blobs(&self) -> Result<Vec<(String, u64)>> {
        let mut blobs = Vec::new();
        let base = self.root.join("blobs");
        for aa in std::fs::read_dir(&base)? {
            let aa = aa?.path();
            if !aa.is_dir() {
                continue;
            }
            for bb in std::fs::read_dir(&aa)? {
                let bb = bb?.path();
                if !bb.is_dir() {
                    continue;
                }
                for entry in std::fs::read_dir(&bb)? {
                    let entry = entry?;
                    if let Some(name) = entry.file_name().to_str() {
                        if valid_oid(name) {
                            blobs.push((name.to_string(), entry.metadata()?.len()));
                        }
                    }
                }
            }
        }
        Ok(blobs)
    }

    pub fn space_used(&self) -> u64 {
        self.space_used.load(Ordering::Relaxed)
    }

    /// Available bytes on the filesystem holding the store.
    #[cfg(unix)]
    pub fn free_space(&self) -> Result<u64> {
        use std::os::unix::ffi::OsStrExt;

        let path = std::ffi::CString::new(self.root.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(path.as_ptr(), &mut stat) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }

    #[cfg(not(unix))]
    pub fn free_space(&self) -> Result<u64> {
        Err(Error::NoFsFree)
    }
}

/// Streaming content-addressed writer. Dropping an uncommitted writer
/// discards the temp file.
pub struct BlobWriter<'a> {
    store: &'a BlobStore,
    tmp: Option<PathBuf>,
    file: tokio::fs::File,
    hasher: blake3::Hasher,
    length: u64,
}

impl BlobWriter<'_> {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.hasher.update(chunk);
        self.file.write_all(chunk).await?;
        self.length += chunk.len() as u64;
        Ok(())
    }

    /// Finish the write: returns `(hash, length)` of what was actually
    /// stored, with the blob renamed into its content-addressed home.
    pub async fn commit(mut self) -> Result<(String, u64)> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        let oid = self.hasher.finalize().to_hex().to_string();
        let tmp = self.tmp.take().expect("writer committed twice");
        let target = self.store.blob_path(&oid);

        if target.exists() {
            // concurrent write of the same content already landed
            std::fs::remove_file(&tmp)?;
        } else {
            std::fs::create_dir_all(target.parent().unwrap())?;
            std::fs::rename(&tmp, &target)?;
            self.store.space_used.fetch_add(self.length, Ordering::Relaxed);
        }
        Ok((oid, self.length))
    }
}

impl Drop for BlobWriter<'_> {
    fn drop(&mut self) {
        if let Some(tmp) = self.tmp.take() {
            let _ = std::fs::remove_file(tmp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_store_and_read_back() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let (oid, len) = store.store_bytes(b"hello world").await.unwrap();
        assert_eq!(len, 11);
        assert_eq!(oid, blake3::hash(b"hello world").to_hex().to_string());
        assert!(store.contains(&oid));
        assert_eq!(store.blob_size(&oid).unwrap(), 11);
        assert_eq!(store.space_used(), 11);

        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        store
            .open_blob(&oid)
            .await
            .unwrap()
            .read_to_end(&mut buf)
            .await
            .unwrap();
        assert_eq!(buf, b"hello world");
    }

    #[tokio::test]
    async fn test_duplicate_writes_converge() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let (oid1, _) = store.store_bytes(b"same bytes").await.unwrap();
        let (oid2, _) = store.store_bytes(b"same bytes").await.unwrap();
        assert_eq!(oid1, oid2);
        assert_eq!(store.iter_blobs().unwrap().len(), 1);
        // second write freed its temp and did not double-count
        assert_eq!(store.space_used(), 10);
    }

    #[tokio::test]
    async fn test_delete_blob() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let (oid, _) = store.store_bytes(b"doomed").await.unwrap();
        let freed = store.delete_blob(&oid).unwrap();
        assert_eq!(freed, 6);
        assert!(!store.contains(&oid));
        assert_eq!(store.space_used(), 0);

        assert!(matches!(
            store.delete_blob(&oid),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_writer_leaves_nothing() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        {
            let mut writer = store.writer().await.unwrap();
            writer.write_chunk(b"abandoned").await.unwrap();
        }
        assert!(store.iter_blobs().unwrap().is_empty());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("tmp"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_reopen_rescans_usage() {
        let dir = tempdir().unwrap();
        {
            let store = BlobStore::open(dir.path()).unwrap();
            store.store_bytes(b"persist me").await.unwrap();
        }
        let store = BlobStore::open(dir.path()).unwrap();
        assert_eq!(store.space_used(), 10);
        assert_eq!(store.iter_blobs().unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_bad_ids() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        assert!(!store.contains("../../etc/passwd"));
        assert!(store.blob_size("zz").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_free_space_reports() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        assert!(store.free_space().unwrap() > 0);
    }
}
