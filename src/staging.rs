use crate::error::Result;
use crate::metadata::UploadMetadata;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWriteExt, BufWriter};
use uuid::Uuid;

/// Per-upload sidecar record, rewritten after every accepted append.
///
/// Invariant: `0 <= offset <= size`; `offset == size` iff the payload file
/// is complete.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UploadInfo {
    pub id: String,
    pub size: u64,
    pub offset: u64,
    pub metadata: UploadMetadata,
    pub creation_date: String,
}

/// On-disk staging area: one raw payload file plus one JSON sidecar per
/// upload, both keyed by the staging id.
///
/// The directory is private to a single server process; no cross-process
/// coordination is attempted.
#[derive(Clone, Debug)]
pub struct StagingStore {
    dir: PathBuf,
}

impl StagingStore {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Creates the staging directory if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    #[must_use]
    pub fn payload_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    #[must_use]
    pub fn sidecar_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Allocates a fresh staging id, creating an empty payload file and the
    /// initial sidecar (offset 0).
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be written.
    pub async fn create(&self, size: u64, metadata: UploadMetadata) -> Result<UploadInfo> {
        let id = Uuid::new_v4().simple().to_string();
        fs::File::create(self.payload_path(&id)).await?;

        let info = UploadInfo {
            id,
            size,
            offset: 0,
            metadata,
            creation_date: chrono::Utc::now().to_rfc3339(),
        };
        self.write_info(&info).await?;
        Ok(info)
    }

    /// Loads the sidecar for `id`, or `None` when the upload is unknown.
    ///
    /// # Errors
    ///
    /// Returns an error on read failures other than a missing sidecar, or
    /// when the sidecar does not parse.
    pub async fn read_info(&self, id: &str) -> Result<Option<UploadInfo>> {
        match fs::read(self.sidecar_path(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Rewrites the sidecar for `info.id`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn write_info(&self, info: &UploadInfo) -> Result<()> {
        let bytes = serde_json::to_vec(info)?;
        fs::write(self.sidecar_path(&info.id), bytes).await?;
        Ok(())
    }

    /// Stream-copies `src` into the payload file at byte position `offset`,
    /// returning the number of bytes written. The caller is responsible for
    /// bounding `src`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload file cannot be opened or written.
    pub async fn append<R>(&self, id: &str, offset: u64, mut src: R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(self.payload_path(id))
            .await?;
        let mut writer = BufWriter::new(file);
        writer.seek(std::io::SeekFrom::Start(offset)).await?;
        let written = tokio::io::copy(&mut src, &mut writer).await?;
        writer.flush().await?;
        Ok(written)
    }

    /// Appends the whole payload of `part_id` to the end of `base_id`'s
    /// payload, returning the number of bytes copied.
    ///
    /// # Errors
    ///
    /// Returns an error if either payload file cannot be opened or copied.
    pub async fn concat_into(&self, base_id: &str, part_id: &str) -> Result<u64> {
        let mut part = fs::File::open(self.payload_path(part_id)).await?;
        let base = fs::OpenOptions::new()
            .append(true)
            .open(self.payload_path(base_id))
            .await?;
        let mut writer = BufWriter::new(base);
        let copied = tokio::io::copy(&mut part, &mut writer).await?;
        writer.flush().await?;
        Ok(copied)
    }

    /// Size of the payload file on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload file cannot be stat'ed.
    pub async fn payload_len(&self, id: &str) -> Result<u64> {
        Ok(fs::metadata(self.payload_path(id)).await?.len())
    }

    /// Removes payload and sidecar; missing files are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error on removal failures other than `NotFound`.
    pub async fn remove(&self, id: &str) -> Result<()> {
        remove_if_present(&self.payload_path(id)).await?;
        remove_if_present(&self.sidecar_path(id)).await?;
        Ok(())
    }

    /// Removes only the sidecar.
    ///
    /// # Errors
    ///
    /// Returns an error on removal failures other than `NotFound`.
    pub async fn remove_sidecar(&self, id: &str) -> Result<()> {
        remove_if_present(&self.sidecar_path(id)).await?;
        Ok(())
    }

    /// Moves the payload of `id` to `dest`, creating parent directories on
    /// demand.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation or the move fails.
    pub async fn move_payload(&self, id: &str, dest: &Path) -> Result<()> {
        move_file(&self.payload_path(id), dest).await?;
        Ok(())
    }

    /// Moves the sidecar of `id` to `dest`.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation or the move fails.
    pub async fn move_sidecar(&self, id: &str, dest: &Path) -> Result<()> {
        move_file(&self.sidecar_path(id), dest).await?;
        Ok(())
    }
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Renames `src` to `dest`, falling back to copy-then-unlink when the
/// destination is on a different volume.
async fn move_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    match fs::rename(src, dest).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            fs::copy(src, dest).await?;
            fs::remove_file(src).await
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> StagingStore {
        StagingStore::new(dir.to_path_buf())
    }

    #[tokio::test]
    async fn create_writes_empty_payload_and_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());

        let info = store
            .create(42, UploadMetadata::default())
            .await
            .expect("create");
        assert_eq!(info.size, 42);
        assert_eq!(info.offset, 0);
        assert_eq!(store.payload_len(&info.id).await.expect("len"), 0);

        let loaded = store
            .read_info(&info.id)
            .await
            .expect("read")
            .expect("present");
        assert_eq!(loaded.id, info.id);
        assert_eq!(loaded.creation_date, info.creation_date);
    }

    #[tokio::test]
    async fn read_info_for_unknown_id_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        assert!(store.read_info("missing").await.expect("read").is_none());
    }

    #[tokio::test]
    async fn append_writes_at_offset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        let info = store
            .create(10, UploadMetadata::default())
            .await
            .expect("create");

        let written = store
            .append(&info.id, 0, &b"hello"[..])
            .await
            .expect("append");
        assert_eq!(written, 5);
        let written = store
            .append(&info.id, 5, &b"world"[..])
            .await
            .expect("append");
        assert_eq!(written, 5);

        let bytes = fs::read(store.payload_path(&info.id)).await.expect("read");
        assert_eq!(bytes, b"helloworld");
    }

    #[tokio::test]
    async fn concat_preserves_order_and_remove_cleans_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        let base = store
            .create(6, UploadMetadata::default())
            .await
            .expect("create");
        let part = store
            .create(3, UploadMetadata::default())
            .await
            .expect("create");

        store.append(&base.id, 0, &b"abc"[..]).await.expect("append");
        store.append(&part.id, 0, &b"def"[..]).await.expect("append");

        let copied = store.concat_into(&base.id, &part.id).await.expect("concat");
        assert_eq!(copied, 3);
        let bytes = fs::read(store.payload_path(&base.id)).await.expect("read");
        assert_eq!(bytes, b"abcdef");

        store.remove(&part.id).await.expect("remove");
        assert!(!store.payload_path(&part.id).exists());
        assert!(!store.sidecar_path(&part.id).exists());
        // removing twice is fine
        store.remove(&part.id).await.expect("remove");
    }

    #[tokio::test]
    async fn move_payload_creates_destination_dirs() {
        let staging = tempfile::tempdir().expect("tempdir");
        let mount = tempfile::tempdir().expect("tempdir");
        let store = store(staging.path());
        let info = store
            .create(3, UploadMetadata::default())
            .await
            .expect("create");
        store.append(&info.id, 0, &b"xyz"[..]).await.expect("append");

        let dest = mount.path().join("docs/2024/out.bin");
        store.move_payload(&info.id, &dest).await.expect("move");

        assert!(!store.payload_path(&info.id).exists());
        assert_eq!(fs::read(&dest).await.expect("read"), b"xyz");
    }
}
