use crate::client::batch;
use crate::client::partition::PartitionPolicy;
use crate::client::session::TusClient;
use crate::client::{QueuedFile, UploadStatus};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::metadata::UploadMetadata;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, error, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::task::AbortHandle;
use uuid::Uuid;

/// Drives a queue of files against a TUS endpoint: knapsack batch
/// selection over part counts, one session per part, await-all-settled
/// barrier between batches.
#[derive(Clone)]
pub struct Scheduler {
    config: ClientConfig,
    policy: PartitionPolicy,
    client: TusClient,
    queue: Arc<Mutex<Vec<QueuedFile>>>,
    /// Session abort handles indexed `{file_id}` (solo) or
    /// `{file_id}-{part_index}` (multipart).
    sessions: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let client = TusClient::new(&config);
        Self {
            config,
            policy: PartitionPolicy::default(),
            client,
            queue: Arc::new(Mutex::new(Vec::new())),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Replaces the partitioning policy (defaults to the 512 MiB / 8-part
    /// scheme).
    #[must_use]
    pub fn with_policy(mut self, policy: PartitionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Adds a file to the queue and returns its client-side id.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` cannot be stat'ed or is not a file.
    pub async fn enqueue(&self, path: &Path) -> Result<String> {
        let stat = tokio::fs::metadata(path).await?;
        if !stat.is_file() {
            return Err(Error::ConfigError(format!(
                "{} is not a file",
                path.display()
            )));
        }

        let size = stat.len();
        let parts = self.policy.part_count(size);
        let file = QueuedFile {
            id: Uuid::new_v4().simple().to_string(),
            path: path.to_path_buf(),
            size,
            parts,
            status: UploadStatus::Pending,
            progress: 0,
            uploaded_bytes: 0,
        };
        let id = file.id.clone();

        self.queue.lock().push(file);
        debug!("queued {} ({size} bytes, {parts} part(s))", path.display());
        Ok(id)
    }

    /// Current view of the queue.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueuedFile> {
        self.queue.lock().clone()
    }

    /// Removes a file, aborting every session it still has in flight.
    pub fn remove(&self, file_id: &str) {
        self.drop_sessions(file_id);
        self.queue.lock().retain(|f| f.id != file_id);
    }

    /// Drops completed entries; never touches uploading files.
    pub fn clear_completed(&self) {
        self.queue
            .lock()
            .retain(|f| f.status != UploadStatus::Completed);
    }

    /// Drops pending entries; never touches uploading files.
    pub fn clear_pending(&self) {
        self.queue
            .lock()
            .retain(|f| f.status != UploadStatus::Pending);
    }

    /// Runs until the queue has no pending files: select a batch, launch
    /// it, wait for every session to settle, re-plan. Failures mark only
    /// the originating file.
    pub async fn run(&self) {
        loop {
            let selected = self.next_batch();
            if selected.is_empty() {
                break;
            }

            info!("starting batch of {} file(s)", selected.len());
            futures::future::join_all(
                selected.into_iter().map(|file| self.upload_file(file)),
            )
            .await;

            // let newly enqueued files surface before re-planning
            tokio::task::yield_now().await;
        }
    }

    /// Marks the chosen batch as uploading and returns it. Oversized files
    /// that fit no budget are forced through one at a time.
    fn next_batch(&self) -> Vec<QueuedFile> {
        let mut queue = self.queue.lock();

        let pending: Vec<usize> = queue
            .iter()
            .enumerate()
            .filter(|(_, f)| f.status == UploadStatus::Pending)
            .map(|(i, _)| i)
            .take(self.config.max_file_selection)
            .collect();
        let parts: Vec<u32> = pending.iter().map(|&i| queue[i].parts).collect();
        let capacity = u32::try_from(self.config.max_stream_count).unwrap_or(u32::MAX);

        batch::plan(&parts, capacity)
            .into_iter()
            .map(|j| {
                let i = pending[j];
                queue[i].status = UploadStatus::Uploading;
                queue[i].clone()
            })
            .collect()
    }

    async fn upload_file(&self, file: QueuedFile) {
        debug!(
            "uploading {} as {} part(s)",
            file.path.display(),
            file.parts
        );
        let result = if file.parts <= 1 {
            self.upload_solo(&file).await
        } else {
            self.upload_parts(&file).await
        };
        self.drop_sessions(&file.id);

        let mut queue = self.queue.lock();
        if let Some(entry) = queue.iter_mut().find(|f| f.id == file.id) {
            match result {
                Ok(()) => {
                    entry.status = UploadStatus::Completed;
                    entry.progress = 100;
                    entry.uploaded_bytes = entry.size;
                    info!("{} uploaded", file.path.display());
                }
                Err(e) => {
                    entry.status = UploadStatus::Error;
                    error!("upload of {} failed: {e}", file.path.display());
                }
            }
        }
    }

    async fn upload_solo(&self, file: &QueuedFile) -> Result<()> {
        let metadata = self.base_metadata(file);
        let client = self.client.clone();
        let queue = self.queue.clone();
        let (file_id, path, size) = (file.id.clone(), file.path.clone(), file.size);

        let task = tokio::spawn(async move {
            let upload_url = client.create(size, &metadata).await?;
            client
                .upload_range(&upload_url, &path, 0..size, move |delta| {
                    record_progress(&queue, &file_id, size, delta);
                })
                .await
        });
        self.sessions
            .lock()
            .insert(file.id.clone(), task.abort_handle());

        match task.await {
            Ok(result) => result,
            Err(_) => Err(Error::UploadError("upload aborted".to_string())),
        }
    }

    async fn upload_parts(&self, file: &QueuedFile) -> Result<()> {
        let multipart_id = Uuid::new_v4().simple().to_string();
        let slice = file.size.div_ceil(u64::from(file.parts));

        let mut aborts = Vec::new();
        let mut tasks = FuturesUnordered::new();
        for index in 1..=file.parts {
            let start = u64::from(index - 1) * slice;
            let end = (start + slice).min(file.size);

            let mut metadata = self.base_metadata(file);
            metadata.multipart_id = Some(multipart_id.clone());
            metadata.part_index = Some(index.to_string());
            metadata.total_parts = Some(file.parts.to_string());
            metadata.original_file_size = Some(file.size.to_string());

            let client = self.client.clone();
            let queue = self.queue.clone();
            let (file_id, path, size) = (file.id.clone(), file.path.clone(), file.size);

            let task = tokio::spawn(async move {
                let upload_url = client.create(end - start, &metadata).await?;
                client
                    .upload_range(&upload_url, &path, start..end, move |delta| {
                        record_progress(&queue, &file_id, size, delta);
                    })
                    .await
            });
            aborts.push(task.abort_handle());
            self.sessions
                .lock()
                .insert(format!("{}-{index}", file.id), task.abort_handle());
            tasks.push(task);
        }

        // the first part failure aborts the remaining sibling sessions;
        // later resolutions only get drained
        let mut first_error = None;
        while let Some(joined) = tasks.next().await {
            let outcome = match joined {
                Ok(result) => result,
                Err(_) => Err(Error::UploadError("upload aborted".to_string())),
            };
            if let Err(e) = outcome {
                if first_error.is_none() {
                    for handle in &aborts {
                        handle.abort();
                    }
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn base_metadata(&self, file: &QueuedFile) -> UploadMetadata {
        let filename = file
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&file.id)
            .to_string();
        let filetype = mime_guess::from_path(&file.path)
            .first_or_octet_stream()
            .to_string();

        UploadMetadata {
            filename: Some(filename),
            filetype: Some(filetype),
            with_filename: Some(self.config.with_filename.clone()),
            on_duplicate: Some(self.config.on_duplicate.clone()),
            destination_path: Some(self.config.destination_path.clone()),
            ..UploadMetadata::default()
        }
    }

    /// Aborts and forgets every session handle of `file_id` (solo and
    /// per-part keys alike). Aborting a settled task is a no-op.
    fn drop_sessions(&self, file_id: &str) {
        let prefix = format!("{file_id}-");
        self.sessions.lock().retain(|key, handle| {
            if key == file_id || key.starts_with(&prefix) {
                handle.abort();
                false
            } else {
                true
            }
        });
    }
}

fn record_progress(
    queue: &Arc<Mutex<Vec<QueuedFile>>>,
    file_id: &str,
    size: u64,
    delta: u64,
) {
    let mut queue = queue.lock();
    if let Some(entry) = queue.iter_mut().find(|f| f.id == file_id) {
        entry.uploaded_bytes = (entry.uploaded_bytes + delta).min(size);
        #[allow(clippy::cast_possible_truncation)]
        let percent = (entry.uploaded_bytes * 100 / size.max(1)) as u8;
        entry.progress = percent.min(99);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scheduler_with(policy: PartitionPolicy, max_streams: usize) -> Scheduler {
        let mut config = ClientConfig::new("http://localhost:9/api/upload/".to_string())
            .expect("valid endpoint");
        config.max_stream_count = max_streams;
        Scheduler::new(config).with_policy(policy)
    }

    fn temp_file(dir: &tempfile::TempDir, name: &str, len: usize) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).expect("create");
        file.write_all(&vec![0u8; len]).expect("write");
        path
    }

    #[tokio::test]
    async fn enqueue_annotates_part_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scheduler = scheduler_with(
            PartitionPolicy {
                part_size: 4,
                max_parts: 8,
            },
            8,
        );

        scheduler
            .enqueue(&temp_file(&dir, "small.bin", 4))
            .await
            .expect("enqueue");
        scheduler
            .enqueue(&temp_file(&dir, "large.bin", 10))
            .await
            .expect("enqueue");

        let queue = scheduler.snapshot();
        assert_eq!(queue[0].parts, 1);
        assert_eq!(queue[1].parts, 3);
        assert!(queue.iter().all(|f| f.status == UploadStatus::Pending));
    }

    #[tokio::test]
    async fn next_batch_forces_an_oversized_file_through() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scheduler = scheduler_with(
            PartitionPolicy {
                part_size: 1,
                max_parts: 16,
            },
            8,
        );
        scheduler
            .enqueue(&temp_file(&dir, "huge.bin", 16))
            .await
            .expect("enqueue");

        let batch = scheduler.next_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].parts, 16);
        assert_eq!(
            scheduler.snapshot()[0].status,
            UploadStatus::Uploading
        );
    }

    #[tokio::test]
    async fn next_batch_fills_the_stream_budget() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scheduler = scheduler_with(
            PartitionPolicy {
                part_size: 4,
                max_parts: 8,
            },
            8,
        );
        // parts: 2, 3, 8, 3
        for (name, len) in [("a", 8), ("b", 12), ("c", 32), ("d", 12)] {
            scheduler
                .enqueue(&temp_file(&dir, name, len))
                .await
                .expect("enqueue");
        }

        let batch = scheduler.next_batch();
        let total: u32 = batch.iter().map(|f| f.parts).sum();
        assert_eq!(total, 8);

        // a second selection keeps going with what is left
        let batch = scheduler.next_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].parts, 8);
    }

    #[tokio::test]
    async fn clear_ops_leave_uploading_files_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scheduler = scheduler_with(PartitionPolicy::default(), 8);
        scheduler
            .enqueue(&temp_file(&dir, "a.bin", 1))
            .await
            .expect("enqueue");
        scheduler
            .enqueue(&temp_file(&dir, "b.bin", 1))
            .await
            .expect("enqueue");

        {
            let mut queue = scheduler.queue.lock();
            queue[0].status = UploadStatus::Uploading;
            queue[1].status = UploadStatus::Completed;
        }

        scheduler.clear_completed();
        scheduler.clear_pending();
        let queue = scheduler.snapshot();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].status, UploadStatus::Uploading);
    }

    #[tokio::test]
    async fn remove_forgets_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scheduler = scheduler_with(PartitionPolicy::default(), 8);
        let id = scheduler
            .enqueue(&temp_file(&dir, "a.bin", 1))
            .await
            .expect("enqueue");

        scheduler.remove(&id);
        assert!(scheduler.snapshot().is_empty());
    }
}
