use crate::error::{Error, Result};
use crate::metadata::UploadMetadata;
use crate::server::AppState;
use crate::server::handlers::finalize_solo;
use crate::staging::UploadInfo;
use log::{debug, info};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// One sibling group awaiting its completion barrier.
struct Assembly {
    total_parts: u32,
    metadata: UploadMetadata,
    /// part index (1-based) -> staging id of that part's payload
    parts: HashMap<u32, String>,
}

/// Tracks multipart sibling groups and concatenates them once the last part
/// lands. State is process-local; a restart orphans in-flight groups.
///
/// The map mutex makes "record this part, was it the last?" atomic per
/// group, and a completed assembly is taken out of the map before
/// reassembly starts, so a group is discarded exactly once and can never
/// re-fire after a failure.
#[derive(Default)]
pub struct Assembler {
    groups: Mutex<HashMap<String, Assembly>>,
}

impl Assembler {
    /// Records the completion of one part. Returns `true` when this part
    /// was the last of its group and reassembly (including the final move)
    /// succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error if the multipart metadata is unparseable or
    /// reassembly fails; the group is discarded either way.
    pub async fn handle_part_completion(
        &self,
        state: &AppState,
        staging_id: &str,
        metadata: &UploadMetadata,
    ) -> Result<bool> {
        let (part_index, total_parts) = metadata
            .part_numbers()
            .ok_or_else(|| Error::Protocol("Invalid multipart metadata".to_string()))?;
        let multipart_id = metadata
            .multipart_id
            .clone()
            .ok_or_else(|| Error::Protocol("Invalid multipart metadata".to_string()))?;

        let completed = {
            let mut groups = self.groups.lock().await;
            let assembly = groups.entry(multipart_id.clone()).or_insert_with(|| Assembly {
                total_parts,
                metadata: metadata.clone(),
                parts: HashMap::new(),
            });
            assembly.parts.insert(part_index, staging_id.to_string());
            debug!(
                "group {multipart_id}: {}/{} parts complete",
                assembly.parts.len(),
                assembly.total_parts
            );

            if (assembly.parts.len() as u32) < assembly.total_parts {
                None
            } else {
                groups.remove(&multipart_id)
            }
        };

        match completed {
            None => Ok(false),
            Some(assembly) => {
                self.reassemble(state, &multipart_id, assembly).await?;
                Ok(true)
            }
        }
    }

    /// Drops a pending group, e.g. when one of its siblings is terminated.
    pub async fn discard(&self, multipart_id: &str) {
        if self.groups.lock().await.remove(multipart_id).is_some() {
            info!("group {multipart_id}: pending assembly discarded");
        }
    }

    /// Concatenates parts 2..=N into part 1's payload in strict index
    /// order, then finalizes part 1 as if it were a solo upload.
    async fn reassemble(
        &self,
        state: &AppState,
        multipart_id: &str,
        assembly: Assembly,
    ) -> Result<()> {
        let base_id = assembly
            .parts
            .get(&1)
            .ok_or_else(|| {
                Error::UploadError(format!("group {multipart_id} is missing part 1"))
            })?
            .clone();

        for index in 2..=assembly.total_parts {
            let part_id = assembly.parts.get(&index).ok_or_else(|| {
                Error::UploadError(format!("group {multipart_id} is missing part {index}"))
            })?;
            let copied = state.store.concat_into(&base_id, part_id).await?;
            state.store.remove(part_id).await?;
            debug!("group {multipart_id}: absorbed part {index} ({copied} bytes)");
        }

        // The original file size is authoritative; the last part may be
        // short of an even split.
        let size = match assembly.metadata.original_size() {
            Some(size) => size,
            None => state.store.payload_len(&base_id).await?,
        };

        let Some(original) = state.store.read_info(&base_id).await? else {
            return Err(Error::UploadError(format!(
                "group {multipart_id} lost the sidecar of part 1"
            )));
        };

        // From here on the base payload looks like a single completed solo
        // upload of the logical file.
        let merged = UploadInfo {
            id: base_id.clone(),
            size,
            offset: size,
            metadata: assembly.metadata.clone(),
            creation_date: original.creation_date,
        };
        state.store.write_info(&merged).await?;

        info!(
            "group {multipart_id}: reassembled {} parts into {base_id} ({size} bytes)",
            assembly.total_parts
        );
        finalize_solo(state, &merged).await
    }
}
