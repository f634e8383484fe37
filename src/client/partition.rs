/// Default slice size a large file is split at, 512 MiB.
pub const DEFAULT_PART_SIZE: u64 = 512 * 1024 * 1024;

/// Default upper bound on parts per file.
pub const DEFAULT_MAX_PARTS: u32 = 8;

/// Maps a file size to the number of parallel parts it is uploaded as.
#[derive(Clone, Copy, Debug)]
pub struct PartitionPolicy {
    pub part_size: u64,
    pub max_parts: u32,
}

impl Default for PartitionPolicy {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            max_parts: DEFAULT_MAX_PARTS,
        }
    }
}

impl PartitionPolicy {
    /// Part count for a file of `size` bytes: 1 up to `part_size`, then one
    /// per started slice, clamped at `max_parts`.
    #[must_use]
    pub fn part_count(&self, size: u64) -> u32 {
        let slice = self.part_size.max(1);
        if size <= slice {
            1
        } else {
            u32::try_from(size.div_ceil(slice).min(u64::from(self.max_parts.max(1))))
                .unwrap_or(self.max_parts)
        }
    }
}
