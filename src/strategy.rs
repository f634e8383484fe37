use crate::error::Result;
use crate::metadata::UploadMetadata;
use crate::paths::{self, PathService};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Strategy applied when the chosen filename collides on disk:
/// `(filename, destination_dir) -> filename`.
pub type DuplicateHandler = Arc<dyn Fn(&str, &Path) -> Result<String> + Send + Sync>;

/// Strategy producing the final filename for a completed upload:
/// `(registry, paths, metadata, staging_id) -> filename`. Handlers receive
/// the registry so they can dispatch a duplicate handler themselves.
pub type FilenameHandler =
    Arc<dyn Fn(&StrategyRegistry, &PathService, &UploadMetadata, &str) -> Result<String> + Send + Sync>;

const FILENAME_FALLBACK: &str = "default";
const DUPLICATE_FALLBACK: &str = "prevent";

/// Open dispatch tables for filename and duplicate-resolution policies.
///
/// The built-ins are registered at construction; deployments may register
/// additional named policies before the server starts. Unknown names fall
/// back to the documented defaults, never to an error.
pub struct StrategyRegistry {
    filename: HashMap<String, FilenameHandler>,
    duplicate: HashMap<String, DuplicateHandler>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyRegistry {
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self {
            filename: HashMap::new(),
            duplicate: HashMap::new(),
        };

        registry.register_duplicate("prevent", Arc::new(|filename, _dir| Ok(filename.to_string())));
        registry.register_duplicate("number", Arc::new(|filename, dir| {
            Ok(paths::unique_name(filename, dir)?)
        }));

        registry.register_filename("default", Arc::new(|_registry, _paths, _metadata, staging_id| {
            Ok(staging_id.to_string())
        }));
        registry.register_filename("original", Arc::new(|registry, paths, metadata, staging_id| {
            let name = match metadata.filename.as_deref() {
                Some(filename) if !filename.is_empty() => paths.sanitize(filename),
                _ => staging_id.to_string(),
            };
            let dest = metadata.destination_path.as_deref().unwrap_or("");
            let dir = paths.destination_dir(dest);
            registry.resolve_duplicate(metadata.on_duplicate.as_deref(), &name, &dir)
        }));

        registry
    }

    pub fn register_filename(&mut self, name: &str, handler: FilenameHandler) {
        self.filename.insert(name.to_string(), handler);
    }

    pub fn register_duplicate(&mut self, name: &str, handler: DuplicateHandler) {
        self.duplicate.insert(name.to_string(), handler);
    }

    /// Maps a completed upload to its final filename by dispatching the
    /// policy named in `metadata.with_filename`.
    ///
    /// # Errors
    ///
    /// Returns an error if the dispatched handler fails (disk probing).
    pub fn final_filename(
        &self,
        paths: &PathService,
        metadata: &UploadMetadata,
        staging_id: &str,
    ) -> Result<String> {
        let name = metadata.with_filename.as_deref().unwrap_or(FILENAME_FALLBACK);
        match self
            .filename
            .get(name)
            .or_else(|| self.filename.get(FILENAME_FALLBACK))
        {
            Some(handler) => handler(self, paths, metadata, staging_id),
            None => Ok(staging_id.to_string()),
        }
    }

    /// Applies the duplicate policy named by `name` (fallback `prevent`).
    ///
    /// # Errors
    ///
    /// Returns an error if the dispatched handler fails.
    pub fn resolve_duplicate(
        &self,
        name: Option<&str>,
        filename: &str,
        dir: &Path,
    ) -> Result<String> {
        let name = name.unwrap_or(DUPLICATE_FALLBACK);
        match self
            .duplicate
            .get(name)
            .or_else(|| self.duplicate.get(DUPLICATE_FALLBACK))
        {
            Some(handler) => handler(filename, dir),
            None => Ok(filename.to_string()),
        }
    }
}

/// Whether the sidecar should be preserved next to the moved file.
#[must_use]
pub fn uses_original_filename(metadata: &UploadMetadata) -> bool {
    metadata.with_filename.as_deref() == Some("original")
        && metadata.filename.as_deref().is_some_and(|f| !f.is_empty())
}
