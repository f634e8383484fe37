use crate::error::{Error, Result};
use regex::Regex;
use std::path::{Path, PathBuf};

/// Resolves destination paths beneath the configured mount root and maps
/// caller-supplied names to safe on-disk filenames.
#[derive(Clone, Debug)]
pub struct PathService {
    mount_path: PathBuf,
    sanitize: Regex,
}

impl PathService {
    /// Builds a service rooted at `mount_path`, compiling the sanitize
    /// pattern once.
    ///
    /// # Errors
    ///
    /// Returns an error if `pattern` is not a valid regular expression.
    pub fn new(mount_path: PathBuf, pattern: &str) -> Result<Self> {
        let sanitize = Regex::new(pattern)
            .map_err(|e| Error::ConfigError(format!("Invalid sanitize pattern: {e}")))?;
        Ok(Self {
            mount_path,
            sanitize,
        })
    }

    #[must_use]
    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    /// Replaces every disallowed character with `_`. Idempotent.
    #[must_use]
    pub fn sanitize(&self, name: &str) -> String {
        self.sanitize.replace_all(name, "_").into_owned()
    }

    /// Strips leading and trailing separators; a non-empty result ends with
    /// a separator so it can be joined directly.
    #[must_use]
    pub fn normalize(dest_path: &str) -> String {
        let trimmed = dest_path.trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        }
    }

    /// Directory a destination path resolves to beneath the mount root.
    #[must_use]
    pub fn destination_dir(&self, dest_path: &str) -> PathBuf {
        let normalized = Self::normalize(dest_path);
        if normalized.is_empty() {
            self.mount_path.clone()
        } else {
            self.mount_path.join(normalized)
        }
    }

    /// Full path of `filename` within the destination directory.
    #[must_use]
    pub fn full_path(&self, filename: &str, dest_path: &str) -> PathBuf {
        self.destination_dir(dest_path).join(filename)
    }

    /// Whether `filename` already exists at the destination. Used only for
    /// the `prevent` policy's pre-rejection at create time.
    #[must_use]
    pub fn exists(&self, filename: &str, dest_path: &str) -> bool {
        self.full_path(filename, dest_path).exists()
    }
}

/// Returns the first name in the `base(1).ext`, `base(2).ext`, … sequence
/// that does not collide in `dir`, creating `dir` if needed. The unmodified
/// name is returned when it is free. Callers own the small window between
/// the probe and the actual move; the server is the single writer.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn unique_name(filename: &str, dir: &Path) -> std::io::Result<String> {
    std::fs::create_dir_all(dir)?;

    if !dir.join(filename).exists() {
        return Ok(filename.to_string());
    }

    let path = Path::new(filename);
    let base = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();

    let mut counter = 1u32;
    loop {
        let candidate = format!("{base}({counter}){extension}");
        if !dir.join(&candidate).exists() {
            return Ok(candidate);
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> PathService {
        PathService::new(
            PathBuf::from("/mnt/files"),
            crate::config::DEFAULT_SANITIZE_PATTERN,
        )
        .expect("default pattern compiles")
    }

    #[test]
    fn sanitize_replaces_disallowed_bytes() {
        let paths = service();
        assert_eq!(paths.sanitize("my report (v2).pdf"), "my_report__v2_.pdf");
        assert_eq!(paths.sanitize("safe-name_1.txt"), "safe-name_1.txt");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let paths = service();
        let once = paths.sanitize("a b/c\\d.bin");
        assert_eq!(paths.sanitize(&once), once);
    }

    #[test]
    fn normalize_strips_separators() {
        assert_eq!(PathService::normalize(""), "");
        assert_eq!(PathService::normalize("/"), "");
        assert_eq!(PathService::normalize("docs"), "docs/");
        assert_eq!(PathService::normalize("/docs/2024/"), "docs/2024/");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = PathService::normalize("/a/b/");
        assert_eq!(PathService::normalize(&once), once);
    }

    #[test]
    fn destination_paths_resolve_under_mount() {
        let paths = service();
        assert_eq!(paths.destination_dir(""), PathBuf::from("/mnt/files"));
        assert_eq!(
            paths.full_path("report.pdf", "docs"),
            PathBuf::from("/mnt/files/docs/report.pdf")
        );
    }

    #[test]
    fn unique_name_probes_numbered_suffixes() {
        let dir = tempfile::tempdir().expect("tempdir");

        assert_eq!(
            unique_name("report.pdf", dir.path()).expect("probe"),
            "report.pdf"
        );

        std::fs::write(dir.path().join("report.pdf"), b"x").expect("write");
        assert_eq!(
            unique_name("report.pdf", dir.path()).expect("probe"),
            "report(1).pdf"
        );

        std::fs::write(dir.path().join("report(1).pdf"), b"x").expect("write");
        let name = unique_name("report.pdf", dir.path()).expect("probe");
        assert_eq!(name, "report(2).pdf");
        assert!(!dir.path().join(&name).exists());
    }

    #[test]
    fn unique_name_without_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("LICENSE"), b"x").expect("write");
        assert_eq!(
            unique_name("LICENSE", dir.path()).expect("probe"),
            "LICENSE(1)"
        );
    }
}
