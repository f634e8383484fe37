use crate::error::{Error, Result};
use std::path::PathBuf;

/// Default cap on a single upload's `Upload-Length`, 20 GiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 20 * 1024 * 1024 * 1024;

/// Every byte matching this pattern is replaced with `_` in final filenames.
pub const DEFAULT_SANITIZE_PATTERN: &str = "[^A-Za-z0-9._-]";

/// Path portion of the upload endpoint, shared by server routes and client defaults.
pub const UPLOAD_ROUTE: &str = "/api/upload/";

const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;
const DEFAULT_RETRY_DELAYS_MS: [u64; 4] = [0, 1000, 3000, 5000];
const DEFAULT_MAX_FILE_SELECTION: usize = 60;
const DEFAULT_MAX_STREAM_COUNT: usize = 8;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub staging_dir: PathBuf,
    pub mount_path: PathBuf,
    pub max_file_size: u64,
    pub filename_sanitize_pattern: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from("./staging"),
            mount_path: PathBuf::from("./uploads"),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            filename_sanitize_pattern: DEFAULT_SANITIZE_PATTERN.to_string(),
        }
    }
}

impl ServerConfig {
    /// Creates a new `ServerConfig` with the provided directories.
    ///
    /// # Errors
    ///
    /// Returns an error if either path is empty.
    pub fn new(staging_dir: PathBuf, mount_path: PathBuf) -> Result<Self> {
        if staging_dir.as_os_str().is_empty() {
            return Err(Error::ConfigError(
                "Staging directory cannot be empty".to_string(),
            ));
        }
        if mount_path.as_os_str().is_empty() {
            return Err(Error::ConfigError(
                "Mount path cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            staging_dir,
            mount_path,
            ..Self::default()
        })
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Full URL of the upload root, e.g. `http://localhost:8080/api/upload/`.
    pub endpoint: String,
    pub chunk_size: u64,
    /// Delays between retry attempts, in milliseconds.
    pub retry_delays: Vec<u64>,
    /// Upper bound on how many pending files batch selection considers.
    pub max_file_selection: usize,
    /// Concurrent stream budget shared by all files of a batch.
    pub max_stream_count: usize,
    pub with_filename: String,
    pub on_duplicate: String,
    pub destination_path: String,
}

impl ClientConfig {
    /// Creates a new `ClientConfig` pointing at the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if `endpoint` is empty or `max_stream_count` defaults
    /// would be violated (the endpoint is the only required field).
    pub fn new(endpoint: String) -> Result<Self> {
        if endpoint.is_empty() {
            return Err(Error::ConfigError("Endpoint cannot be empty".to_string()));
        }

        Ok(Self {
            endpoint,
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry_delays: DEFAULT_RETRY_DELAYS_MS.to_vec(),
            max_file_selection: DEFAULT_MAX_FILE_SELECTION,
            max_stream_count: DEFAULT_MAX_STREAM_COUNT,
            with_filename: "original".to_string(),
            on_duplicate: "prevent".to_string(),
            destination_path: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_rejects_empty_paths() {
        assert!(ServerConfig::new(PathBuf::new(), PathBuf::from("./uploads")).is_err());
        assert!(ServerConfig::new(PathBuf::from("./staging"), PathBuf::new()).is_err());
    }

    #[test]
    fn client_config_defaults() {
        let config = ClientConfig::new("http://localhost:8080/api/upload/".to_string())
            .expect("valid endpoint");
        assert_eq!(config.chunk_size, 8 * 1024 * 1024);
        assert_eq!(config.retry_delays, vec![0, 1000, 3000, 5000]);
        assert_eq!(config.max_stream_count, 8);
        assert_eq!(config.max_file_selection, 60);
        assert_eq!(config.with_filename, "original");
        assert_eq!(config.on_duplicate, "prevent");
        assert_eq!(config.destination_path, "");
    }
}
