//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use std::path::PathBuf;
use std::time::Duration;

/// Default base URL of the sync service.
pub const DEFAULT_BASE_URL: &str = "https://sync.ankiweb.net/";

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Collection sync endpoint prefix (methods are appended).
    pub sync_url: String,
    /// Media sync endpoint prefix.
    pub media_url: String,
    /// Host key from a previous login, if any.
    pub host_key: Option<String>,
    /// Client version string sent with `meta`.
    pub client_version: String,
    /// Rows per uploaded chunk.
    pub chunk_size: usize,
    /// Gzip level for request payloads; 0 disables compression.
    pub compression_level: u32,
    /// Copy buffer size for request and response bodies.
    pub buffer_size: usize,
    /// Byte granularity of progress callbacks.
    pub progress_granularity: u64,
    /// Largest accepted clock difference.
    pub clock_skew_tolerance: Duration,
    /// Files per `downloadFiles` batch.
    pub media_download_batch: usize,
    /// Files per uploaded media zip.
    pub media_upload_files: usize,
    /// Uncompressed bytes per uploaded media zip.
    pub media_upload_bytes: u64,
    /// Media sync restarts allowed after a usn race.
    pub max_media_restarts: u32,
    /// Request timeout.
    pub timeout: Duration,
    /// Directory for scratch files; the system temp dir when `None`.
    pub scratch_dir: Option<PathBuf>,
}

impl SyncConfig {
    /// Creates a configuration for the service at `base_url`.
    ///
    /// The collection endpoint is `<base>sync/`, the media endpoint `<base>msync/`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base = base_url.into();
        if !base.ends_with('/') {
            base.push('/');
        }
        Self {
            sync_url: format!("{base}sync/"),
            media_url: format!("{base}msync/"),
            host_key: None,
            client_version: format!("flashsync,{},{}", env!("CARGO_PKG_VERSION"), std::env::consts::OS),
            chunk_size: 2500,
            compression_level: 6,
            buffer_size: 64 * 1024,
            progress_granularity: 1024,
            clock_skew_tolerance: Duration::from_secs(300),
            media_download_batch: 25,
            media_upload_files: 25,
            media_upload_bytes: 2_621_440,
            max_media_restarts: 3,
            timeout: Duration::from_secs(60),
            scratch_dir: None,
        }
    }

    /// Sets the collection endpoint.
    pub fn with_sync_url(mut self, url: impl Into<String>) -> Self {
        self.sync_url = url.into();
        self
    }

    /// Sets the media endpoint.
    pub fn with_media_url(mut self, url: impl Into<String>) -> Self {
        self.media_url = url.into();
        self
    }

    /// Sets the host key.
    pub fn with_host_key(mut self, key: impl Into<String>) -> Self {
        self.host_key = Some(key.into());
        self
    }

    /// Sets the client version string.
    pub fn with_client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = version.into();
        self
    }

    /// Sets the upload chunk size.
    pub fn with_chunk_size(mut self, rows: usize) -> Self {
        self.chunk_size = rows;
        self
    }

    /// Sets the gzip level.
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }

    /// Sets the copy buffer size.
    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    /// Sets the progress granularity.
    pub fn with_progress_granularity(mut self, bytes: u64) -> Self {
        self.progress_granularity = bytes;
        self
    }

    /// Sets the clock skew tolerance.
    pub fn with_clock_skew_tolerance(mut self, tolerance: Duration) -> Self {
        self.clock_skew_tolerance = tolerance;
        self
    }

    /// Sets the media download batch size.
    pub fn with_media_download_batch(mut self, files: usize) -> Self {
        self.media_download_batch = files;
        self
    }

    /// Sets the media upload limits.
    pub fn with_media_upload_limits(mut self, files: usize, bytes: u64) -> Self {
        self.media_upload_files = files;
        self.media_upload_bytes = bytes;
        self
    }

    /// Sets the media restart cap.
    pub fn with_max_media_restarts(mut self, restarts: u32) -> Self {
        self.max_media_restarts = restarts;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the scratch directory.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Rejects empty endpoints and zero sizes.
    pub fn validate(&self) -> SyncResult<()> {
        if self.sync_url.is_empty() || self.media_url.is_empty() {
            return Err(SyncError::Protocol("sync endpoints must not be empty".into()));
        }
        let sizes = [
            ("chunk_size", self.chunk_size as u64),
            ("buffer_size", self.buffer_size as u64),
            ("progress_granularity", self.progress_granularity),
            ("media_download_batch", self.media_download_batch as u64),
            ("media_upload_files", self.media_upload_files as u64),
            ("media_upload_bytes", self.media_upload_bytes),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(SyncError::Protocol(format!("{name} must be greater than zero")));
        }
        if self.compression_level > 9 {
            return Err(SyncError::Protocol(format!(
                "compression level {} out of range",
                self.compression_level
            )));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}
