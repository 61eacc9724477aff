//! figc-agent: the download coordinator
//!
//! One agent process owns a cache root at a time (singleton via a named
//! Unix-socket rendezvous) and serves any number of local clients over a
//! newline-JSON protocol. Concurrent requests for the same package converge
//! on a single download; results are verified, extracted safely, and
//! published with an atomic rename.
//!
//! Library callers use [`client::ensure_with`]; the CLI is a thin wrapper
//! over the same path.

pub(crate) mod broker;
pub mod client;
pub(crate) mod download;
pub(crate) mod http;
pub(crate) mod jobs;
pub(crate) mod resolve;
pub mod service;
pub(crate) mod sweeper;

use std::time::Duration;

use camino::Utf8PathBuf;
use figc_io::paths::{default_pipe_base, endpoint_names, EndpointNames};

pub use service::run_service;

/// Registries tried in order when none are configured.
pub const DEFAULT_REGISTRIES: [&str; 2] = [
    "https://packages.fhir.org",
    "https://packages2.fhir.org/packages",
];

/// Agent configuration for one cache root.
///
/// `root` must already be normalized (see [`figc_io::paths::normalize_root`])
/// so that endpoint names derived from it are stable across processes.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Normalized cache root; packages live under `{root}/packages/`.
    pub root: Utf8PathBuf,
    /// Base name for the IPC endpoints.
    pub pipe_base: String,
    /// Ordered registry base URLs.
    pub registries: Vec<String>,
    /// Download/extract slots; resolution does not hold one.
    pub max_concurrent_downloads: usize,
    /// Keep `package.tgz` in the published directory.
    pub preserve_tarballs: bool,
    /// Ceiling for any single HTTP request.
    pub http_timeout: Duration,
    /// Additional resolution attempts after the first failure.
    pub max_retries: u32,
    /// Base delay for resolution retry backoff.
    pub retry_delay: Duration,
}

impl AgentConfig {
    /// Defaults for a normalized root.
    pub fn for_root(root: Utf8PathBuf) -> Self {
        Self {
            root,
            pipe_base: default_pipe_base(),
            registries: DEFAULT_REGISTRIES.iter().map(|s| s.to_string()).collect(),
            max_concurrent_downloads: 4,
            preserve_tarballs: false,
            http_timeout: Duration::from_secs(600),
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn packages_dir(&self) -> Utf8PathBuf {
        self.root.join("packages")
    }

    pub fn endpoints(&self) -> EndpointNames {
        endpoint_names(&self.pipe_base, &self.root)
    }
}

/// Why a job failed. The message becomes the terminal `error` event for
/// every subscriber of the job's key.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("resolution failed: {}", reasons.join("; "))]
    Resolution { reasons: Vec<String> },

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error(transparent)]
    Archive(#[from] figc_tarball::TarballError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("job cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AgentConfig::for_root(Utf8PathBuf::from("/cache"));
        assert_eq!(config.max_concurrent_downloads, 4);
        assert_eq!(config.http_timeout, Duration::from_secs(600));
        assert_eq!(config.max_retries, 2);
        assert!(!config.preserve_tarballs);
        assert_eq!(config.registries.len(), 2);
        assert_eq!(config.packages_dir(), Utf8PathBuf::from("/cache/packages"));
    }

    #[test]
    fn resolution_error_concatenates_reasons() {
        let err = JobError::Resolution {
            reasons: vec![
                "https://a.example: HTTP 404".to_string(),
                "https://b.example: HTTP 500".to_string(),
            ],
        };
        assert_eq!(
            err.to_string(),
            "resolution failed: https://a.example: HTTP 404; https://b.example: HTTP 500"
        );
    }
}
