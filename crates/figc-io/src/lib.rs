//! Common I/O utilities for figc crates
//!
//! Staging-directory lifecycle and the atomic rename that publishes a
//! package directory, plus path/key derivation (`paths`) and Unix-socket
//! plumbing (`net`).

pub mod net;
pub mod paths;

use camino::{Utf8Path, Utf8PathBuf};
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Outcome of promoting a staging directory to its final name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// Our rename landed; the final directory is ours.
    Published,
    /// A concurrent writer published first; our staging copy was discarded.
    Lost,
}

/// Create an exclusively owned staging directory `{key}.tmp-<random>` as a
/// sibling of the final directory.
///
/// The random suffix lets concurrent losers coexist without collision; any
/// that are abandoned are picked up by the stale-staging sweeper.
pub fn create_staging_dir(packages_dir: &Utf8Path, key: &str) -> std::io::Result<Utf8PathBuf> {
    std::fs::create_dir_all(packages_dir)?;
    loop {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let path = packages_dir.join(format!("{key}.tmp-{suffix}"));
        match std::fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Atomically publish a fully populated staging directory under its final
/// name.
///
/// Rename is atomic for sibling directories on one filesystem, so observers
/// see the final directory appear fully populated or not at all. If the
/// rename fails and the final directory exists, another writer won the race:
/// the staging copy is deleted and the outcome is still success.
pub fn promote_staging(staging: &Utf8Path, final_dir: &Utf8Path) -> std::io::Result<Promotion> {
    match std::fs::rename(staging, final_dir) {
        Ok(()) => Ok(Promotion::Published),
        Err(err) => {
            if final_dir.is_dir() {
                remove_staging(staging);
                Ok(Promotion::Lost)
            } else {
                Err(err)
            }
        }
    }
}

/// Best-effort staging removal; failures are left to the sweeper.
pub fn remove_staging(staging: &Utf8Path) {
    if let Err(err) = std::fs::remove_dir_all(staging) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = %staging, error = %err, "failed to remove staging directory");
        }
    }
}
