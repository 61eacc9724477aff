//! Download and verification pipeline
//!
//! Streams the tarball into the staging directory while hashing
//! incrementally, verifies SRI and/or shasum with constant-time comparison,
//! then hands the file to the extractor. Verification happens strictly
//! before extraction.

use camino::Utf8Path;
use http_body_util::BodyExt;
use hyper::header;
use sha1::Sha1;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use base64::prelude::*;

use crate::jobs::JobCtx;
use crate::resolve::ResolvedPackage;
use crate::service::Agent;
use crate::JobError;

pub(crate) const TARBALL_FILENAME: &str = "package.tgz";

const DOWNLOAD_ACCEPT: &str = "application/octet-stream, application/gzip, */*";

/// Digests the registry advertised for the tarball, decoded up front so a
/// malformed integrity string fails before any bytes move.
#[derive(Debug)]
struct ExpectedDigests {
    sha512: Option<Vec<u8>>,
    sha1: Option<Vec<u8>>,
}

impl Agent {
    /// Fetch the resolved tarball into `staging`, verify it, and extract it
    /// there. On success the staging directory holds the full package tree
    /// (plus `package.tgz` when tarball retention is on).
    pub(crate) async fn fetch_verify_extract(
        &self,
        ctx: &JobCtx,
        staging: &Utf8Path,
        resolved: &ResolvedPackage,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let expected = parse_expected_digests(resolved)?;
        if expected.sha512.is_none() && expected.sha1.is_none() {
            tracing::warn!(
                key = %ctx.key,
                registry = %resolved.registry,
                "no integrity metadata available; proceeding without verification"
            );
            self.broker.publish(
                &ctx.key,
                ctx.progress(format!(
                    "warning: no integrity metadata from {}; skipping verification",
                    resolved.registry
                )),
            );
        }

        let tarball = staging.join(TARBALL_FILENAME);
        tokio::time::timeout(
            self.config.http_timeout,
            self.download_tarball(ctx, &tarball, resolved, &expected, cancel),
        )
        .await
        .map_err(|_elapsed| {
            JobError::Download(format!("{}: request timed out", resolved.tarball_url))
        })??;

        figc_tarball::extract(tarball.clone(), staging.to_owned(), cancel.clone())
            .await
            .map_err(|err| match err {
                figc_tarball::TarballError::Cancelled => JobError::Cancelled,
                other => JobError::Archive(other),
            })?;

        if !self.config.preserve_tarballs {
            tokio::fs::remove_file(&tarball).await?;
        }
        Ok(())
    }

    async fn download_tarball(
        &self,
        ctx: &JobCtx,
        tarball: &Utf8Path,
        resolved: &ResolvedPackage,
        expected: &ExpectedDigests,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let response = self
            .http
            .get(&resolved.tarball_url, DOWNLOAD_ACCEPT)
            .await
            .map_err(|err| JobError::Download(format!("{}: {err}", resolved.tarball_url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(JobError::Download(format!(
                "{}: HTTP {}",
                resolved.tarball_url,
                status.as_u16()
            )));
        }

        let total = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let message = match total {
            Some(bytes) => format!("downloading {bytes} bytes from {}", resolved.registry),
            None => format!("downloading from {}", resolved.registry),
        };
        self.broker.publish(&ctx.key, ctx.progress(message));

        let mut sha512 = expected.sha512.as_ref().map(|_| Sha512::new());
        let mut sha1 = expected.sha1.as_ref().map(|_| Sha1::new());
        let mut written: u64 = 0;

        let mut file = tokio::fs::File::create(tarball).await?;
        let mut body = response.into_body();
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Err(JobError::Cancelled),
                frame = body.frame() => frame,
            };
            let Some(frame) = frame else { break };
            let frame = frame
                .map_err(|err| JobError::Download(format!("{}: {err}", resolved.tarball_url)))?;
            if let Ok(data) = frame.into_data() {
                file.write_all(&data).await?;
                written += data.len() as u64;
                if let Some(hasher) = sha512.as_mut() {
                    hasher.update(&data);
                }
                if let Some(hasher) = sha1.as_mut() {
                    hasher.update(&data);
                }
            }
        }
        file.flush().await?;
        tracing::debug!(key = %ctx.key, bytes = written, "tarball downloaded");

        if let (Some(hasher), Some(want)) = (sha512, expected.sha512.as_ref()) {
            let got = hasher.finalize();
            if !bool::from(got.as_slice().ct_eq(want.as_slice())) {
                return Err(JobError::Integrity(format!(
                    "sha512 mismatch for {}: expected {}, got {}",
                    resolved.tarball_url,
                    hex::encode(want),
                    hex::encode(got)
                )));
            }
        }
        if let (Some(hasher), Some(want)) = (sha1, expected.sha1.as_ref()) {
            let got = hasher.finalize();
            if !bool::from(got.as_slice().ct_eq(want.as_slice())) {
                return Err(JobError::Integrity(format!(
                    "sha1 mismatch for {}: expected {}, got {}",
                    resolved.tarball_url,
                    hex::encode(want),
                    hex::encode(got)
                )));
            }
        }
        Ok(())
    }
}

fn parse_expected_digests(resolved: &ResolvedPackage) -> Result<ExpectedDigests, JobError> {
    let mut sha512 = None;
    if let Some(integrity) = &resolved.integrity {
        match integrity.strip_prefix("sha512-") {
            Some(encoded) => {
                let bytes = BASE64_STANDARD.decode(encoded).map_err(|err| {
                    JobError::Integrity(format!("malformed sha512 integrity string: {err}"))
                })?;
                if bytes.len() != 64 {
                    return Err(JobError::Integrity(format!(
                        "sha512 integrity digest has {} bytes, expected 64",
                        bytes.len()
                    )));
                }
                sha512 = Some(bytes);
            }
            None => {
                tracing::warn!(integrity = %integrity, "unsupported integrity algorithm; ignoring");
            }
        }
    }

    let mut sha1 = None;
    if let Some(shasum) = &resolved.shasum {
        let bytes = hex::decode(shasum)
            .map_err(|err| JobError::Integrity(format!("malformed shasum: {err}")))?;
        if bytes.len() != 20 {
            return Err(JobError::Integrity(format!(
                "shasum has {} bytes, expected 20",
                bytes.len()
            )));
        }
        sha1 = Some(bytes);
    }

    Ok(ExpectedDigests { sha512, sha1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(integrity: Option<&str>, shasum: Option<&str>) -> ResolvedPackage {
        ResolvedPackage {
            tarball_url: "https://cdn.example/pkg.tgz".to_string(),
            registry: "https://packages.example".to_string(),
            integrity: integrity.map(str::to_string),
            shasum: shasum.map(str::to_string),
        }
    }

    #[test]
    fn valid_sri_decodes_to_64_bytes() {
        let digest: Vec<u8> = Sha512::digest(b"payload").to_vec();
        let sri = format!("sha512-{}", BASE64_STANDARD.encode(&digest));
        let expected = parse_expected_digests(&resolved(Some(&sri), None)).unwrap();
        assert_eq!(expected.sha512.as_deref(), Some(digest.as_slice()));
        assert!(expected.sha1.is_none());
    }

    #[test]
    fn malformed_sri_is_an_integrity_error() {
        let err = parse_expected_digests(&resolved(Some("sha512-!!!not-base64"), None)).unwrap_err();
        assert!(matches!(err, JobError::Integrity(_)));
    }

    #[test]
    fn truncated_sri_digest_is_an_integrity_error() {
        let sri = format!("sha512-{}", BASE64_STANDARD.encode(b"short"));
        let err = parse_expected_digests(&resolved(Some(&sri), None)).unwrap_err();
        assert!(matches!(err, JobError::Integrity(_)));
    }

    #[test]
    fn unsupported_sri_algorithm_is_ignored() {
        let expected =
            parse_expected_digests(&resolved(Some("sha256-AAAA"), None)).unwrap();
        assert!(expected.sha512.is_none());
    }

    #[test]
    fn valid_shasum_decodes_to_20_bytes() {
        let digest: Vec<u8> = Sha1::digest(b"payload").to_vec();
        let expected =
            parse_expected_digests(&resolved(None, Some(&hex::encode(&digest)))).unwrap();
        assert_eq!(expected.sha1.as_deref(), Some(digest.as_slice()));
    }

    #[test]
    fn malformed_shasum_is_an_integrity_error() {
        let err = parse_expected_digests(&resolved(None, Some("zzzz"))).unwrap_err();
        assert!(matches!(err, JobError::Integrity(_)));
    }
}
