//! Registry resolution
//!
//! Tries the configured registries in order for `GET {base}/{id}/{version}`.
//! A JSON response is a manifest whose `dist` block names the tarball; any
//! other content type means the URL itself serves the tarball. The whole
//! pass retries with exponential backoff and jitter.

use std::time::Duration;

use http_body_util::BodyExt;
use hyper::header;
use rand::Rng;
use url::Url;

use crate::service::Agent;
use crate::JobError;

pub(crate) const RESOLVE_ACCEPT: &str =
    "application/json, application/octet-stream, application/gzip, */*";

const JITTER_CEILING_MS: u64 = 200;

/// Where a package's tarball lives and how to verify it. Immutable once
/// produced; at most one exists per job.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedPackage {
    pub tarball_url: String,
    /// Originating registry base, for diagnostics.
    pub registry: String,
    /// SRI string of the form `sha512-<base64>`.
    pub integrity: Option<String>,
    /// Hex-encoded sha1 of the tarball bytes.
    pub shasum: Option<String>,
}

impl Agent {
    /// Resolve `id@version` against the ordered registries, retrying the
    /// whole pass up to `max_retries` additional times. Per-registry
    /// failure reasons accumulate into the final error.
    pub(crate) async fn resolve_package(
        &self,
        id: &str,
        version: &str,
    ) -> Result<ResolvedPackage, JobError> {
        let attempts = self.config.max_retries + 1;
        let mut reasons: Vec<String> = Vec::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                let backoff = self.config.retry_delay * 2u32.pow(attempt - 2);
                let jitter =
                    Duration::from_millis(rand::thread_rng().gen_range(0..=JITTER_CEILING_MS));
                tracing::debug!(
                    attempt,
                    backoff_ms = (backoff + jitter).as_millis() as u64,
                    "retrying resolution"
                );
                tokio::time::sleep(backoff + jitter).await;
            }
            if let Some(resolved) = self.resolve_attempt(id, version, &mut reasons).await {
                tracing::info!(
                    id,
                    version,
                    registry = %resolved.registry,
                    tarball = %resolved.tarball_url,
                    "resolved package"
                );
                return Ok(resolved);
            }
        }

        Err(JobError::Resolution { reasons })
    }

    /// One pass over all registries in order.
    async fn resolve_attempt(
        &self,
        id: &str,
        version: &str,
        reasons: &mut Vec<String>,
    ) -> Option<ResolvedPackage> {
        for base in &self.config.registries {
            let manifest_url = format!("{}/{}/{}", base.trim_end_matches('/'), id, version);

            let response = match tokio::time::timeout(
                self.config.http_timeout,
                self.http.get(&manifest_url, RESOLVE_ACCEPT),
            )
            .await
            {
                Err(_elapsed) => {
                    reasons.push(format!("{base}: request timed out"));
                    continue;
                }
                Ok(Err(err)) => {
                    reasons.push(format!("{base}: {err}"));
                    continue;
                }
                Ok(Ok(response)) => response,
            };

            let status = response.status();
            if status.as_u16() >= 400 {
                reasons.push(format!("{base}: HTTP {}", status.as_u16()));
                continue;
            }

            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_ascii_lowercase();

            if !content_type.contains("json") {
                // The registry answered with the tarball directly; no
                // integrity metadata is available in this mode.
                return Some(ResolvedPackage {
                    tarball_url: manifest_url,
                    registry: base.clone(),
                    integrity: None,
                    shasum: None,
                });
            }

            let body = match response.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(err) => {
                    reasons.push(format!("{base}: {err}"));
                    continue;
                }
            };

            match parse_manifest(&body, &manifest_url, version) {
                Ok((tarball_url, integrity, shasum)) => {
                    return Some(ResolvedPackage {
                        tarball_url,
                        registry: base.clone(),
                        integrity,
                        shasum,
                    });
                }
                Err(reason) => {
                    reasons.push(format!("{base}: {reason}"));
                    continue;
                }
            }
        }
        None
    }
}

/// Pull `(tarball, integrity, shasum)` out of a registry manifest.
///
/// Prefers a top-level `dist`, falling back to `versions[version].dist`.
/// A relative tarball URL resolves against the manifest URL; anything
/// `Url::join` rejects is a resolution failure rather than a guess.
fn parse_manifest(
    body: &[u8],
    manifest_url: &str,
    version: &str,
) -> Result<(String, Option<String>, Option<String>), String> {
    let manifest: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid manifest JSON: {e}"))?;

    let dist = manifest
        .get("dist")
        .filter(|d| d.is_object())
        .or_else(|| {
            manifest
                .get("versions")
                .and_then(|versions| versions.get(version))
                .and_then(|entry| entry.get("dist"))
        })
        .ok_or_else(|| "manifest missing dist.tarball".to_string())?;

    let tarball = dist
        .get("tarball")
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| "manifest missing dist.tarball".to_string())?;

    let resolved = Url::parse(manifest_url)
        .and_then(|base| base.join(tarball))
        .map_err(|e| format!("unresolvable tarball URL {tarball}: {e}"))?;

    let integrity = dist
        .get("integrity")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let shasum = dist
        .get("shasum")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Ok((resolved.to_string(), integrity, shasum))
}
