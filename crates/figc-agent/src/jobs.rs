//! Deduplicating job registry and the job runner
//!
//! At most one job runs per package key. New requests for a key with a
//! running job attach to its event stream; requests for an already
//! published package short-circuit on the filesystem check. The runner owns
//! the whole pipeline: resolve, throttled download, verify, extract,
//! atomic publish.

use std::sync::Arc;
use std::time::Instant;

use camino::Utf8PathBuf;
use figc_io::paths::package_key;
use figc_io::Promotion;
use figc_proto::Event;
use tokio::sync::broadcast;

use crate::service::Agent;
use crate::JobError;

/// The identity a job publishes events under.
pub(crate) struct JobCtx {
    pub key: String,
    pub id: String,
    pub version: String,
}

impl JobCtx {
    pub(crate) fn progress(&self, message: String) -> Event {
        Event::Progress {
            id: self.id.clone(),
            version: self.version.clone(),
            message,
        }
    }

    fn start(&self) -> Event {
        Event::Start {
            id: self.id.clone(),
            version: self.version.clone(),
        }
    }

    fn hit(&self, path: Utf8PathBuf) -> Event {
        Event::Hit {
            id: self.id.clone(),
            version: self.version.clone(),
            path,
        }
    }

    fn completed(&self, path: Utf8PathBuf) -> Event {
        Event::Completed {
            id: self.id.clone(),
            version: self.version.clone(),
            path,
        }
    }

    fn error(&self, message: String) -> Event {
        Event::Error {
            id: self.id.clone(),
            version: self.version.clone(),
            message,
        }
    }
}

/// What a subscriber gets back from the registry.
pub(crate) enum EnsureStream {
    /// The package was already published; no job involved.
    Cached(Utf8PathBuf),
    /// Attached to a running (possibly just-started) job.
    Live(broadcast::Receiver<Event>),
}

impl Agent {
    /// Attach to the job for `(id, version)`, starting one if needed.
    pub(crate) async fn ensure_stream(self: &Arc<Self>, id: &str, version: &str) -> EnsureStream {
        let key = package_key(id, version);
        let final_dir = self.config.packages_dir().join(&key);
        if final_dir.is_dir() {
            tracing::debug!(key = %key, "cache hit");
            return EnsureStream::Cached(final_dir);
        }

        let (rx, created) = self.broker.subscribe_or_create(&key);
        if created {
            let agent = Arc::clone(self);
            let ctx = JobCtx {
                key,
                id: id.to_string(),
                version: version.to_string(),
            };
            self.counters.job_started();
            tokio::spawn(async move {
                agent.clone().run_job(ctx).await;
                agent.counters.job_finished();
            });
        } else {
            tracing::debug!(id, version, "attached to in-flight job");
        }
        EnsureStream::Live(rx)
    }

    /// Drive one job to its terminal event.
    async fn run_job(self: Arc<Self>, ctx: JobCtx) {
        let started = Instant::now();
        let terminal = match self.execute_job(&ctx).await {
            Ok(path) => {
                tracing::info!(
                    key = %ctx.key,
                    path = %path,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "package ready"
                );
                ctx.completed(path)
            }
            Err(err) => {
                match &err {
                    JobError::Cancelled => {
                        tracing::debug!(key = %ctx.key, "job cancelled")
                    }
                    JobError::Download(reason) => {
                        tracing::warn!(key = %ctx.key, reason = %reason, "job failed")
                    }
                    other => tracing::error!(key = %ctx.key, error = %other, "job failed"),
                }
                ctx.error(err.to_string())
            }
        };
        // Terminal publish and job removal are atomic with respect to new
        // subscribers; see Broker::finish.
        self.broker.finish(&ctx.key, terminal);
    }

    async fn execute_job(&self, ctx: &JobCtx) -> Result<Utf8PathBuf, JobError> {
        let packages = self.config.packages_dir();
        let final_dir = packages.join(&ctx.key);

        // Another agent on a different cache-root view, or a previous job,
        // may have published while this request was queued.
        if final_dir.is_dir() {
            self.broker.publish(&ctx.key, ctx.hit(final_dir.clone()));
            return Ok(final_dir);
        }

        self.broker.publish(&ctx.key, ctx.start());
        let resolved = self.resolve_package(&ctx.id, &ctx.version).await?;

        // Only the body transfer and extraction hold a download slot;
        // resolution above runs unthrottled.
        let _permit = self
            .download_slots
            .acquire()
            .await
            .map_err(|_closed| JobError::Cancelled)?;

        let cancel = self.cancel.child_token();
        let staging = figc_io::create_staging_dir(&packages, &ctx.key)?;
        if let Err(err) = self
            .fetch_verify_extract(ctx, &staging, &resolved, &cancel)
            .await
        {
            figc_io::remove_staging(&staging);
            return Err(err);
        }

        match figc_io::promote_staging(&staging, &final_dir) {
            Ok(Promotion::Published) => {
                tracing::debug!(key = %ctx.key, "published package directory")
            }
            Ok(Promotion::Lost) => {
                tracing::debug!(key = %ctx.key, "lost publish race; using existing directory")
            }
            Err(err) => {
                figc_io::remove_staging(&staging);
                return Err(err.into());
            }
        }
        Ok(final_dir)
    }
}
