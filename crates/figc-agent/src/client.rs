//! Client facade
//!
//! `ensure_with` is the single entry point for both the CLI and in-process
//! library callers: it makes this process a service candidate (so a cold
//! start needs no separate daemon), connects to whichever process won, and
//! streams the job's events back through a callback.

use std::time::Duration;

use camino::Utf8PathBuf;
use figc_io::net::connect_with_retry;
use figc_io::paths::package_key;
use figc_proto::{Event, Request};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::service::run_service;
use crate::AgentConfig;

/// Ceiling for connecting to the service socket, covering agent startup.
const CONNECT_DEADLINE: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to agent: {0}")]
    Connect(#[source] std::io::Error),

    #[error("agent connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid event from agent: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("{0}")]
    Job(String),

    #[error("agent closed the stream without a terminal event")]
    Truncated,
}

/// Ensure an extracted, verified copy of `id@version` exists under the
/// configured cache root and return its absolute path.
///
/// `on_event` observes every event for the request, including the synthetic
/// `hit`/`completed` pair when the package is already published.
pub async fn ensure_with<F>(
    config: AgentConfig,
    id: &str,
    version: &str,
    mut on_event: F,
) -> Result<Utf8PathBuf, ClientError>
where
    F: FnMut(&Event),
{
    // Fast path: a published directory is complete by construction, no IPC
    // needed to use it.
    let final_dir = config.packages_dir().join(package_key(id, version));
    if final_dir.is_dir() {
        let hit = Event::Hit {
            id: id.to_string(),
            version: version.to_string(),
            path: final_dir.clone(),
        };
        let completed = Event::Completed {
            id: id.to_string(),
            version: version.to_string(),
            path: final_dir.clone(),
        };
        on_event(&hit);
        on_event(&completed);
        return Ok(final_dir);
    }

    // Service candidacy: either this task becomes the agent for the root or
    // it returns quickly because another process already owns it.
    let endpoints = config.endpoints();
    let service = tokio::spawn(run_service(config));

    let outcome = ensure_over_socket(&endpoints.service, id, version, &mut on_event).await;

    // If this process won candidacy, wait for its idle shutdown so jobs
    // started on behalf of other clients are not killed by our exit.
    match service.await {
        Ok(Ok(_served)) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "agent task ended with error"),
        Err(err) => tracing::warn!(error = %err, "agent task panicked"),
    }

    outcome
}

async fn ensure_over_socket<F>(
    socket: &camino::Utf8Path,
    id: &str,
    version: &str,
    on_event: &mut F,
) -> Result<Utf8PathBuf, ClientError>
where
    F: FnMut(&Event),
{
    let stream = connect_with_retry(socket, CONNECT_DEADLINE)
        .await
        .map_err(ClientError::Connect)?;
    let (reader, mut writer) = stream.into_split();

    let request = Request::Ensure {
        id: id.to_string(),
        version: version.to_string(),
    };
    writer.write_all(request.to_line().as_bytes()).await?;
    writer.flush().await?;

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line)?;
        on_event(&event);
        match event {
            Event::Completed { path, .. } => return Ok(path),
            Event::Error { message, .. } => return Err(ClientError::Job(message)),
            _ => {}
        }
    }
    Err(ClientError::Truncated)
}
