//! Agent service: singleton candidacy, IPC listener, and idle shutdown
//!
//! Exactly one process serves a cache root at a time, enforced by an
//! exclusive bind of the lock socket (released by the kernel on process
//! death, so there is no stale-lock recovery beyond the socket-file probe).
//! Each client connection carries one request and receives a stream of
//! event lines until the terminal event.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use figc_proto::{Event, Request};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::broker::Broker;
use crate::http::HttpClient;
use crate::jobs::EnsureStream;
use crate::sweeper::run_sweeper;
use crate::AgentConfig;
use figc_io::net::Listener;

/// How often the idle watchdog samples the counters.
const IDLE_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Shared state of one agent process.
pub(crate) struct Agent {
    pub(crate) config: AgentConfig,
    pub(crate) broker: Broker,
    pub(crate) http: HttpClient,
    pub(crate) download_slots: Semaphore,
    pub(crate) counters: Counters,
    pub(crate) cancel: CancellationToken,
}

impl Agent {
    pub(crate) fn new(config: AgentConfig) -> Arc<Self> {
        Arc::new(Self {
            broker: Broker::new(),
            http: HttpClient::new(),
            download_slots: Semaphore::new(config.max_concurrent_downloads),
            counters: Counters::default(),
            cancel: CancellationToken::new(),
            config,
        })
    }
}

/// Active-client and active-job counts driving idle shutdown.
#[derive(Default)]
pub(crate) struct Counters {
    clients: AtomicUsize,
    jobs: AtomicUsize,
}

impl Counters {
    pub(crate) fn client_connected(&self) {
        self.clients.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn client_disconnected(&self) {
        self.clients.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn job_started(&self) {
        self.jobs.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn job_finished(&self) {
        self.jobs.fetch_sub(1, Ordering::SeqCst);
    }

    fn is_idle(&self) -> bool {
        self.clients.load(Ordering::SeqCst) == 0 && self.jobs.load(Ordering::SeqCst) == 0
    }
}

/// Run the agent for this configuration's cache root, if no other process
/// already owns it.
///
/// Returns `Ok(true)` after a normal idle shutdown and `Ok(false)` when
/// candidacy was lost to a live agent (clients connect to that one instead).
pub async fn run_service(config: AgentConfig) -> eyre::Result<bool> {
    let endpoints = config.endpoints();

    let Some(_lock) = Listener::bind_exclusive(&endpoints.lock).await? else {
        tracing::info!(lock = %endpoints.lock, "agent already running for this cache root");
        return Ok(false);
    };
    let listener = Listener::bind_exclusive(&endpoints.service)
        .await?
        .ok_or_else(|| {
            eyre::eyre!(
                "service endpoint {} is busy while the lock was free",
                endpoints.service
            )
        })?;

    let agent = Agent::new(config);
    tracing::info!(
        root = %agent.config.root,
        socket = %listener.path(),
        "agent started"
    );

    let sweeper = tokio::spawn(run_sweeper(agent.clone()));
    let watchdog = tokio::spawn(idle_watchdog(agent.clone()));

    let sessions = TaskTracker::new();
    loop {
        tokio::select! {
            _ = agent.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    let agent = agent.clone();
                    sessions.spawn(handle_session(agent, stream));
                }
                Err(err) => tracing::warn!(error = %err, "accept failed"),
            }
        }
    }

    // Stop accepting, drain in-flight sessions, then release both sockets
    // (the Listener drops unlink the files).
    sessions.close();
    sessions.wait().await;
    sweeper.abort();
    watchdog.abort();
    tracing::info!("agent idle, shutting down");
    Ok(true)
}

/// Cancel the service once both counters have stayed at zero for one full
/// sampling interval.
async fn idle_watchdog(agent: Arc<Agent>) {
    let mut ticker = tokio::time::interval(IDLE_SAMPLE_INTERVAL);
    // The first tick completes immediately; every later tick marks one
    // elapsed interval.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if agent.counters.is_idle() {
            tracing::debug!("idle for a full sampling interval");
            agent.cancel.cancel();
            return;
        }
    }
}

async fn handle_session(agent: Arc<Agent>, stream: UnixStream) {
    agent.counters.client_connected();
    if let Err(err) = serve_session(&agent, stream).await {
        // Clients going away mid-stream is normal; their job keeps running
        // for other subscribers.
        tracing::debug!(error = %err, "session ended with error");
    }
    agent.counters.client_disconnected();
}

async fn serve_session(agent: &Arc<Agent>, stream: UnixStream) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let Some(line) = lines.next_line().await? else {
        return Ok(());
    };

    let request = match Request::parse(&line) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(error = %err, "rejecting request");
            let event = Event::Error {
                id: String::new(),
                version: String::new(),
                message: err.to_string(),
            };
            writer.write_all(event.to_line().as_bytes()).await?;
            return writer.shutdown().await;
        }
    };

    let Request::Ensure { id, version } = request;
    tracing::debug!(id = %id, version = %version, "ensure request");

    match agent.ensure_stream(&id, &version).await {
        EnsureStream::Cached(path) => {
            let hit = Event::Hit {
                id: id.clone(),
                version: version.clone(),
                path: path.clone(),
            };
            let completed = Event::Completed { id, version, path };
            writer.write_all(hit.to_line().as_bytes()).await?;
            writer.write_all(completed.to_line().as_bytes()).await?;
        }
        EnsureStream::Live(mut rx) => loop {
            match rx.recv().await {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    writer.write_all(event.to_line().as_bytes()).await?;
                    if terminal {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "subscriber lagged; dropped oldest events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        },
    }

    writer.shutdown().await
}
