//! Unix-socket plumbing for the agent endpoints.
//!
//! Both endpoints are Unix sockets whose names derive from the cache root
//! (see [`crate::paths::endpoint_names`]). The lock socket is the singleton
//! rendezvous: binding it exclusively makes this process the agent for that
//! root, and the kernel releases it unconditionally on process death. A
//! leftover socket *file* from a crash is detected by a probe connect.

use std::io;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use tokio::net::{UnixListener, UnixStream};

/// A bound endpoint. The socket file is unlinked on drop.
pub struct Listener {
    inner: UnixListener,
    path: Utf8PathBuf,
}

impl Listener {
    /// Bind `path` exclusively.
    ///
    /// Returns `Ok(None)` when a live process already owns the name. A stale
    /// socket file (its owner died without unlinking) is removed and the
    /// bind retried once; losing that retry race also yields `Ok(None)`.
    pub async fn bind_exclusive(path: &Utf8Path) -> io::Result<Option<Listener>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match UnixListener::bind(path) {
            Ok(inner) => Ok(Some(Listener {
                inner,
                path: path.to_owned(),
            })),
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                match UnixStream::connect(path).await {
                    // Someone answered: the name has a live owner.
                    Ok(_) => Ok(None),
                    Err(probe)
                        if matches!(
                            probe.kind(),
                            io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
                        ) =>
                    {
                        tracing::debug!(path = %path, "removing stale socket file");
                        match std::fs::remove_file(path) {
                            Ok(()) => {}
                            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                            Err(e) => return Err(e),
                        }
                        match UnixListener::bind(path) {
                            Ok(inner) => Ok(Some(Listener {
                                inner,
                                path: path.to_owned(),
                            })),
                            Err(e) if e.kind() == io::ErrorKind::AddrInUse => Ok(None),
                            Err(e) => Err(e),
                        }
                    }
                    Err(probe) => Err(probe),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Accept one client connection.
    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.inner.accept().await?;
        Ok(stream)
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Connect to a service endpoint, retrying briefly while the service
/// finishes startup. Gives up once `deadline` has elapsed; the final
/// connect error distinguishes a missing service from anything else.
pub async fn connect_with_retry(path: &Utf8Path, deadline: Duration) -> io::Result<UnixStream> {
    let start = Instant::now();
    let backoff_ms: [u64; 6] = [10, 25, 50, 100, 250, 500];
    let mut attempt = 0usize;
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
                ) =>
            {
                if start.elapsed() >= deadline {
                    return Err(err);
                }
                let delay = backoff_ms[attempt.min(backoff_ms.len() - 1)];
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
