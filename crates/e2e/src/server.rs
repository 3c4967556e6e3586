//! Ephemeral HTTP file servers for the boot image and the payload

use axum::Router;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::{PortRanges, Timings};
use crate::error::{E2eError, E2eResult};
use crate::port::find_free_port;

/// Handle to a running static file server.
///
/// The server has no shutdown trigger of its own; it runs until [`stop`]
/// is called or the handle is dropped.
///
/// [`stop`]: FileServer::stop
pub struct FileServer {
    root: PathBuf,
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl FileServer {
    /// Serve `root` on the first free port from `ports.http_start` and wait
    /// until it answers HTTP requests.
    pub async fn start(
        root: &Path,
        bind: &str,
        ports: &PortRanges,
        timings: &Timings,
    ) -> E2eResult<Self> {
        if !root.is_dir() {
            return Err(E2eError::missing_file(root, "cannot serve a missing directory"));
        }
        let ip: IpAddr = bind
            .parse()
            .map_err(|e| E2eError::Config(format!("invalid bind address '{}': {}", bind, e)))?;

        let (listener, port) = bind_free_port(ip, ports).await?;
        info!("Serving {} on port {}", root.display(), port);

        let app = Router::new()
            .fallback_service(ServeDir::new(root))
            .layer(TraceLayer::new_for_http());
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async {
                let _ = rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!("File server on port {} exited: {}", port, e);
            }
        });

        let server = FileServer {
            root: root.to_path_buf(),
            port,
            shutdown: Some(tx),
            task: Some(task),
        };

        wait_for_http(port, timings.http_ready_timeout(), timings.http_poll_interval()).await?;
        Ok(server)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// URL of `name` under the served root, as reachable from `host`
    pub fn url_for(&self, host: &str, name: &str) -> String {
        format!("http://{}:{}/{}", host, self.port, name)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Stop the server. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            debug!("Stopping file server on port {}", self.port);
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for FileServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Probe for a free port and bind it, moving on if another process wins the race.
async fn bind_free_port(ip: IpAddr, ports: &PortRanges) -> E2eResult<(TcpListener, u16)> {
    let end = ports.http_start as u32 + ports.max_attempts as u32;
    let mut start = ports.http_start;

    loop {
        let remaining = end.saturating_sub(start as u32).min(u16::MAX as u32) as u16;
        // readiness is checked on localhost, so that is where clashes show up
        let found = tokio::task::spawn_blocking(move || {
            find_free_port(IpAddr::V4(Ipv4Addr::LOCALHOST), start, remaining)
        })
        .await
        .map_err(|e| E2eError::ServerStartup(format!("port probe panicked: {}", e)))?;
        let port = found.map_err(|_| E2eError::PortsExhausted {
            start: ports.http_start,
            attempts: ports.max_attempts,
        })?;

        match TcpListener::bind((ip, port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                warn!("Port {} was taken before bind, probing further", port);
                start = port.checked_add(1).ok_or(E2eError::PortsExhausted {
                    start: ports.http_start,
                    attempts: ports.max_attempts,
                })?;
            }
            Err(e) => {
                return Err(E2eError::ServerStartup(format!(
                    "failed to bind {}:{}: {}",
                    ip, port, e
                )))
            }
        }
    }
}

/// Poll `http://localhost:<port>/` until any HTTP response arrives.
///
/// Fails with [`E2eError::Timeout`] once `timeout` has elapsed.
pub async fn wait_for_http(port: u16, timeout: Duration, interval: Duration) -> E2eResult<()> {
    let url = format!("http://127.0.0.1:{}/", port);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()?;

    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match client.get(&url).send().await {
            Ok(resp) => {
                debug!("HTTP server on port {} answered {} after {} attempt(s)", port, resp.status(), attempts);
                return Ok(());
            }
            Err(e) => {
                if attempts == 1 {
                    info!("Waiting for HTTP server on port {}...", port);
                }
                // Connection refused is expected while the server is starting
                if !e.is_connect() {
                    warn!("Readiness check error: {}", e);
                }
            }
        }

        if start.elapsed() >= timeout {
            break;
        }
        sleep(interval).await;
    }

    Err(E2eError::Timeout(format!(
        "Timeout while waiting for http server to start on port {} ({} attempts)",
        port, attempts
    )))
}
