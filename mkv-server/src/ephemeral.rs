//! # Ephemeral Instance
//!
//! Provision a throwaway store on a loopback port, in-process, for tests and
//! local demos. The instance runs on its own thread with its own tokio
//! runtime so it can be started and stopped from blocking or async code.
//!
//! `EphemeralResolver` wraps an instance behind the `TargetResolver` seam and
//! adds `teardown()`, to be called once every connection using it is closed.

use std::net::SocketAddr;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use mkv_common::{ConnectionTarget, MkvError, MkvResult, TargetResolver};

use crate::server::{handle_connection, ServerState};

/// Settings for an ephemeral instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address; port 0 lets the OS assign one.
    pub bind: String,
    /// Interval of the active expiry sweep.
    pub expire_interval: Duration,
    /// How long `start` waits for the listener to come up.
    pub startup_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            expire_interval: Duration::from_millis(100),
            startup_timeout: Duration::from_secs(5),
        }
    }
}

/// Handle to a running in-process store instance.
///
/// Dropping the handle shuts the instance down.
pub struct EphemeralServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl EphemeralServer {
    /// Starts an instance with default settings.
    pub fn start() -> MkvResult<Self> {
        Self::with_config(ServerConfig::default())
    }

    /// Starts an instance and waits until it accepts connections.
    ///
    /// Fails with `UnavailableTarget` if the listener cannot be bound or does
    /// not report readiness within `startup_timeout`.
    pub fn with_config(config: ServerConfig) -> MkvResult<Self> {
        let state = Arc::new(ServerState::new());
        let (ready_tx, ready_rx) = std_mpsc::channel::<std::io::Result<SocketAddr>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let thread_state = Arc::clone(&state);
        let thread_config = config.clone();
        let thread = std::thread::Builder::new()
            .name("mkv-ephemeral".to_string())
            .spawn(move || run_instance(thread_config, thread_state, ready_tx, shutdown_rx))
            .map_err(|err| MkvError::UnavailableTarget(format!("failed to spawn instance thread: {err}")))?;

        let addr = match ready_rx.recv_timeout(config.startup_timeout) {
            Ok(Ok(addr)) => addr,
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(MkvError::UnavailableTarget(format!(
                    "ephemeral instance failed to bind {}: {err}",
                    config.bind
                )));
            }
            Err(_) => {
                // A late listener still sees the signal once it reaches the accept loop.
                let _ = shutdown_tx.send(());
                if thread.join().is_err() {
                    warn!(bind = %config.bind, "ephemeral instance thread panicked");
                }
                return Err(MkvError::UnavailableTarget(
                    "ephemeral instance did not become ready".to_string(),
                ));
            }
        };

        info!(%addr, "ephemeral instance ready");
        Ok(EphemeralServer {
            addr,
            state,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Socket address the instance listens on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connection target pointing at this instance.
    pub fn target(&self) -> MkvResult<ConnectionTarget> {
        ConnectionTarget::new(self.addr.ip().to_string(), self.addr.port())
    }

    /// Shared state, for inspecting the keyspace in tests.
    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Returns true until `shutdown` has been called.
    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Stops accepting clients, drops open connections and joins the thread.
    ///
    /// Calling this more than once is a no-op.
    pub fn shutdown(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        let _ = shutdown.send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(addr = %self.addr, "ephemeral instance thread panicked");
            }
        }
        info!(addr = %self.addr, "ephemeral instance stopped");
    }
}

impl Drop for EphemeralServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_instance(
    config: ServerConfig,
    state: Arc<ServerState>,
    ready: std_mpsc::Sender<std::io::Result<SocketAddr>>,
    shutdown: oneshot::Receiver<()>,
) {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("mkv-ephemeral-worker")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    runtime.block_on(async move {
        let listener = match TcpListener::bind(&config.bind).await {
            Ok(listener) => listener,
            Err(err) => {
                let _ = ready.send(Err(err));
                return;
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                let _ = ready.send(Err(err));
                return;
            }
        };
        let _ = ready.send(Ok(addr));

        let sweep_state = Arc::clone(&state);
        let interval = config.expire_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                sweep_state.store.purge_expired(Instant::now());
            }
        });

        accept_loop(listener, state, shutdown).await;
    });
    // Dropping the runtime cancels every connection task and closes sockets.
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>, mut shutdown: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, state).await {
                            debug!(%peer, error = %err, "client connection ended with error");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "accept failed"),
            },
            _ = &mut shutdown => break,
        }
    }
}

/// Resolver that provisions an ephemeral instance and points at it.
pub struct EphemeralResolver {
    server: Mutex<Option<EphemeralServer>>,
}

impl EphemeralResolver {
    /// Provisions an instance with default settings.
    pub fn start() -> MkvResult<Self> {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> MkvResult<Self> {
        Ok(EphemeralResolver {
            server: Mutex::new(Some(EphemeralServer::with_config(config)?)),
        })
    }

    /// Stops the provisioned instance. Later calls are no-ops.
    ///
    /// Call after every connection derived from this resolver is closed.
    pub fn teardown(&self) {
        if let Some(mut server) = self.server.lock().take() {
            server.shutdown();
        }
    }

    /// Returns true until `teardown` has run.
    pub fn is_provisioned(&self) -> bool {
        self.server.lock().is_some()
    }
}

impl TargetResolver for EphemeralResolver {
    fn resolve(&self) -> MkvResult<ConnectionTarget> {
        match self.server.lock().as_ref() {
            Some(server) => server.target(),
            None => Err(MkvError::UnavailableTarget(
                "ephemeral instance was torn down".to_string(),
            )),
        }
    }
}
