//! Server wiring — startup port binding, background jobs, heartbeat, and
//! ordered graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::delegate::{Delegator, sweeper};
use crate::directory::{AgentDirectory, AgentInfo, HttpAgentDirectory, NullDirectory};
use crate::error::{ConfigError, Error, Result};
use crate::events::{AgentSnapshot, EventBus, EventKind, EventPayload};
use crate::http::csrf::CsrfCache;
use crate::http::guard::ResourceGuard;
use crate::http::rate_limit::RateLimiter;
use crate::http::{AppState, a2a_routes};
use crate::store::{LibSqlBackend, TaskStore};

/// A bound, running server and the handles needed to stop it cleanly.
pub struct RunningServer {
    port: u16,
    state: AppState,
    directory: Arc<dyn AgentDirectory>,
    sweeper_handle: JoinHandle<()>,
    cleanup_handle: JoinHandle<()>,
    heartbeat_handle: JoinHandle<()>,
    serve_handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl RunningServer {
    /// The port the listener bound.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Shared state, for embedding and tests.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Graceful shutdown. The order matters: background jobs stop before
    /// the directory entry is deactivated, and the listener closes before
    /// the store reference is dropped, so no job can touch a closed store.
    pub async fn shutdown(self) {
        info!("Shutting down");

        // 1. Sweeper.
        self.sweeper_handle.abort();
        // 2. Periodic cache cleanup.
        self.cleanup_handle.abort();
        // 3. Heartbeat.
        self.heartbeat_handle.abort();

        // 4. Directory entry.
        if let Err(e) = self
            .directory
            .deactivate(&self.state.config.agent_name)
            .await
        {
            warn!(error = %e, "Failed to deactivate directory entry");
        }

        // 5. Listening socket.
        let _ = self.shutdown_tx.send(true);
        let _ = self.serve_handle.await;

        // 6. Store handle goes down with the state, dropped here last.
        drop(self.state);
        info!("Shutdown complete");
    }
}

/// Open the configured store, bind a port, spawn the background jobs, and
/// register with the directory.
pub async fn start(config: ServerConfig) -> Result<RunningServer> {
    let store: Arc<dyn TaskStore> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&config.db_path)).await?,
    );
    let directory: Arc<dyn AgentDirectory> = match config.directory_url {
        Some(ref url) => Arc::new(HttpAgentDirectory::new(url.clone())),
        None => Arc::new(NullDirectory),
    };
    start_with(config, store, directory).await
}

/// As [`start`], with the store and directory injected (tests, embedding).
pub async fn start_with(
    config: ServerConfig,
    store: Arc<dyn TaskStore>,
    directory: Arc<dyn AgentDirectory>,
) -> Result<RunningServer> {
    if config.shared_secret.is_none() {
        warn!("A2A_SHARED_SECRET not set — Bearer auth is disabled");
    }

    let config = Arc::new(config);
    let bus = EventBus::new(config.event_buffer);
    let delegator = Delegator::new(Arc::clone(&store), Arc::clone(&bus));

    let state = AppState {
        store,
        delegator: Arc::clone(&delegator),
        bus,
        csrf: CsrfCache::new(config.csrf_cache_size, config.csrf_ttl),
        rate_limiter: RateLimiter::new(config.rate_limit_max, config.rate_limit_window),
        guard: ResourceGuard::new(config.max_connections, config.max_body_bytes),
        config: Arc::clone(&config),
    };

    // Bind: fixed port when configured, otherwise the first free port in
    // the range.
    let listener = bind_listener(&config).await?;
    let addr = listener
        .local_addr()
        .map_err(|e| Error::Config(ConfigError::Io(e)))?;
    info!(port = addr.port(), "A2A server listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let app = a2a_routes(state.clone());
    let serve_handle = tokio::spawn(async move {
        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
        });
        if let Err(e) = serve.await {
            warn!(error = %e, "Server task exited with error");
        }
    });

    // Background jobs, each on its own timer.
    let sweeper_handle = sweeper::spawn_sweeper(
        Arc::clone(&delegator),
        config.sweep_interval,
        config.task_timeout,
    );
    let cleanup_handle = spawn_cache_cleanup(state.clone());

    // Directory registration + heartbeat.
    let info = AgentInfo {
        agent_id: config.agent_name.clone(),
        base_url: format!("http://{}:{}", local_host(), addr.port()),
        skills: Vec::new(),
        online: true,
    };
    if let Err(e) = directory.register(&info).await {
        warn!(error = %e, "Directory registration failed, continuing standalone");
    }
    state.bus.publish(
        EventKind::AgentRegistered,
        EventPayload::Agent {
            agent: AgentSnapshot {
                agent_id: info.agent_id.clone(),
                base_url: Some(info.base_url.clone()),
                skills: info.skills.clone(),
            },
        },
    );
    let heartbeat_handle = spawn_heartbeat(
        Arc::clone(&directory),
        config.agent_name.clone(),
        config.heartbeat_interval,
    );

    Ok(RunningServer {
        port: addr.port(),
        state,
        directory,
        sweeper_handle,
        cleanup_handle,
        heartbeat_handle,
        serve_handle,
        shutdown_tx,
    })
}

async fn bind_listener(config: &ServerConfig) -> Result<TcpListener> {
    if let Some(port) = config.port {
        return TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| Error::Config(ConfigError::Io(e)));
    }

    let (start, end) = config.port_range;
    for port in start..=end {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Ok(listener),
            Err(_) => continue,
        }
    }
    Err(Error::Config(ConfigError::NoFreePort { start, end }))
}

fn local_host() -> String {
    std::env::var("A2A_ADVERTISE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// Periodic purge of the CSRF and rate-limit caches.
fn spawn_cache_cleanup(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tick.tick().await;
            let csrf = state.csrf.purge_expired();
            let rate = state.rate_limiter.purge_expired();
            if csrf + rate > 0 {
                tracing::debug!(csrf, rate, "Purged expired cache entries");
            }
        }
    })
}

fn spawn_heartbeat(
    directory: Arc<dyn AgentDirectory>,
    agent_name: String,
    interval: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        // Skip the immediate first tick; registration just happened.
        tick.tick().await;
        loop {
            tick.tick().await;
            if let Err(e) = directory.heartbeat(&agent_name).await {
                warn!(error = %e, "Directory heartbeat failed");
            }
        }
    })
}
