//! Coordinator.
//!
//! Four threads of control: the local submission socket, the heartbeat
//! loop, and the interactions loop (job dispatch, job results, backend
//! transfers and coordination relays) plus the caller's thread joining
//! them.

pub mod datastore;
mod heartbeat;
mod interactions;
mod submission;

pub use datastore::{DocumentStore, MemStore};

use anyhow::{Context, Result};
use directord_cache::DurableQueue;
use directord_protocol::{JobRecord, WorkerRecord, HEARTBEAT_INTERVAL_SECS};
use directord_transport::{AuthConfig, Driver, DriverConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Coordinator configuration (plain data).
pub struct ServerConfig {
    /// Bind address for the worker-facing channels, e.g. `tcp://0.0.0.0`.
    pub bind_address: String,
    /// Local stream socket accepting submissions.
    pub socket_path: PathBuf,
    /// Durable pending-job queue directory.
    pub queue_path: PathBuf,
    pub auth: AuthConfig,
    pub heartbeat_interval: u64,
    pub job_port: u16,
    pub backend_port: u16,
    pub heartbeat_port: u16,
}

impl ServerConfig {
    pub fn new(
        bind_address: impl Into<String>,
        socket_path: impl Into<PathBuf>,
        queue_path: impl Into<PathBuf>,
    ) -> Self {
        ServerConfig {
            bind_address: bind_address.into(),
            socket_path: socket_path.into(),
            queue_path: queue_path.into(),
            auth: AuthConfig::disabled(),
            heartbeat_interval: HEARTBEAT_INTERVAL_SECS,
            job_port: directord_transport::driver::DEFAULT_JOB_PORT,
            backend_port: directord_transport::driver::DEFAULT_BACKEND_PORT,
            heartbeat_port: directord_transport::driver::DEFAULT_HEARTBEAT_PORT,
        }
    }
}

/// Shared coordinator state.
pub(crate) struct State {
    pub workers: Arc<dyn DocumentStore<WorkerRecord>>,
    pub jobs: Arc<dyn DocumentStore<JobRecord>>,
    pub queue: Arc<DurableQueue>,
    pub heartbeat_interval: u64,
}

pub struct Server {
    driver: Arc<Driver>,
    state: Arc<State>,
    socket_path: PathBuf,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Server> {
        let queue = DurableQueue::open(&config.queue_path)
            .with_context(|| format!("Failed to open queue at {}", config.queue_path.display()))?;

        let mut driver_config = DriverConfig::new(config.bind_address, "directord-server");
        driver_config.auth = config.auth;
        driver_config.job_port = config.job_port;
        driver_config.backend_port = config.backend_port;
        driver_config.heartbeat_port = config.heartbeat_port;

        Ok(Server {
            driver: Arc::new(Driver::new(driver_config)),
            state: Arc::new(State {
                workers: Arc::new(MemStore::new()),
                jobs: Arc::new(MemStore::new()),
                queue: Arc::new(queue),
                heartbeat_interval: config.heartbeat_interval,
            }),
            socket_path: config.socket_path,
        })
    }

    /// Run all coordinator loops; the interactions loop occupies the
    /// calling thread.
    pub fn run(&self) -> Result<()> {
        info!("Starting coordinator");

        let submission_state = Arc::clone(&self.state);
        let socket_path = self.socket_path.clone();
        std::thread::Builder::new()
            .name("submission".to_string())
            .spawn(move || submission::run_socket_server(submission_state, socket_path))?;

        let heartbeat_state = Arc::clone(&self.state);
        let heartbeat_driver = Arc::clone(&self.driver);
        std::thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || heartbeat::run_heartbeat(heartbeat_driver, heartbeat_state))?;

        interactions::run_interactions(Arc::clone(&self.driver), Arc::clone(&self.state))
    }
}
