//! Worker agent.
//!
//! Three cooperating loops share one cache handle: the heartbeat loop
//! with exponential reconnect, the job loop with idle-ramp polling, and
//! a resident backend loop answering coordination notices.

mod backend;
mod heartbeat;
mod job;
mod locks;

pub use job::intervals;

use anyhow::{Context, Result};
use directord_cache::Cache;
use directord_protocol::HEARTBEAT_INTERVAL_SECS;
use directord_transport::{AuthConfig, Driver, DriverConfig};
use locks::LockMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Worker configuration (plain data).
pub struct ClientConfig {
    /// Coordinator address, e.g. `tcp://127.0.0.1`.
    pub connection: String,
    pub cache_path: PathBuf,
    /// Worker identity; defaults to the hostname.
    pub identity: Option<String>,
    pub auth: AuthConfig,
    pub heartbeat_interval: u64,
    pub job_port: u16,
    pub backend_port: u16,
    pub heartbeat_port: u16,
}

impl ClientConfig {
    pub fn new(connection: impl Into<String>, cache_path: impl Into<PathBuf>) -> Self {
        ClientConfig {
            connection: connection.into(),
            cache_path: cache_path.into(),
            identity: None,
            auth: AuthConfig::disabled(),
            heartbeat_interval: HEARTBEAT_INTERVAL_SECS,
            job_port: directord_transport::driver::DEFAULT_JOB_PORT,
            backend_port: directord_transport::driver::DEFAULT_BACKEND_PORT,
            heartbeat_port: directord_transport::driver::DEFAULT_HEARTBEAT_PORT,
        }
    }
}

pub struct Worker {
    driver: Arc<Driver>,
    cache: Arc<Cache>,
    registry: Arc<directord_components::Registry>,
    locks: Arc<LockMap>,
    heartbeat_interval: u64,
}

impl Worker {
    pub fn new(config: ClientConfig) -> Result<Worker> {
        let identity = match config.identity {
            Some(identity) => identity,
            None => gethostname::gethostname().to_string_lossy().into_owned(),
        };

        let cache = Cache::open(&config.cache_path)
            .with_context(|| format!("Failed to open cache at {}", config.cache_path.display()))?;

        let mut driver_config = DriverConfig::new(config.connection, identity);
        driver_config.auth = config.auth;
        driver_config.job_port = config.job_port;
        driver_config.backend_port = config.backend_port;
        driver_config.heartbeat_port = config.heartbeat_port;

        Ok(Worker {
            driver: Arc::new(Driver::new(driver_config)),
            cache: Arc::new(cache),
            registry: Arc::new(directord_components::Registry::builtin()),
            locks: Arc::new(LockMap::new()),
            heartbeat_interval: config.heartbeat_interval,
        })
    }

    pub fn identity(&self) -> &str {
        self.driver.identity()
    }

    /// Run all worker loops; the job loop occupies the calling thread.
    pub fn run(&self) -> Result<()> {
        info!("Starting worker [ {} ]", self.identity());

        let heartbeat_driver = Arc::clone(&self.driver);
        let interval = self.heartbeat_interval;
        std::thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || heartbeat::run_heartbeat(heartbeat_driver, interval))?;

        let backend_driver = Arc::clone(&self.driver);
        let backend_cache = Arc::clone(&self.cache);
        std::thread::Builder::new()
            .name("backend".to_string())
            .spawn(move || backend::run_backend(backend_driver, backend_cache))?;

        job::run_job_loop(
            Arc::clone(&self.driver),
            Arc::clone(&self.cache),
            Arc::clone(&self.registry),
            Arc::clone(&self.locks),
        )
    }
}
