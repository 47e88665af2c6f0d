//! Directord operator binary.
//!
//! Usage:
//!     directord server --bind tcp://0.0.0.0
//!     directord client --connect tcp://127.0.0.1
//!     directord exec --verb RUN -- 'echo hello'
//!     directord orchestrate deployment.yaml --target w1

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use directord::orchestration::{self, ExpandOptions};
use directord::submit;
use directord_client::{ClientConfig, Worker};
use directord_logging::{directord_home, init_logging, LogConfig};
use directord_protocol::{ManageRequest, HEARTBEAT_INTERVAL_SECS};
use directord_server::{Server, ServerConfig};
use directord_transport::{AuthConfig, KeyPairFiles};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "directord", about = "Distributed task-dispatch fabric")]
struct Cli {
    /// Verbose console logging.
    #[arg(long, global = true)]
    debug: bool,

    /// Local submission socket path.
    #[arg(long, global = true)]
    socket_path: Option<PathBuf>,

    /// Shared-secret authentication key.
    #[arg(long, global = true)]
    shared_key: Option<String>,

    /// Force curve encryption using the conventional key directories.
    #[arg(long, global = true)]
    curve_encryption: bool,

    /// Job channel port.
    #[arg(long, global = true, default_value_t = directord_transport::driver::DEFAULT_JOB_PORT)]
    job_port: u16,

    /// Backend (transfer/coordination) channel port.
    #[arg(long, global = true, default_value_t = directord_transport::driver::DEFAULT_BACKEND_PORT)]
    backend_port: u16,

    /// Heartbeat channel port.
    #[arg(long, global = true, default_value_t = directord_transport::driver::DEFAULT_HEARTBEAT_PORT)]
    heartbeat_port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordinator.
    Server {
        /// Bind address for the worker-facing channels.
        #[arg(long, default_value = "tcp://0.0.0.0")]
        bind: String,

        #[arg(long, default_value_t = HEARTBEAT_INTERVAL_SECS)]
        heartbeat_interval: u64,
    },

    /// Run a worker agent.
    Client {
        /// Coordinator address.
        #[arg(long, default_value = "tcp://127.0.0.1")]
        connect: String,

        /// Durable cache directory.
        #[arg(long)]
        cache_path: Option<PathBuf>,

        /// Worker identity; defaults to the hostname.
        #[arg(long)]
        identity: Option<String>,

        #[arg(long, default_value_t = HEARTBEAT_INTERVAL_SECS)]
        heartbeat_interval: u64,
    },

    /// Submit one job.
    Exec {
        /// Verb to execute.
        #[arg(long)]
        verb: String,

        /// Limit the run to specific targets; repeatable.
        #[arg(long = "target")]
        targets: Vec<String>,

        /// Return the bare job id.
        #[arg(long)]
        poll: bool,

        /// Execution arguments for the verb.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        exec: Vec<String>,
    },

    /// Expand and submit orchestration files.
    Orchestrate {
        /// Orchestration YAML files.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Limit the run to specific targets; repeatable.
        #[arg(long = "target")]
        targets: Vec<String>,

        /// Restrict jobs to a set of fingerprints; repeatable.
        #[arg(long)]
        restrict: Vec<String>,

        /// Ignore the worker fingerprint caches.
        #[arg(long)]
        ignore_cache: bool,

        /// Return bare job ids.
        #[arg(long)]
        poll: bool,
    },

    /// Query or mutate coordinator state.
    Manage {
        /// One of list-jobs, list-nodes, purge-jobs, purge-nodes.
        operation: String,

        /// Show a single job id from the list-jobs view.
        #[arg(long)]
        job_info: Option<String>,
    },

    /// Generate curve keypairs in the conventional directories.
    KeyGen,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogConfig {
        app_name: "directord",
        debug: cli.debug,
    })?;

    let socket_path = cli
        .socket_path
        .clone()
        .unwrap_or_else(|| directord_home().join("directord.sock"));
    let auth = resolve_auth(&cli);

    match cli.command {
        Command::Server {
            bind,
            heartbeat_interval,
        } => {
            info!("Starting Directord server");
            info!("  Bind: {}", bind);
            info!("  Socket: {}", socket_path.display());
            let mut config =
                ServerConfig::new(bind, socket_path, directord_home().join("queue"));
            config.auth = auth;
            config.heartbeat_interval = heartbeat_interval;
            config.job_port = cli.job_port;
            config.backend_port = cli.backend_port;
            config.heartbeat_port = cli.heartbeat_port;
            Server::new(config)?.run()
        }
        Command::Client {
            connect,
            cache_path,
            identity,
            heartbeat_interval,
        } => {
            let cache_path = cache_path.unwrap_or_else(|| directord_home().join("cache"));
            info!("Starting Directord client");
            info!("  Server: {}", connect);
            info!("  Cache: {}", cache_path.display());
            let mut config = ClientConfig::new(connect, cache_path);
            config.identity = identity;
            config.auth = auth;
            config.heartbeat_interval = heartbeat_interval;
            config.job_port = cli.job_port;
            config.backend_port = cli.backend_port;
            config.heartbeat_port = cli.heartbeat_port;
            Worker::new(config)?.run()
        }
        Command::Exec {
            verb,
            targets,
            poll,
            exec,
        } => {
            let registry = directord_components::Registry::builtin();
            let component = registry
                .get(&verb)
                .with_context(|| format!("Unknown verb: '{verb}'"))?;
            let parsed = component.server(&exec)?;
            let mut job = parsed.into_job();
            job.targets = targets;
            job.return_raw = poll;

            let reply = submit::send_data(&socket_path, &serde_json::to_value(&job)?)?;
            println!("{reply}");
            Ok(())
        }
        Command::Orchestrate {
            files,
            targets,
            restrict,
            ignore_cache,
            poll,
        } => {
            let registry = directord_components::Registry::builtin();
            let options = ExpandOptions {
                targets,
                restrict: if restrict.is_empty() {
                    None
                } else {
                    Some(restrict)
                },
                skip_cache: ignore_cache,
                return_raw: poll,
            };

            for file in files {
                let content = std::fs::read_to_string(&file)
                    .with_context(|| format!("The [ {} ] file was not found.", file.display()))?;
                let entries = orchestration::load_orchestrations(&content)?;
                let jobs = orchestration::expand_orchestrations(&registry, &entries, &options)?;
                for job in jobs {
                    let reply = submit::send_data(&socket_path, &job)?;
                    if !reply.is_empty() {
                        println!("{reply}");
                    }
                }
            }
            Ok(())
        }
        Command::Manage {
            operation,
            job_info,
        } => {
            let request: ManageRequest = operation
                .parse()
                .map_err(anyhow::Error::msg)
                .context("Unknown manage operation")?;
            let view = submit::manage(&socket_path, request)?;
            let view = match job_info {
                Some(job_id) => filter_job(view, &job_id),
                None => view,
            };
            println!("{}", render_view(view)?);
            Ok(())
        }
        Command::KeyGen => {
            let config = AuthConfig::curve(&directord_home());
            KeyPairFiles::generate(&config, "server")?;
            KeyPairFiles::generate(&config, "client")?;
            println!(
                "Keys generated under {} and {}",
                config.public_keys_dir.display(),
                config.secret_keys_dir.display()
            );
            Ok(())
        }
    }
}

fn resolve_auth(cli: &Cli) -> AuthConfig {
    if let Some(key) = &cli.shared_key {
        AuthConfig::shared_key(key.clone())
    } else if cli.curve_encryption {
        AuthConfig::curve(&directord_home())
    } else {
        AuthConfig::discover(&directord_home())
    }
}

fn filter_job(view: serde_json::Value, job_id: &str) -> serde_json::Value {
    match view {
        serde_json::Value::Array(entries) => entries
            .into_iter()
            .find(|entry| entry.get(0).and_then(|id| id.as_str()) == Some(job_id))
            .unwrap_or(serde_json::Value::Null),
        other => other,
    }
}

/// Render a management view with human-readable internal timestamps.
fn render_view(view: serde_json::Value) -> Result<String> {
    let view = humanize_times(view);
    Ok(serde_json::to_string_pretty(&view)?)
}

fn humanize_times(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(humanize_times).collect())
        }
        serde_json::Value::Object(map) => {
            let map = map
                .into_iter()
                .map(|(key, value)| {
                    if key.starts_with("_createtime") || key.starts_with("_starttime") {
                        if let Some(seconds) = value.as_f64() {
                            if let Some(stamp) =
                                chrono::DateTime::from_timestamp(seconds as i64, 0)
                            {
                                return (key, serde_json::Value::String(stamp.to_rfc3339()));
                            }
                        }
                    }
                    (key, humanize_times(value))
                })
                .collect();
            serde_json::Value::Object(map)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_job_matches_pairs() {
        let view = json!([["job-1", {"VERB": "RUN"}], ["job-2", {"VERB": "ECHO"}]]);
        let filtered = filter_job(view, "job-2");
        assert_eq!(filtered[1]["VERB"], "ECHO");
    }

    #[test]
    fn test_humanize_times_rewrites_internal_stamps() {
        let view = json!({"_createtime": 1_700_000_000.5, "EXECUTION_TIME": 1.5});
        let rendered = humanize_times(view);
        assert!(rendered["_createtime"].is_string());
        assert_eq!(rendered["EXECUTION_TIME"], 1.5);
    }
}
