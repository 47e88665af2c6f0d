//! Worker heartbeat loop.
//!
//! Sends NOTICE frames on schedule and tracks the expiry returned by the
//! coordinator. On a `reset` command, or once misses accumulate past the
//! expiry, the channel is torn down and reconnected with a doubling
//! backoff capped at 32 seconds.

use directord_protocol::{current_time, Control, Frame};
use directord_transport::Driver;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

const MAX_FAILURE_INTERVAL_SECS: u64 = 32;
const MAX_MISSES: u32 = 5;

pub fn run_heartbeat(driver: Arc<Driver>, interval: u64) {
    let agent_started = current_time();
    let mut failure_interval: u64 = 2;

    loop {
        let channel = match driver.heartbeat_connect() {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Heartbeat connection failed: {e}. Retrying in 5s...");
                std::thread::sleep(Duration::from_secs(5));
                continue;
            }
        };

        let mut heartbeat_at = current_time() + interval as f64;
        let mut heartbeat_misses: u32 = 0;

        loop {
            debug!("Heartbeat misses [ {} ]", heartbeat_misses);
            match channel.recv_timeout((interval * 1_000) as i64) {
                Ok(Some(frame)) => {
                    debug!("Heartbeat received from server");
                    if frame.command == "reset" {
                        warn!("Received heartbeat reset command. Connection resetting.");
                        break;
                    }
                    heartbeat_at = frame
                        .info
                        .parse::<f64>()
                        .unwrap_or_else(|_| current_time() + interval as f64);
                    heartbeat_misses = 0;
                    failure_interval = 2;
                }
                Ok(None) => {
                    if current_time() > heartbeat_at && heartbeat_misses > MAX_MISSES {
                        error!("Heartbeat failure, can't reach server");
                        warn!("Reconnecting in {failure_interval}s...");
                        std::thread::sleep(Duration::from_secs(failure_interval));
                        if failure_interval < MAX_FAILURE_INTERVAL_SECS {
                            failure_interval *= 2;
                        }
                        break;
                    }
                    heartbeat_misses += 1;
                    let beat = Frame::control(Control::Notice)
                        .with_data(node_info(agent_started).to_string().into_bytes());
                    if let Err(e) = channel.send(&beat) {
                        warn!("Heartbeat send failed: {e}");
                        break;
                    }
                    debug!("Sent heartbeat to server");
                }
                Err(e) => {
                    warn!("Heartbeat receive failed: {e}");
                    break;
                }
            }
        }

        let _ = channel.close();
        debug!("Running reconnection.");
    }
}

/// Telemetry attached to each beat; the coordinator folds it into the
/// worker record.
fn node_info(agent_started: f64) -> serde_json::Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "host_uptime": host_uptime(),
        "agent_uptime": current_time() - agent_started,
        "machine_id": machine_id(),
        "driver": "zmq",
    })
}

fn host_uptime() -> Option<f64> {
    let content = std::fs::read_to_string("/proc/uptime").ok()?;
    content.split_whitespace().next()?.parse().ok()
}

fn machine_id() -> Option<String> {
    std::fs::read_to_string("/etc/machine-id")
        .ok()
        .map(|id| id.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_info_shape() {
        let info = node_info(current_time() - 10.0);
        assert!(info.get("version").is_some());
        let agent_uptime = info["agent_uptime"].as_f64().unwrap();
        assert!(agent_uptime >= 10.0);
        assert_eq!(info["driver"], "zmq");
    }
}
