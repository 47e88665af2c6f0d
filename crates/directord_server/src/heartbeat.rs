//! Coordinator heartbeat loop.
//!
//! Refreshes worker expiry on every NOTICE/READY, answers with the new
//! expiry, probes idle workers with a reset command and prunes the dead.

use crate::State;
use directord_protocol::{current_time, Control, Frame, WorkerRecord, HEARTBEAT_LIVENESS};
use directord_transport::Driver;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

const POLL_INTERVAL_MS: i64 = 1_000;

/// Grace period past the idle probe before a worker is removed.
const PRUNE_GRACE_SECS: f64 = 3.0;

pub fn run_heartbeat(driver: Arc<Driver>, state: Arc<State>) {
    let channel = match driver.heartbeat_bind() {
        Ok(channel) => channel,
        Err(e) => {
            error!("Heartbeat bind failed: {e}");
            return;
        }
    };

    let interval = state.heartbeat_interval as f64;
    let liveness = interval * HEARTBEAT_LIVENESS as f64;
    let mut heartbeat_at = current_time() + interval;

    loop {
        match channel.recv_routed_timeout(POLL_INTERVAL_MS) {
            Ok(Some((identity, frame))) => {
                if !matches!(frame.control, Some(Control::Ready) | Some(Control::Notice)) {
                    continue;
                }
                debug!("Received heartbeat from [ {} ], client online", identity);

                let mut record = record_from_beat(&frame);
                let expiry = current_time() + liveness;
                record.expiry = expiry;
                state.workers.set(&identity, record);
                heartbeat_at = current_time() + interval;

                let reply = Frame::control(Control::Notice).with_info(expiry.to_string());
                if let Err(e) = channel.send_to(&identity, &reply) {
                    warn!("Heartbeat reply to [ {} ] failed: {e}", identity);
                }
            }
            Ok(None) => {
                let now = current_time();
                if now > heartbeat_at + liveness && !state.workers.is_empty() {
                    // Nothing has beaten for a full liveness window: probe
                    // everyone and drop those silent beyond their expiry.
                    for (identity, record) in state.workers.items() {
                        warn!("Sending idle worker [ {} ] a heartbeat", identity);
                        let probe = Frame::control(Control::Notice)
                            .with_command("reset")
                            .with_info((now + liveness).to_string());
                        if let Err(e) = channel.send_to(&identity, &probe) {
                            warn!("Idle probe to [ {} ] failed: {e}", identity);
                        }
                        if now > record.expiry + PRUNE_GRACE_SECS {
                            warn!("Removing dead worker {}", identity);
                            state.workers.remove(&identity);
                        }
                    }
                    heartbeat_at = now + interval;
                } else {
                    let now = current_time();
                    let pruned = state.workers.prune(&|record| record.is_live(now));
                    if pruned > 0 {
                        warn!("Pruned {pruned} expired workers");
                    }
                }
            }
            Err(e) => {
                warn!("Heartbeat receive failed: {e}");
            }
        }
    }
}

/// Fold the telemetry payload of a beat into a worker record.
fn record_from_beat(frame: &Frame) -> WorkerRecord {
    let mut record = WorkerRecord::default();
    if let Ok(Value::Object(info)) = serde_json::from_slice::<Value>(&frame.data) {
        record.version = info
            .get("version")
            .and_then(Value::as_str)
            .map(str::to_string);
        record.host_uptime = info.get("host_uptime").and_then(Value::as_f64);
        record.agent_uptime = info.get("agent_uptime").and_then(Value::as_f64);
        record.machine_id = info
            .get("machine_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        record.driver = info
            .get("driver")
            .and_then(Value::as_str)
            .map(str::to_string);
    }
    record
}
