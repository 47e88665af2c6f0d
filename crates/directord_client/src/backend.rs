//! Resident backend loop.
//!
//! Keeps one backend connection open so relayed coordination notices
//! reach this worker even while no barrier verb is executing. Each
//! notice is answered on its own thread because the cache poll may take
//! minutes.

use directord_cache::Cache;
use directord_components::builtin::job_wait;
use directord_protocol::Control;
use directord_transport::Driver;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const POLL_INTERVAL_MS: i64 = 1_000;

pub fn run_backend(driver: Arc<Driver>, cache: Arc<Cache>) {
    loop {
        let channel = match driver.backend_connect() {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Backend connection failed: {e}. Retrying in 5s...");
                std::thread::sleep(Duration::from_secs(5));
                continue;
            }
        };

        loop {
            match channel.recv_timeout(POLL_INTERVAL_MS) {
                Ok(Some(frame)) => match frame.control {
                    Some(Control::CoordinationNotice) => {
                        let driver = Arc::clone(&driver);
                        let cache = Arc::clone(&cache);
                        let spawned = std::thread::Builder::new()
                            .name("coordination".to_string())
                            .spawn(move || {
                                // Replies travel over a dedicated channel
                                // so a slow poll never blocks this loop.
                                match driver.backend_connect_ephemeral(&frame.msg_id) {
                                    Ok(reply_channel) => {
                                        job_wait::answer_coordination(
                                            &reply_channel,
                                            &cache,
                                            &frame,
                                        );
                                        let _ = reply_channel.close();
                                    }
                                    Err(e) => warn!("Coordination reply channel failed: {e}"),
                                }
                            });
                        if let Err(e) = spawned {
                            warn!("Failed to spawn coordination handler: {e}");
                        }
                    }
                    other => {
                        debug!("Backend loop ignoring control [ {other:?} ]");
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    warn!("Backend receive failed: {e}");
                    break;
                }
            }
        }

        let _ = channel.close();
    }
}
