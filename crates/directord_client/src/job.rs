//! Worker job loop.

use crate::locks::LockMap;
use anyhow::{Context, Result};
use directord_cache::{Cache, SetOptions};
use directord_components::{Executor, Registry};
use directord_protocol::{current_time, Control, Frame, JobItem};
use directord_transport::{Channel, Driver};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Parent state records expire after a day.
const PARENT_EXPIRE_SECS: f64 = 86_400.0;

/// Terminal job states stay cached for twelve hours.
const JOB_STATE_EXPIRE_SECS: f64 = 28_800.0;

pub mod intervals {
    /// Idle-ramp polling: fast while work is fresh, slow when quiet.
    pub const ACTIVE_MS: i64 = 128;
    pub const RAMP_DOWN_MS: i64 = 1_024;
    pub const IDLE_MS: i64 = 2_048;

    pub const RAMP_DOWN_AFTER_SECS: f64 = 32.0;
    pub const IDLE_AFTER_SECS: f64 = 64.0;

    pub fn poll_interval(idle_for: f64) -> i64 {
        if idle_for > IDLE_AFTER_SECS {
            IDLE_MS
        } else if idle_for > RAMP_DOWN_AFTER_SECS {
            RAMP_DOWN_MS
        } else {
            ACTIVE_MS
        }
    }
}

pub fn run_job_loop(
    driver: Arc<Driver>,
    cache: Arc<Cache>,
    registry: Arc<Registry>,
    locks: Arc<LockMap>,
) -> Result<()> {
    let channel = driver.job_connect().context("Job channel connect failed")?;
    let executor = Executor::new().context("Executor initialization failed")?;

    let mut poller_time = current_time();
    let mut poller_interval = intervals::RAMP_DOWN_MS;

    loop {
        let idle_for = current_time() - poller_time;
        let next_interval = intervals::poll_interval(idle_for);
        if next_interval == intervals::IDLE_MS && poller_interval != intervals::IDLE_MS {
            info!("Directord client entering idle state.");
        } else if next_interval == intervals::RAMP_DOWN_MS
            && poller_interval == intervals::ACTIVE_MS
        {
            info!("Directord client ramping down.");
        }
        poller_interval = next_interval;

        let frame = match channel.recv_timeout(poller_interval) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Job receive failed: {e}");
                continue;
            }
        };
        let Some(frame) = frame else {
            continue;
        };
        poller_time = current_time();

        let job = match JobItem::from_json(&frame.data) {
            Ok(job) => job,
            Err(e) => {
                error!("Discarding undecodable job frame: {e}");
                continue;
            }
        };

        info!("Job received {}", job.job_id);
        if let Err(e) = channel.send(&Frame::status(&job.job_id, Control::JobAck)) {
            warn!("Job ack failed for {}: {e}", job.job_id);
        }
        let follow_on = handle_job(&channel, &cache, &registry, &locks, &executor, &driver, &job);
        if !follow_on.is_empty() {
            spawn_local_jobs(&cache, &registry, &locks, &driver, follow_on);
        }
    }
}

/// Execute follow-on jobs off the receive loop.
///
/// Synthetic jobs were never dispatched by the coordinator, so they have
/// no record to report into; their value is entirely local cache state.
/// Running them on their own thread keeps the job loop receiving, which
/// matters when a follow-on barrier waits for a frame still in flight.
fn spawn_local_jobs(
    cache: &Arc<Cache>,
    registry: &Arc<Registry>,
    locks: &Arc<LockMap>,
    driver: &Arc<Driver>,
    jobs: Vec<JobItem>,
) {
    let cache = Arc::clone(cache);
    let registry = Arc::clone(registry);
    let locks = Arc::clone(locks);
    let driver = Arc::clone(driver);

    let spawned = std::thread::Builder::new()
        .name("local-jobs".to_string())
        .spawn(move || {
            let executor = match Executor::new() {
                Ok(executor) => executor,
                Err(e) => {
                    error!("Local executor initialization failed: {e}");
                    return;
                }
            };
            let mut pending: VecDeque<JobItem> = jobs.into();
            while let Some(job) = pending.pop_front() {
                let follow_on =
                    run_local_job(&cache, &registry, &locks, &executor, &driver, &job);
                pending.extend(follow_on);
            }
        });
    if let Err(e) = spawned {
        warn!("Failed to spawn local job thread: {e}");
    }
}

/// A frame-less rendition of [`handle_job`] for self-enqueued work.
fn run_local_job(
    cache: &Arc<Cache>,
    registry: &Registry,
    locks: &LockMap,
    executor: &Executor,
    driver: &Arc<Driver>,
    job: &JobItem,
) -> Vec<JobItem> {
    if !job.parent_id.is_empty() {
        match cache.get(&job.parent_id) {
            Some(serde_json::Value::Bool(false)) if !job.parent_async_bypass => {
                error!(
                    "Job [ {} ] was not allowed to run because there was a failure under this parent ID [ {} ]",
                    job.job_id, job.parent_id
                );
                persist_state(cache, job, Control::JobFailed);
                return Vec::new();
            }
            Some(_) => {}
            None => {
                let options = SetOptions::tagged("parents").with_expire(PARENT_EXPIRE_SECS);
                let _ = cache.set(&job.parent_id, serde_json::Value::Bool(true), options);
            }
        }
    }

    let Some(component) = registry.get(job.verb()) else {
        error!("Unknown verb [ {} ] in local job {}", job.verb(), job.job_id);
        return Vec::new();
    };

    let held_lock = component.lock_name().map(|name| locks.acquire(name));
    let _guard = held_lock
        .as_ref()
        .map(|lock| lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));

    let (outcome, follow_on) = executor.execute(
        Arc::clone(&component),
        Arc::clone(cache),
        Arc::clone(driver),
        job,
    );

    let control = if outcome.outcome {
        info!("Job complete {}", job.job_id);
        Control::JobEnd
    } else {
        error!("Job failed {}", job.job_id);
        Control::JobFailed
    };
    persist_state(cache, job, control);

    follow_on
}

/// Execute one job item and report its lifecycle over the job channel.
///
/// Returns any follow-on jobs the execution produced; the caller
/// enqueues them before the next receive.
pub fn handle_job(
    channel: &Channel,
    cache: &Arc<Cache>,
    registry: &Registry,
    locks: &LockMap,
    executor: &Executor,
    driver: &Arc<Driver>,
    job: &JobItem,
) -> Vec<JobItem> {
    // Parent-failure short-circuit.
    if !job.parent_id.is_empty() {
        match cache.get(&job.parent_id) {
            Some(serde_json::Value::Bool(false)) if !job.parent_async_bypass => {
                let status = format!(
                    "Job [ {} ] was not allowed to run because there was a failure under this parent ID [ {} ]",
                    job.job_id, job.parent_id
                );
                error!("{status}");
                persist_state(cache, job, Control::JobFailed);
                send_status(
                    channel,
                    job,
                    Control::JobFailed,
                    Frame::status(&job.job_id, Control::JobFailed).with_info(&*status),
                );
                return Vec::new();
            }
            Some(_) => {}
            None => {
                let options = SetOptions::tagged("parents").with_expire(PARENT_EXPIRE_SECS);
                if let Err(e) =
                    cache.set(&job.parent_id, serde_json::Value::Bool(true), options)
                {
                    warn!("Failed to record parent {}: {e}", job.parent_id);
                }
            }
        }
    }

    let Some(component) = registry.get(job.verb()) else {
        send_status(
            channel,
            job,
            Control::JobFailed,
            Frame::status(&job.job_id, Control::JobFailed)
                .with_info(format!("Unknown verb [ {} ]", job.verb())),
        );
        return Vec::new();
    };

    // Fingerprint cache short-circuit.
    if component.cacheable() && !job.skip_cache {
        let state = cache
            .get(&job.job_sha3_224)
            .and_then(|v| v.as_str().map(str::to_string));
        if state.as_deref() == Some(Control::JobEnd.as_str()) {
            debug!("Cache hit on {}, task skipped.", job.job_sha3_224);
            send_status(
                channel,
                job,
                Control::JobEnd,
                Frame::status(&job.job_id, Control::JobEnd).with_info("job skipped"),
            );
            return Vec::new();
        }
    }

    send_status(
        channel,
        job,
        Control::JobProcessing,
        Frame::status(&job.job_id, Control::JobProcessing),
    );

    let held_lock = component.lock_name().map(|name| locks.acquire(name));
    let _guard = held_lock
        .as_ref()
        .map(|lock| lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));

    let (outcome, follow_on) = executor.execute(
        Arc::clone(&component),
        Arc::clone(cache),
        Arc::clone(driver),
        job,
    );

    let control = if outcome.outcome {
        info!("Job complete {}", job.job_id);
        Control::JobEnd
    } else {
        error!("Job failed {}", job.job_id);
        if !job.parent_id.is_empty() {
            let options = SetOptions::tagged("parents").with_expire(PARENT_EXPIRE_SECS);
            if let Err(e) = cache.set(&job.parent_id, serde_json::Value::Bool(false), options) {
                warn!("Failed to record parent failure {}: {e}", job.parent_id);
            }
        }
        Control::JobFailed
    };

    persist_state(cache, job, control);

    let mut frame = Frame::status(&job.job_id, control);
    if let Some(info) = &outcome.info {
        frame = frame.with_info(&**info);
    }
    if let Some(stdout) = &outcome.stdout {
        frame = frame.with_stdout(stdout.as_bytes().to_vec());
    }
    if let Some(stderr) = &outcome.stderr {
        frame = frame.with_stderr(stderr.as_bytes().to_vec());
    }
    send_status(channel, job, control, frame);

    follow_on
}

fn persist_state(cache: &Cache, job: &JobItem, control: Control) {
    if job.job_sha3_224.is_empty() {
        return;
    }
    let options = SetOptions::tagged("jobs").with_expire(JOB_STATE_EXPIRE_SECS);
    if let Err(e) = cache.set(
        &job.job_sha3_224,
        serde_json::Value::String(control.as_str().to_string()),
        options,
    ) {
        warn!("Failed to persist job state {}: {e}", job.job_sha3_224);
    }
}

fn send_status(channel: &Channel, job: &JobItem, control: Control, frame: Frame) {
    let frame = frame.with_command(job.verb());
    if let Err(e) = channel.send(&frame) {
        warn!(
            "Failed to send {} for job {}: {e}",
            control.as_str(),
            job.job_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use directord_protocol::{job_sha3_224, VerbPayload};
    use directord_transport::DriverConfig;

    struct Harness {
        _dir: tempfile::TempDir,
        driver: Arc<Driver>,
        cache: Arc<Cache>,
        registry: Registry,
        locks: LockMap,
        executor: Executor,
        bound: Channel,
        connected: Channel,
    }

    impl Harness {
        fn new(name: &str) -> Harness {
            let dir = tempfile::tempdir().unwrap();
            let driver = Arc::new(Driver::new(DriverConfig::new(
                format!("inproc://job-{name}"),
                "w1",
            )));
            let bound = driver.job_bind().unwrap();
            let connected = driver.job_connect().unwrap();
            Harness {
                cache: Arc::new(Cache::open(dir.path().join("cache")).unwrap()),
                _dir: dir,
                registry: Registry::builtin(),
                locks: LockMap::new(),
                executor: Executor::new().unwrap(),
                driver,
                bound,
                connected,
            }
        }

        fn handle(&self, job: &JobItem) -> Vec<JobItem> {
            handle_job(
                &self.connected,
                &self.cache,
                &self.registry,
                &self.locks,
                &self.executor,
                &self.driver,
                job,
            )
        }

        fn drain(&self) -> Vec<Frame> {
            let mut frames = Vec::new();
            while let Some((identity, frame)) = self.bound.recv_routed_timeout(200).unwrap() {
                assert_eq!(identity, "w1");
                frames.push(frame);
            }
            frames
        }
    }

    fn run_job(command: &str) -> JobItem {
        let mut job = JobItem::new(VerbPayload::Run {
            command: command.to_string(),
            no_block: false,
        });
        job.job_id = directord_protocol::get_uuid();
        job.parent_id = directord_protocol::get_uuid();
        job.job_sha3_224 = job_sha3_224(&job).unwrap();
        job
    }

    #[test]
    fn test_successful_run_reports_processing_then_end() {
        let harness = Harness::new("success");
        harness.handle(&run_job("echo hi"));

        let frames = harness.drain();
        let controls: Vec<_> = frames.iter().map(|f| f.control).collect();
        assert_eq!(
            controls,
            vec![Some(Control::JobProcessing), Some(Control::JobEnd)]
        );
        assert_eq!(frames[1].stdout_string().trim(), "hi");
    }

    #[test]
    fn test_terminal_state_is_persisted() {
        let harness = Harness::new("persist");
        let job = run_job("echo persisted");
        harness.handle(&job);
        assert_eq!(
            harness.cache.get(&job.job_sha3_224),
            Some(serde_json::Value::String("JOB_END".to_string()))
        );
    }

    #[test]
    fn test_cache_hit_skips_execution() {
        let dir = tempfile::tempdir().unwrap();
        let witness = dir.path().join("ran");
        let harness = Harness::new("cached");
        let job = run_job(&format!("touch {}", witness.display()));

        harness.handle(&job);
        assert!(witness.exists());
        std::fs::remove_file(&witness).unwrap();
        harness.drain();

        harness.handle(&job);
        let frames = harness.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].control, Some(Control::JobEnd));
        assert_eq!(frames[0].info, "job skipped");
        assert!(!witness.exists(), "cached job must not re-execute");
    }

    #[test]
    fn test_skip_cache_forces_execution() {
        let harness = Harness::new("skip-cache");
        let mut job = run_job("echo again");
        job.skip_cache = true;
        harness.handle(&job);
        harness.drain();

        harness.handle(&job);
        let frames = harness.drain();
        assert_eq!(frames.len(), 2, "skip_cache must bypass the fingerprint cache");
    }

    #[test]
    fn test_parent_failure_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let witness = dir.path().join("never");
        let harness = Harness::new("parent");

        let failing = run_job("exit 1");
        harness.handle(&failing);
        harness.drain();

        let mut second = run_job(&format!("touch {}", witness.display()));
        second.parent_id = failing.parent_id.clone();
        harness.handle(&second);

        let frames = harness.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].control, Some(Control::JobFailed));
        assert!(frames[0].info.contains("was not allowed to run"));
        assert!(!witness.exists(), "short-circuited job must not execute");
        assert_eq!(
            harness.cache.get(&second.job_sha3_224),
            Some(serde_json::Value::String("JOB_FAILED".to_string()))
        );
    }

    #[test]
    fn test_parent_async_bypass_allows_execution() {
        let harness = Harness::new("bypass");

        let failing = run_job("exit 1");
        harness.handle(&failing);
        harness.drain();

        let mut second = run_job("echo bypassed");
        second.parent_id = failing.parent_id.clone();
        second.parent_async_bypass = true;
        harness.handle(&second);

        let frames = harness.drain();
        assert_eq!(frames.last().unwrap().control, Some(Control::JobEnd));
    }

    #[test]
    fn test_stdout_arg_produces_follow_on() {
        let harness = Harness::new("follow-on");
        let mut job = run_job("echo captured-value");
        job.stdout_arg = Some("result".to_string());

        let follow_on = harness.handle(&job);
        assert_eq!(follow_on.len(), 1);
        assert_eq!(follow_on[0].verb(), "ARG");
    }

    #[test]
    fn test_poll_interval_ramp() {
        assert_eq!(intervals::poll_interval(1.0), intervals::ACTIVE_MS);
        assert_eq!(intervals::poll_interval(40.0), intervals::RAMP_DOWN_MS);
        assert_eq!(intervals::poll_interval(70.0), intervals::IDLE_MS);
    }
}
