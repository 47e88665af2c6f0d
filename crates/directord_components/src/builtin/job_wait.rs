//! JOB_WAIT: barrier on a job fingerprint across a worker set.
//!
//! The executing worker opens an ephemeral backend channel and exchanges
//! coordination frames with each named peer; the coordinator relays them
//! between workers. A peer acknowledges once its own cache holds a
//! terminal state for the fingerprint.

use crate::{exec_argv, Component, CommonExecArgs, ParsedExec, TaskContext, TaskOutcome};
use clap::Parser;
use directord_cache::Cache;
use directord_protocol::{Control, Frame, JobItem, VerbPayload};
use directord_transport::Channel;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, error, warn};

/// How long a peer polls its cache for the fingerprint: 2400 x 250 ms.
const CACHE_POLL_ATTEMPTS: u32 = 2_400;
const CACHE_POLL_SLEEP_MS: u64 = 250;

/// Poll interval while draining coordination replies.
const REPLY_POLL_MS: i64 = 500;

#[derive(Parser, Debug)]
#[command(name = "JOB_WAIT", about = "Process coordination commands", disable_help_flag = true)]
struct JobWaitExec {
    #[command(flatten)]
    common: CommonExecArgs,

    /// Worker identities the fingerprint must be terminal on; repeatable.
    #[arg(long = "identity", required = true)]
    identity: Vec<String>,

    /// Job fingerprint to be completed.
    sha: String,
}

pub struct JobWait;

impl Component for JobWait {
    fn verb(&self) -> &'static str {
        "JOB_WAIT"
    }

    fn cacheable(&self) -> bool {
        false
    }

    // The barrier carries its own per-peer deadline.
    fn timeout_enforced(&self) -> bool {
        false
    }

    fn server(&self, exec: &[String]) -> anyhow::Result<ParsedExec> {
        let parsed = JobWaitExec::try_parse_from(exec_argv("JOB_WAIT", exec))?;
        Ok(ParsedExec::new(
            VerbPayload::JobWait {
                job_sha: parsed.sha,
                identity: parsed.identity,
            },
            parsed.common,
        ))
    }

    fn client(&self, ctx: &mut TaskContext, job: &JobItem) -> TaskOutcome {
        let VerbPayload::JobWait { job_sha, identity } = &job.payload else {
            return TaskOutcome::failure("JOB_WAIT received a mismatched payload");
        };

        if identity.is_empty() {
            return TaskOutcome::success(None, Some("No identities to process".to_string()));
        }

        // Notify self last so local work settles before the local check.
        let mut pending: Vec<String> = identity
            .iter()
            .filter(|node| *node != ctx.identity())
            .cloned()
            .collect();
        if identity.iter().any(|node| node == ctx.identity()) {
            pending.push(ctx.identity().to_string());
        }

        let channel = match ctx.driver.backend_connect_ephemeral(&job.job_id) {
            Ok(channel) => channel,
            Err(e) => return TaskOutcome::failure(format!("Coordination never started: {e}")),
        };
        let result = run_barrier(&channel, &ctx.cache, job, job_sha, identity, pending);
        let _ = channel.close();
        result
    }
}

fn run_barrier(
    channel: &Channel,
    cache: &Cache,
    job: &JobItem,
    job_sha: &str,
    identity: &[String],
    mut pending: Vec<String>,
) -> TaskOutcome {
    let expected: BTreeSet<String> = identity.iter().cloned().collect();
    let mut confirmed: BTreeSet<String> = BTreeSet::new();
    let mut all_sent = false;

    loop {
        if !pending.is_empty() {
            let target = pending.remove(0);
            let frame = Frame::status(&job.job_id, Control::CoordinationNotice)
                .with_data(job_sha.as_bytes().to_vec())
                .with_info(&*target);
            if let Err(e) = channel.send(&frame) {
                return TaskOutcome::failure(format!("Coordination send failure: {e}"));
            }
            debug!(
                "Job [ {} ] coordination notice sent to {}",
                job.job_id, target
            );
            all_sent = pending.is_empty();
        }

        let frame = match channel.recv_timeout(REPLY_POLL_MS) {
            Ok(frame) => frame,
            Err(e) => return TaskOutcome::failure(format!("Coordination recv failure: {e}")),
        };

        match frame {
            Some(frame) => match frame.control {
                Some(Control::CoordinationNotice) => {
                    answer_coordination(channel, cache, &frame);
                }
                Some(Control::CoordinationAck) => {
                    let peer = bare_identity(&frame.info).to_string();
                    debug!(
                        "Job [ {} ] coordination ACK for [ {} ] received",
                        frame.msg_id, peer
                    );
                    confirmed.insert(peer);
                }
                Some(Control::CoordinationFailed) => {
                    let peer = bare_identity(&frame.info).to_string();
                    error!(
                        "Job [ {} ] coordination failed from [ {} ]",
                        frame.msg_id, peer
                    );
                    return TaskOutcome {
                        stdout: Some(frame.stdout_string()),
                        stderr: Some(frame.stderr_string()),
                        outcome: false,
                        info: Some(format!(
                            "Job [ {} ] failed when attempting coordination with [ {peer} ]",
                            frame.msg_id
                        )),
                    };
                }
                other => {
                    warn!("Unknown coordination control received [ {other:?} ]");
                }
            },
            None => {
                if all_sent && confirmed == expected {
                    debug!(
                        "Job [ {} ] coordination with {:?} success",
                        job.job_id, confirmed
                    );
                    return TaskOutcome::success(
                        Some(format!("Job completed, found SHA [ {job_sha} ]")),
                        Some(format!(
                            "Job [ {} ] completed on all coordinated targets: {identity:?}",
                            job.job_id
                        )),
                    );
                }
                debug!(
                    "Waiting for coordination messages from {:?}",
                    expected.difference(&confirmed).collect::<Vec<_>>()
                );
            }
        }
    }
}

/// Per-job backend channels carry a `:suffix` after the worker identity;
/// barrier membership is tracked by the bare identity.
fn bare_identity(wire_identity: &str) -> &str {
    wire_identity
        .split_once(':')
        .map(|(bare, _)| bare)
        .unwrap_or(wire_identity)
}

/// Answer an incoming coordination notice: poll the local cache for a
/// terminal state under the requested fingerprint, then acknowledge.
///
/// Shared with the worker's resident backend loop, which answers notices
/// while no barrier verb is executing.
pub fn answer_coordination(channel: &Channel, cache: &Cache, frame: &Frame) {
    let requested_sha = frame.data_string();
    let peer = frame.info.clone();
    debug!(
        "Job [ {} ] coordination notice received from [ {} ]",
        frame.msg_id, peer
    );

    for _ in 0..CACHE_POLL_ATTEMPTS {
        if let Some(state) = cache.get(&requested_sha) {
            let state = state.as_str().unwrap_or_default().to_string();
            if state == Control::JobEnd.as_str() || state == Control::JobFailed.as_str() {
                debug!(
                    "Job [ {} ] coordination complete for [ {} ]",
                    frame.msg_id, peer
                );
                let reply = Frame::status(&frame.msg_id, Control::CoordinationAck).with_info(&*peer);
                if let Err(e) = channel.send(&reply) {
                    error!("Coordination ack send failure: {e}");
                }
                return;
            }
        }
        std::thread::sleep(Duration::from_millis(CACHE_POLL_SLEEP_MS));
    }

    debug!(
        "Job [ {} ] expected SHA [ {} ] was not found.",
        frame.msg_id, requested_sha
    );
    let reply = Frame::status(&frame.msg_id, Control::CoordinationFailed)
        .with_info(&*peer)
        .with_stderr(b"Item was not found in cache".to_vec());
    if let Err(e) = channel.send(&reply) {
        error!("Coordination failure send failure: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_identity_strips_channel_suffix() {
        assert_eq!(bare_identity("w1:job-abc"), "w1");
        assert_eq!(bare_identity("w1"), "w1");
    }

    #[test]
    fn test_server_requires_identity() {
        let exec = vec!["abc123".to_string()];
        assert!(JobWait.server(&exec).is_err());
    }

    #[test]
    fn test_server_collects_identities() {
        let exec: Vec<String> = ["--identity", "w1", "--identity", "w2", "abc123"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let parsed = JobWait.server(&exec).unwrap();
        match parsed.payload {
            VerbPayload::JobWait { job_sha, identity } => {
                assert_eq!(job_sha, "abc123");
                assert_eq!(identity, vec!["w1".to_string(), "w2".to_string()]);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_empty_identity_set_is_a_noop() {
        use directord_transport::{Driver, DriverConfig};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(Cache::open(dir.path().join("cache")).unwrap());
        let driver = Arc::new(Driver::new(DriverConfig::new(
            "inproc://job-wait-test",
            "w1",
        )));
        let mut ctx = TaskContext::new(cache, driver);

        let job = JobItem::new(VerbPayload::JobWait {
            job_sha: "abc".to_string(),
            identity: vec![],
        });
        let outcome = JobWait.client(&mut ctx, &job);
        assert!(outcome.outcome);
        assert_eq!(outcome.info.as_deref(), Some("No identities to process"));
    }
}
