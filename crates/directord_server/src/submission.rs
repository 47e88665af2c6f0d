//! Local submission socket.
//!
//! One UTF-8 JSON object per accept. Management requests answer with a
//! serialized view; anything else is treated as a job submission, gets
//! its ids and fingerprint assigned, passes the restrict filter and is
//! queued for dispatch.

use crate::State;
use anyhow::{Context, Result};
use directord_protocol::{
    current_time, get_uuid, job_sha3_224, JobItem, ManageEnvelope, ManageRequest,
};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Submissions are capped at ten megabytes.
const MAX_SUBMISSION_BYTES: u64 = 10 * 1024 * 1024;

pub fn run_socket_server(state: Arc<State>, socket_path: PathBuf) {
    if socket_path.exists() {
        if let Err(e) = std::fs::remove_file(&socket_path) {
            error!(
                "Socket path {} already exists and wasn't able to be cleaned up: {e}",
                socket_path.display()
            );
            return;
        }
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", socket_path.display());
            return;
        }
    };

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(e) = handle_connection(&state, stream) {
                    warn!("Submission handling failed: {e}");
                }
            }
            Err(e) => warn!("Submission accept failed: {e}"),
        }
    }
}

fn handle_connection(state: &State, mut stream: UnixStream) -> Result<()> {
    let mut data = Vec::new();
    std::io::Read::by_ref(&mut stream)
        .take(MAX_SUBMISSION_BYTES)
        .read_to_end(&mut data)
        .context("Submission read failed")?;

    let value: Value = serde_json::from_slice(&data).context("Submission is not valid JSON")?;

    let reply = process_submission(state, value);
    if let Some(reply) = reply {
        stream
            .write_all(&reply)
            .context("Submission reply failed")?;
    }
    Ok(())
}

/// Process one submission object and produce the reply bytes, if any.
/// A restrict-filtered job is silently dropped.
pub(crate) fn process_submission(state: &State, value: Value) -> Option<Vec<u8>> {
    if value.get("manage").is_some() {
        let envelope: ManageEnvelope = match serde_json::from_value(value) {
            Ok(envelope) => envelope,
            Err(_) => return Some(serde_json::to_vec(&json!({"failed": true})).ok()?),
        };
        return Some(manage_reply(state, envelope.manage));
    }

    let mut job: JobItem = match serde_json::from_value(value) {
        Ok(job) => job,
        Err(e) => {
            warn!("Rejected submission: {e}");
            return Some(format!("Job rejected: {e}").into_bytes());
        }
    };

    if job.job_id.is_empty() {
        job.job_id = get_uuid();
    }
    if job.parent_id.is_empty() {
        job.parent_id = job.job_id.clone();
    }
    let sha = match job_sha3_224(&job) {
        Ok(sha) => sha,
        Err(e) => {
            warn!("Fingerprinting failed: {e}");
            return Some(format!("Job rejected: {e}").into_bytes());
        }
    };
    job.job_sha3_224 = sha.clone();
    if job.parent_sha3_224.is_empty() {
        job.parent_sha3_224 = sha.clone();
    }

    if let Some(restrict) = &job.restrict {
        if !restrict.contains(&sha) {
            debug!(
                "Task skipped. Task SHA3 {} doesn't match restriction {:?}",
                sha, restrict
            );
            return None;
        }
    }

    let reply = if job.return_raw {
        job.job_id.clone().into_bytes()
    } else {
        format!("Job received. Task ID: {}", job.job_id).into_bytes()
    };

    match serde_json::to_value(&job) {
        Ok(value) => {
            if let Err(e) = state.queue.put(value) {
                error!("Failed to queue job {}: {e}", job.job_id);
                return Some(format!("Job rejected: {e}").into_bytes());
            }
            debug!("Data sent to queue, {}", job.job_id);
        }
        Err(e) => {
            error!("Failed to serialize job {}: {e}", job.job_id);
            return Some(format!("Job rejected: {e}").into_bytes());
        }
    }

    Some(reply)
}

fn manage_reply(state: &State, request: ManageRequest) -> Vec<u8> {
    let now = current_time();
    let reply = match request {
        ManageRequest::ListNodes => {
            let nodes: Vec<Value> = state
                .workers
                .items()
                .into_iter()
                .map(|(identity, record)| {
                    json!([
                        identity,
                        {
                            "expiry": record.expiry - now,
                            "version": record.version,
                            "host_uptime": record.host_uptime,
                            "agent_uptime": record.agent_uptime,
                            "machine_id": record.machine_id,
                        }
                    ])
                })
                .collect();
            json!(nodes)
        }
        ManageRequest::ListJobs => {
            let jobs: Vec<Value> = state
                .jobs
                .items()
                .into_iter()
                .map(|(job_id, record)| json!([job_id, record]))
                .collect();
            json!(jobs)
        }
        ManageRequest::PurgeNodes => {
            state.workers.clear();
            json!({"success": true})
        }
        ManageRequest::PurgeJobs => {
            state.jobs.clear();
            json!({"success": true})
        }
    };
    serde_json::to_vec(&reply).unwrap_or_else(|_| b"{\"failed\": true}".to_vec())
}
