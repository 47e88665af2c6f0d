//! Dispatch and result loop.
//!
//! Dequeues pending jobs toward their resolved targets, folds worker
//! status frames into job records, serves backend chunk requests, and
//! relays coordination frames between workers. Polling idles down when
//! the fabric is quiet.

use crate::State;
use anyhow::{Context, Result};
use base64::Engine;
use directord_protocol::{
    current_time, file_sha3_224, get_uuid, job_sha3_224, Control, Frame, JobItem, JobRecord,
    VerbPayload, TRANSFER_CHUNK_SIZE,
};
use directord_transport::{Channel, Driver};
use serde_json::{Map, Value};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const ACTIVE_MS: i64 = 128;
const RAMP_DOWN_MS: i64 = 1_024;
const IDLE_MS: i64 = 2_048;
const RAMP_DOWN_AFTER_SECS: f64 = 32.0;
const IDLE_AFTER_SECS: f64 = 64.0;

pub fn run_interactions(driver: Arc<Driver>, state: Arc<State>) -> Result<()> {
    let job_channel = driver.job_bind().context("Job channel bind failed")?;
    let backend_channel = driver.backend_bind().context("Backend channel bind failed")?;

    let mut poller_time = current_time();
    let mut poller_interval = RAMP_DOWN_MS;

    loop {
        let idle_for = current_time() - poller_time;
        let next_interval = if idle_for > IDLE_AFTER_SECS {
            IDLE_MS
        } else if idle_for > RAMP_DOWN_AFTER_SECS {
            RAMP_DOWN_MS
        } else {
            ACTIVE_MS
        };
        if next_interval == IDLE_MS && poller_interval != IDLE_MS {
            info!("Directord server entering idle state.");
        } else if next_interval == RAMP_DOWN_MS && poller_interval == ACTIVE_MS {
            info!("Directord server ramping down.");
        }
        poller_interval = next_interval;

        let mut active = false;
        match backend_channel.recv_routed_timeout(0) {
            Ok(Some((identity, frame))) => {
                handle_backend(&state, &backend_channel, &identity, &frame);
                active = true;
            }
            Ok(None) => match job_channel.recv_routed_timeout(poller_interval) {
                Ok(Some((identity, frame))) => {
                    handle_status(&state, &job_channel, &identity, &frame);
                    active = true;
                }
                Ok(None) => {
                    if !state.queue.is_empty() {
                        active = dispatch_one(&state, &job_channel);
                    }
                }
                Err(e) => warn!("Job channel receive failed: {e}"),
            },
            Err(e) => warn!("Backend channel receive failed: {e}"),
        }

        if active {
            poller_time = current_time();
        }
    }
}

/// Fold one worker status frame into its job record.
pub(crate) fn handle_status(state: &State, channel: &Channel, identity: &str, frame: &Frame) {
    let Some(control) = frame.control else {
        return;
    };

    match state.jobs.get(&frame.msg_id) {
        Some(mut record) => {
            record.apply_status(
                control,
                identity,
                &frame.info,
                &frame.stdout_string(),
                &frame.stderr_string(),
                current_time(),
            );
            state.jobs.set(&frame.msg_id, record);
        }
        None => {
            debug!(
                "Status [ {} ] for unknown job [ {} ] from [ {} ]",
                control, frame.msg_id, identity
            );
        }
    }

    if control == Control::JobEnd && frame.command == "QUERY" {
        query_fan_out(state, channel, identity, frame);
    }
}

/// Rebroadcast a query answer to every live worker as a synthetic ARG
/// job, so each learns the answering node's value.
fn query_fan_out(state: &State, channel: &Channel, identity: &str, frame: &Frame) {
    let Ok(Value::Object(answer)) = serde_json::from_slice::<Value>(&frame.stdout) else {
        return;
    };
    let Some((key, value)) = answer.into_iter().next() else {
        return;
    };
    if value.is_null() {
        return;
    }

    let mut query_map = Map::new();
    let mut node_map = Map::new();
    node_map.insert(key, value);
    query_map.insert(identity.to_string(), Value::Object(node_map));
    let mut args = Map::new();
    args.insert("query".to_string(), Value::Object(query_map));

    let mut job = JobItem::new(VerbPayload::Arg { args });
    job.skip_cache = true;
    job.extend_args = true;
    job.job_id = get_uuid();
    job.parent_id = job.job_id.clone();
    if let Ok(sha) = job_sha3_224(&job) {
        job.job_sha3_224 = sha.clone();
        job.parent_sha3_224 = sha;
    }

    let now = current_time();
    let targets: Vec<String> = live_workers(state, now);
    if targets.is_empty() {
        return;
    }
    job.targets = targets.clone();

    let record = JobRecord::new(job.clone(), targets.clone(), now);
    state.jobs.set(&job.job_id, record);

    let Ok(data) = job.to_json() else {
        return;
    };
    for target in &targets {
        let frame = Frame {
            msg_id: job.job_id.clone(),
            control: None,
            command: job.verb().to_string(),
            data: data.clone(),
            ..Frame::default()
        };
        if let Err(e) = channel.send_to(target, &frame) {
            warn!("Query fan-out to [ {} ] failed: {e}", target);
        }
    }
}

/// Dequeue and dispatch one pending job. Returns whether work happened.
pub(crate) fn dispatch_one(state: &State, channel: &Channel) -> bool {
    let Some(value) = state.queue.get() else {
        return false;
    };
    let job: JobItem = match serde_json::from_value(value) {
        Ok(job) => job,
        Err(e) => {
            error!("Discarding undecodable queued job: {e}");
            return true;
        }
    };

    let now = current_time();
    let live = live_workers(state, now);

    // QUERY always fans out to every live worker.
    let run_query = job.verb() == "QUERY";
    let mut targets = if !job.targets.is_empty() && !run_query {
        let selected: Vec<String> = job
            .targets
            .iter()
            .filter(|target| live.contains(target))
            .cloned()
            .collect();
        if selected.is_empty() {
            warn!(
                "Targets {:?} are in an unknown state; job {} dropped.",
                job.targets, job.job_id
            );
            return true;
        }
        selected
    } else {
        live
    };
    if targets.is_empty() {
        warn!("No live workers; job {} dropped.", job.job_id);
        return true;
    }
    if job.run_once && !run_query {
        debug!("Run once enabled.");
        targets.truncate(1);
    }

    let mut record = state
        .jobs
        .get(&job.job_id)
        .unwrap_or_else(|| JobRecord::new(job.clone(), targets.clone(), now));

    if let VerbPayload::Copy { .. } = &job.payload {
        dispatch_transfers(channel, &job, &targets, &mut record);
    } else {
        match job.to_json() {
            Ok(data) => {
                for target in &targets {
                    let frame = Frame {
                        msg_id: job.job_id.clone(),
                        control: None,
                        command: job.verb().to_string(),
                        data: data.clone(),
                        ..Frame::default()
                    };
                    match channel.send_to(target, &frame) {
                        Ok(()) => debug!("Sent job {} to {}", job.job_id, target),
                        Err(e) => warn!("Dispatch of {} to {} failed: {e}", job.job_id, target),
                    }
                }
            }
            Err(e) => error!("Failed to serialize job {}: {e}", job.job_id),
        }
    }

    state.jobs.set(&job.job_id, record);
    true
}

/// One dispatch frame per source file, each carrying the resolved
/// destination and the precomputed content fingerprint.
fn dispatch_transfers(channel: &Channel, job: &JobItem, targets: &[String], record: &mut JobRecord) {
    let VerbPayload::Copy {
        sources,
        to,
        user,
        group,
        mode,
        blueprint,
        ..
    } = &job.payload
    else {
        return;
    };

    for source in sources {
        let source_path = Path::new(source);
        let sha = match file_sha3_224(source_path) {
            Ok(sha) => sha,
            Err(e) => {
                warn!("File was not found. File path:{source} ({e})");
                continue;
            }
        };

        let file_to = if to.ends_with(std::path::MAIN_SEPARATOR) {
            let basename = source_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!("{to}{basename}")
        } else {
            to.clone()
        };
        if !record.transfers.contains(&file_to) {
            record.transfers.push(file_to.clone());
        }

        let mut per_file = job.clone();
        per_file.payload = VerbPayload::Copy {
            sources: vec![source.clone()],
            to: to.clone(),
            file_to: Some(file_to),
            file_sha3_224: Some(sha),
            user: user.clone(),
            group: group.clone(),
            mode: *mode,
            blueprint: *blueprint,
        };
        let Ok(data) = per_file.to_json() else {
            continue;
        };

        for target in targets {
            debug!(
                "Sending file transfer message for file_path:{} to identity:{}",
                source, target
            );
            let frame = Frame {
                msg_id: job.job_id.clone(),
                control: None,
                command: job.verb().to_string(),
                data: data.clone(),
                info: source.clone(),
                ..Frame::default()
            };
            if let Err(e) = channel.send_to(target, &frame) {
                warn!("Transfer dispatch of {} to {} failed: {e}", job.job_id, target);
            }
        }
    }
}

/// Backend traffic: chunk requests, transfer finalization and
/// worker-to-worker coordination relays.
pub(crate) fn handle_backend(state: &State, channel: &Channel, identity: &str, frame: &Frame) {
    match frame.control {
        Some(Control::TransferStart) => serve_chunk(channel, identity, frame),
        Some(Control::TransferEnd) => {
            if let Some(mut record) = state.jobs.get(&frame.msg_id) {
                record.apply_status(
                    Control::TransferEnd,
                    identity,
                    &frame.info,
                    "",
                    "",
                    current_time(),
                );
                state.jobs.set(&frame.msg_id, record);
            }
        }
        Some(Control::CoordinationNotice)
        | Some(Control::CoordinationAck)
        | Some(Control::CoordinationFailed) => relay_coordination(channel, identity, frame),
        other => debug!("Backend loop ignoring control [ {other:?} ]"),
    }
}

/// Answer a chunk request at the worker-supplied offset and size.
fn serve_chunk(channel: &Channel, identity: &str, frame: &Frame) {
    let path = Path::new(&frame.info);
    let offset: u64 = frame.command.parse().unwrap_or(0);
    let size: usize = frame
        .data_string()
        .parse()
        .unwrap_or(TRANSFER_CHUNK_SIZE)
        .min(TRANSFER_CHUNK_SIZE);

    if !path.is_file() {
        error!("File was not found. File path:{}", frame.info);
        let failure = Frame::status(&frame.msg_id, Control::JobFailed)
            .with_info(format!("File was not found. File path:{}", frame.info));
        if let Err(e) = channel.send_to(identity, &failure) {
            warn!("Transfer failure reply to [ {} ] failed: {e}", identity);
        }
        return;
    }

    let chunk = read_chunk(path, offset, size);
    let (chunk, last) = match chunk {
        Ok(result) => result,
        Err(e) => {
            let failure = Frame::status(&frame.msg_id, Control::JobFailed)
                .with_info(format!("Chunk read failed: {e}"));
            if let Err(e) = channel.send_to(identity, &failure) {
                warn!("Transfer failure reply to [ {} ] failed: {e}", identity);
            }
            return;
        }
    };

    let control = if last {
        Control::TransferEnd
    } else {
        Control::JobProcessing
    };
    let encoded = base64::engine::general_purpose::STANDARD.encode(&chunk);
    let reply = Frame::status(&frame.msg_id, control)
        .with_data(encoded.into_bytes())
        .with_info(&frame.info);
    if let Err(e) = channel.send_to(identity, &reply) {
        warn!("Chunk send to [ {} ] failed: {e}", identity);
    }
}

fn read_chunk(path: &Path, offset: u64, size: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut file = std::fs::File::open(path)?;
    let length = file.metadata()?.len();
    file.seek(SeekFrom::Start(offset))?;

    let mut buffer = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let read = file.read(&mut buffer[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    buffer.truncate(filled);
    let last = offset + filled as u64 >= length;
    Ok((buffer, last))
}

/// Forward a coordination frame to the worker named in `info`,
/// rewriting `info` to the sender so the peer knows who to answer.
fn relay_coordination(channel: &Channel, identity: &str, frame: &Frame) {
    let target = frame.info.clone();
    debug!(
        "Relaying {} from [ {} ] to [ {} ]",
        frame.control.map(|c| c.as_str()).unwrap_or("?"),
        identity,
        target
    );
    let mut relayed = frame.clone();
    relayed.info = identity.to_string();
    if let Err(e) = channel.send_to(&target, &relayed) {
        debug!("Coordination relay to [ {} ] failed: {e}", target);
    }
}

fn live_workers(state: &State, now: f64) -> Vec<String> {
    let mut workers: Vec<String> = state
        .workers
        .items()
        .into_iter()
        .filter(|(_, record)| record.is_live(now))
        .map(|(identity, _)| identity)
        .collect();
    workers.sort_unstable();
    workers
}
