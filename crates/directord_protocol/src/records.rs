//! Coordinator-side bookkeeping records.

use crate::{Control, JobItem};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle record for one dispatched job, keyed by job id.
///
/// Field names mirror the management API: uppercase for operator-facing
/// state, underscore-prefixed for internal timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    #[serde(rename = "ACCEPTED")]
    pub accepted: bool,

    #[serde(rename = "PROCESSING")]
    pub processing: bool,

    #[serde(rename = "VERB")]
    pub verb: String,

    /// Every worker the job was dispatched to.
    #[serde(rename = "NODES")]
    pub nodes: Vec<String>,

    #[serde(rename = "INFO")]
    pub info: HashMap<String, String>,

    #[serde(rename = "STDOUT")]
    pub stdout: HashMap<String, String>,

    #[serde(rename = "STDERR")]
    pub stderr: HashMap<String, String>,

    #[serde(rename = "SUCCESS")]
    pub success: Vec<String>,

    #[serde(rename = "FAILED")]
    pub failed: Vec<String>,

    #[serde(rename = "TRANSFERS")]
    pub transfers: Vec<String>,

    #[serde(rename = "PARENT_JOB_ID")]
    pub parent_job_id: String,

    #[serde(rename = "TASK_SHA3_224")]
    pub task_sha3_224: String,

    #[serde(rename = "JOB_DEFINITION")]
    pub job_definition: JobItem,

    #[serde(rename = "_createtime")]
    pub createtime: f64,

    #[serde(rename = "_starttime", default, skip_serializing_if = "Option::is_none")]
    pub starttime: Option<f64>,

    #[serde(rename = "EXECUTION_TIME")]
    pub execution_time: f64,

    #[serde(rename = "TOTAL_ROUNDTRIP_TIME")]
    pub total_roundtrip_time: f64,
}

impl JobRecord {
    pub fn new(job: JobItem, nodes: Vec<String>, createtime: f64) -> Self {
        JobRecord {
            accepted: true,
            processing: false,
            verb: job.verb().to_string(),
            nodes,
            info: HashMap::new(),
            stdout: HashMap::new(),
            stderr: HashMap::new(),
            success: Vec::new(),
            failed: Vec::new(),
            transfers: Vec::new(),
            parent_job_id: job.parent_id.clone(),
            task_sha3_224: job.job_sha3_224.clone(),
            job_definition: job,
            createtime,
            starttime: None,
            execution_time: 0.0,
            total_roundtrip_time: 0.0,
        }
    }

    /// Apply one worker status frame to this record.
    pub fn apply_status(
        &mut self,
        control: Control,
        identity: &str,
        info: &str,
        stdout: &str,
        stderr: &str,
        now: f64,
    ) {
        if !info.is_empty() {
            self.info.insert(identity.to_string(), info.to_string());
        }
        if !stdout.is_empty() {
            self.stdout.insert(identity.to_string(), stdout.to_string());
        }
        if !stderr.is_empty() {
            self.stderr.insert(identity.to_string(), stderr.to_string());
        }

        match control {
            Control::JobAck => {
                if self.createtime == 0.0 {
                    self.createtime = now;
                }
            }
            Control::JobProcessing => {
                self.processing = true;
                if self.starttime.is_none() {
                    self.starttime = Some(now);
                }
            }
            Control::JobEnd | Control::Null | Control::TransferEnd => {
                self.processing = false;
                self.record_node(identity, true);
                self.record_timings(now);
            }
            Control::JobFailed => {
                self.processing = false;
                self.record_node(identity, false);
                self.record_timings(now);
            }
            _ => {}
        }
    }

    /// A worker lands in exactly one of SUCCESS or FAILED once terminal.
    fn record_node(&mut self, identity: &str, success: bool) {
        let identity = identity.to_string();
        self.success.retain(|node| node != &identity);
        self.failed.retain(|node| node != &identity);
        if success {
            self.success.push(identity);
        } else {
            self.failed.push(identity);
        }
    }

    fn record_timings(&mut self, now: f64) {
        if let Some(started) = self.starttime {
            self.execution_time = now - started;
        }
        if self.createtime > 0.0 {
            self.total_roundtrip_time = now - self.createtime;
        }
    }
}

/// Liveness record for one worker, keyed by identity.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct WorkerRecord {
    pub expiry: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_uptime: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_uptime: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
}

impl WorkerRecord {
    pub fn is_live(&self, now: f64) -> bool {
        now <= self.expiry
    }
}
