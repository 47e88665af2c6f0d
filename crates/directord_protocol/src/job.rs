//! The job item: one unit of dispatchable work.
//!
//! Job items travel as JSON in the `data` field of a job frame. The common
//! header (ids, fingerprints, targeting and flags) is shared by every verb;
//! the per-verb payload is a tagged union discriminated on `verb`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 600;

fn default_timeout() -> u64 {
    DEFAULT_JOB_TIMEOUT_SECS
}

fn default_retry() -> u32 {
    1
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_default_timeout(value: &u64) -> bool {
    *value == DEFAULT_JOB_TIMEOUT_SECS
}

fn is_default_retry(value: &u32) -> bool {
    *value == 1
}

/// One unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobItem {
    /// Unique job identifier, assigned by the coordinator when absent.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_id: String,

    /// Content fingerprint over the normalized item, see
    /// [`crate::fingerprint::job_sha3_224`].
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_sha3_224: String,

    /// Shared across every job expanded from one orchestration entry.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_sha3_224: String,

    /// Ordered worker identities; empty means all live workers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,

    /// Fingerprint allow-list; the submission is dropped when its own
    /// fingerprint is not a member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restrict: Option<Vec<String>>,

    /// Dispatch to the first live worker only.
    #[serde(default, skip_serializing_if = "is_false")]
    pub run_once: bool,

    /// Ignore the fingerprint cache on the worker.
    #[serde(default, skip_serializing_if = "is_false")]
    pub skip_cache: bool,

    #[serde(default = "default_timeout", skip_serializing_if = "is_default_timeout")]
    pub timeout: u64,

    /// Execution attempts before the result is treated as final.
    #[serde(default = "default_retry", skip_serializing_if = "is_default_retry")]
    pub retry: u32,

    /// Do not fail the parent when this job fails.
    #[serde(default, skip_serializing_if = "is_false")]
    pub parent_async_bypass: bool,

    /// Submitter wants the bare job id back rather than a human message.
    #[serde(default, skip_serializing_if = "is_false")]
    pub return_raw: bool,

    /// Store captured stdout under this argument name after execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_arg: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_arg: Option<String>,

    /// Extend (rather than overwrite) list values on argument merge.
    #[serde(default, skip_serializing_if = "is_false")]
    pub extend_args: bool,

    #[serde(flatten)]
    pub payload: VerbPayload,
}

impl JobItem {
    pub fn new(payload: VerbPayload) -> Self {
        JobItem {
            job_id: String::new(),
            job_sha3_224: String::new(),
            parent_id: String::new(),
            parent_sha3_224: String::new(),
            targets: Vec::new(),
            restrict: None,
            run_once: false,
            skip_cache: false,
            timeout: DEFAULT_JOB_TIMEOUT_SECS,
            retry: 1,
            parent_async_bypass: false,
            return_raw: false,
            stdout_arg: None,
            stderr_arg: None,
            extend_args: false,
            payload,
        }
    }

    pub fn verb(&self) -> &'static str {
        self.payload.verb()
    }

    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Per-verb payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "verb")]
pub enum VerbPayload {
    /// Run a templated shell command.
    #[serde(rename = "RUN")]
    Run {
        command: String,
        #[serde(default, skip_serializing_if = "is_false")]
        no_block: bool,
    },

    /// Pull a file from the coordinator in chunks. ADD is an alias.
    #[serde(rename = "COPY", alias = "ADD")]
    Copy {
        /// Source paths on the coordinator side.
        #[serde(rename = "from", default, skip_serializing_if = "Vec::is_empty")]
        sources: Vec<String>,
        /// Destination; a trailing separator means "directory".
        to: String,
        /// Resolved per-file destination, set at dispatch time.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_to: Option<String>,
        /// Source content fingerprint, precomputed at dispatch time.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_sha3_224: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
        #[serde(default, skip_serializing_if = "is_false")]
        blueprint: bool,
    },

    /// Merge a mapping into the worker argument cache.
    #[serde(rename = "ARG")]
    Arg { args: Map<String, Value> },

    /// Merge a mapping into the worker environment cache.
    #[serde(rename = "ENV")]
    Env { envs: Map<String, Value> },

    /// Merge the top-level mapping of a YAML file into the argument cache.
    #[serde(rename = "CACHEFILE")]
    Cachefile { cachefile: String },

    /// Evict a cache tag; the tag `all` clears the cache.
    #[serde(rename = "CACHEEVICT")]
    Cacheevict { cacheevict: String },

    /// Mint or create a work directory.
    #[serde(rename = "WORKDIR")]
    Workdir {
        workdir: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
        #[serde(default, skip_serializing_if = "is_false")]
        recursive: bool,
    },

    /// Report a locally cached argument back to the fabric.
    #[serde(rename = "QUERY")]
    Query {
        query: String,
        #[serde(default, skip_serializing_if = "is_false")]
        no_wait: bool,
    },

    /// Block until a query result is present in the local cache.
    #[serde(rename = "QUERY_WAIT")]
    QueryWait {
        item: String,
        #[serde(default = "default_timeout")]
        query_timeout: u64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        identity: Vec<String>,
    },

    /// Barrier on a job fingerprint across a set of workers.
    #[serde(rename = "JOB_WAIT")]
    JobWait {
        job_sha: String,
        identity: Vec<String>,
    },

    /// Wait for elapsed time, an HTTP endpoint, or a command.
    #[serde(rename = "WAIT")]
    Wait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seconds: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        /// Condition re-check attempts for the url and command modes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_wait: Option<u64>,
        #[serde(default, skip_serializing_if = "is_false")]
        insecure: bool,
    },

    /// Manage packages with dnf.
    #[serde(rename = "DNF")]
    Dnf {
        packages: Vec<String>,
        /// present | latest | absent
        state: String,
        #[serde(default, skip_serializing_if = "is_false")]
        clear_metadata: bool,
    },

    /// Manage services with systemd.
    #[serde(rename = "SERVICE")]
    Service {
        services: Vec<String>,
        /// enable | disable, optional
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<String>,
        /// start | stop | restart
        #[serde(default, skip_serializing_if = "Option::is_none")]
        running: Option<String>,
        #[serde(default, skip_serializing_if = "is_false")]
        daemon_reload: bool,
    },

    /// Render and return the given content.
    #[serde(rename = "ECHO")]
    Echo { content: String },
}

impl VerbPayload {
    pub fn verb(&self) -> &'static str {
        match self {
            VerbPayload::Run { .. } => "RUN",
            VerbPayload::Copy { .. } => "COPY",
            VerbPayload::Arg { .. } => "ARG",
            VerbPayload::Env { .. } => "ENV",
            VerbPayload::Cachefile { .. } => "CACHEFILE",
            VerbPayload::Cacheevict { .. } => "CACHEEVICT",
            VerbPayload::Workdir { .. } => "WORKDIR",
            VerbPayload::Query { .. } => "QUERY",
            VerbPayload::QueryWait { .. } => "QUERY_WAIT",
            VerbPayload::JobWait { .. } => "JOB_WAIT",
            VerbPayload::Wait { .. } => "WAIT",
            VerbPayload::Dnf { .. } => "DNF",
            VerbPayload::Service { .. } => "SERVICE",
            VerbPayload::Echo { .. } => "ECHO",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_item_roundtrip() {
        let mut job = JobItem::new(VerbPayload::Run {
            command: "echo hi".to_string(),
            no_block: false,
        });
        job.job_id = "a".to_string();
        job.targets = vec!["w1".to_string()];

        let bytes = job.to_json().unwrap();
        let decoded = JobItem::from_json(&bytes).unwrap();
        assert_eq!(decoded, job);
        assert_eq!(decoded.verb(), "RUN");
    }

    #[test]
    fn test_add_is_copy_alias() {
        let job: JobItem =
            serde_json::from_str(r#"{"verb":"ADD","from":["/tmp/a"],"to":"/tmp/b"}"#).unwrap();
        assert_eq!(job.verb(), "COPY");
        match &job.payload {
            VerbPayload::Copy { sources, to, .. } => {
                assert_eq!(sources, &["/tmp/a".to_string()]);
                assert_eq!(to, "/tmp/b");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_defaults_applied() {
        let job: JobItem = serde_json::from_str(r#"{"verb":"RUN","command":"true"}"#).unwrap();
        assert_eq!(job.timeout, DEFAULT_JOB_TIMEOUT_SECS);
        assert_eq!(job.retry, 1);
        assert!(!job.skip_cache);
        assert!(job.targets.is_empty());
    }

    #[test]
    fn test_unknown_verb_rejected() {
        let result: Result<JobItem, _> = serde_json::from_str(r#"{"verb":"NOPE"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_query_payload() {
        let job: JobItem =
            serde_json::from_str(r#"{"verb":"QUERY","query":"origin","targets":["w1","w2"]}"#)
                .unwrap();
        assert_eq!(job.verb(), "QUERY");
        assert_eq!(job.targets.len(), 2);
    }
}
