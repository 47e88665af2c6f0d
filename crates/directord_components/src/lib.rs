//! Verb components.
//!
//! Every verb a worker can execute is a [`Component`]: a server-side
//! parser that turns an orchestration exec string into a typed payload,
//! and a client-side executor that runs against the worker cache and
//! returns the four-tuple outcome `(stdout, stderr, outcome, info)`.
//!
//! The execution pipeline in [`executor`] reifies the decorator stack of
//! retry, timeout and output-capture follow-on jobs; components stay
//! synchronous and oblivious to it.

pub mod blueprint;
pub mod builtin;
pub mod command;
pub mod executor;
pub mod fsops;
pub mod registry;

pub use executor::Executor;
pub use registry::Registry;

use directord_cache::Cache;
use directord_protocol::{JobItem, VerbPayload};
use directord_transport::Driver;
use std::sync::Arc;

/// The four-tuple every component execution produces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutcome {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub outcome: bool,
    pub info: Option<String>,
}

impl TaskOutcome {
    pub fn success(stdout: Option<String>, info: Option<String>) -> Self {
        TaskOutcome {
            stdout,
            stderr: None,
            outcome: true,
            info,
        }
    }

    pub fn failure(stderr: impl Into<String>) -> Self {
        TaskOutcome {
            stdout: None,
            stderr: Some(stderr.into()),
            outcome: false,
            info: None,
        }
    }

    pub fn failure_with_info(stderr: impl Into<String>, info: impl Into<String>) -> Self {
        TaskOutcome {
            stdout: None,
            stderr: Some(stderr.into()),
            outcome: false,
            info: Some(info.into()),
        }
    }
}

/// Shared state handed to a component execution.
pub struct TaskContext {
    pub cache: Arc<Cache>,
    pub driver: Arc<Driver>,
    /// Synthetic follow-on jobs the worker enqueues to itself before the
    /// next receive.
    pub block_on_tasks: Vec<JobItem>,
}

impl TaskContext {
    pub fn new(cache: Arc<Cache>, driver: Arc<Driver>) -> Self {
        TaskContext {
            cache,
            driver,
            block_on_tasks: Vec::new(),
        }
    }

    pub fn identity(&self) -> &str {
        self.driver.identity()
    }

    /// The worker argument cache as a plain map.
    pub fn args(&self) -> serde_json::Map<String, serde_json::Value> {
        self.cache.get_map("args")
    }

    pub fn envs(&self) -> serde_json::Map<String, serde_json::Value> {
        self.cache.get_map("envs")
    }
}

/// Header fields shared by every exec string.
#[derive(Debug, Clone, clap::Args)]
pub struct CommonExecArgs {
    /// Force the task to skip the on-client cache.
    #[arg(long)]
    pub skip_cache: bool,

    /// Force the task to run on the first available target only.
    #[arg(long)]
    pub run_once: bool,

    /// Action timeout in seconds.
    #[arg(long, default_value_t = directord_protocol::DEFAULT_JOB_TIMEOUT_SECS)]
    pub timeout: u64,

    /// Store the stdout of the command as a cached argument.
    #[arg(long)]
    pub stdout_arg: Option<String>,

    /// Store the stderr of the command as a cached argument.
    #[arg(long)]
    pub stderr_arg: Option<String>,
}

/// A parsed exec string: the common header plus the verb payload.
#[derive(Debug, Clone)]
pub struct ParsedExec {
    pub payload: VerbPayload,
    pub skip_cache: bool,
    pub run_once: bool,
    pub timeout: u64,
    pub retry: u32,
    pub stdout_arg: Option<String>,
    pub stderr_arg: Option<String>,
    pub extend_args: bool,
}

impl ParsedExec {
    pub fn new(payload: VerbPayload, common: CommonExecArgs) -> Self {
        ParsedExec {
            payload,
            skip_cache: common.skip_cache,
            run_once: common.run_once,
            timeout: common.timeout,
            retry: 1,
            stdout_arg: common.stdout_arg,
            stderr_arg: common.stderr_arg,
            extend_args: false,
        }
    }

    /// Build a submittable job item from the parsed exec.
    pub fn into_job(self) -> JobItem {
        let mut job = JobItem::new(self.payload);
        job.skip_cache = self.skip_cache;
        job.run_once = self.run_once;
        job.timeout = self.timeout;
        job.retry = self.retry;
        job.stdout_arg = self.stdout_arg;
        job.stderr_arg = self.stderr_arg;
        job.extend_args = self.extend_args;
        job
    }
}

/// One verb implementation.
pub trait Component: Send + Sync {
    fn verb(&self) -> &'static str;

    /// Whether a matching fingerprint in the `jobs` cache short-circuits
    /// execution.
    fn cacheable(&self) -> bool {
        true
    }

    /// Components sharing a lock name are mutually exclusive on a worker.
    fn lock_name(&self) -> Option<&'static str> {
        None
    }

    /// Whether the pipeline enforces the job timeout. Barrier verbs carry
    /// their own deadlines.
    fn timeout_enforced(&self) -> bool {
        true
    }

    /// Parse an exec string into a dispatchable payload.
    fn server(&self, exec: &[String]) -> anyhow::Result<ParsedExec>;

    /// Execute the payload on a worker.
    fn client(&self, ctx: &mut TaskContext, job: &JobItem) -> TaskOutcome;
}

/// Prefix `exec` with the verb so clap sees a well-formed argv.
pub(crate) fn exec_argv<'a>(
    verb: &'a str,
    exec: &'a [String],
) -> impl Iterator<Item = &'a str> + 'a {
    std::iter::once(verb).chain(exec.iter().map(String::as_str))
}
