//! QUERY: report a locally cached argument back to the fabric.
//!
//! The coordinator rebroadcasts successful query payloads as synthetic
//! ARG jobs, so every worker learns every other worker's answer under
//! `args.query`.

use crate::{exec_argv, Component, CommonExecArgs, ParsedExec, TaskContext, TaskOutcome};
use clap::Parser;
use directord_protocol::{get_uuid, job_sha3_224, JobItem, VerbPayload, DEFAULT_JOB_TIMEOUT_SECS};
use serde_json::{Map, Value};

#[derive(Parser, Debug)]
#[command(name = "QUERY", about = "Process query commands", disable_help_flag = true)]
struct QueryExec {
    #[command(flatten)]
    common: CommonExecArgs,

    /// Disable waiting for the queried key to be present locally.
    #[arg(long)]
    no_wait: bool,

    /// Cached argument to scan the environment for.
    query: String,
}

pub struct Query;

impl Component for Query {
    fn verb(&self) -> &'static str {
        "QUERY"
    }

    fn cacheable(&self) -> bool {
        false
    }

    fn lock_name(&self) -> Option<&'static str> {
        Some("query")
    }

    fn server(&self, exec: &[String]) -> anyhow::Result<ParsedExec> {
        let parsed = QueryExec::try_parse_from(exec_argv("QUERY", exec))?;
        Ok(ParsedExec::new(
            VerbPayload::Query {
                query: parsed.query,
                no_wait: parsed.no_wait,
            },
            parsed.common,
        ))
    }

    fn client(&self, ctx: &mut TaskContext, job: &JobItem) -> TaskOutcome {
        let VerbPayload::Query { query, no_wait } = &job.payload else {
            return TaskOutcome::failure("QUERY received a mismatched payload");
        };

        let value = ctx.args().get(query).cloned().unwrap_or(Value::Null);
        let mut answer = Map::new();
        answer.insert(query.clone(), value);
        let answer = Value::Object(answer);

        // When the caller included this worker in the target set, block
        // until the rebroadcast answer lands in the local cache too.
        let identity = ctx.identity().to_string();
        if job.targets.iter().any(|t| t == &identity) && !no_wait {
            let mut wait_job = JobItem::new(VerbPayload::QueryWait {
                item: query.clone(),
                query_timeout: DEFAULT_JOB_TIMEOUT_SECS,
                identity: Vec::new(),
            });
            wait_job.skip_cache = true;
            wait_job.parent_async_bypass = true;
            wait_job.targets = vec![identity];
            wait_job.job_id = get_uuid();
            wait_job.parent_id = job.parent_id.clone();
            if let Ok(sha) = job_sha3_224(&wait_job) {
                wait_job.job_sha3_224 = sha.clone();
                wait_job.parent_sha3_224 = sha;
            }
            ctx.block_on_tasks.push(wait_job);
        }

        TaskOutcome {
            stdout: Some(answer.to_string()),
            stderr: None,
            outcome: true,
            info: Some(query.clone()),
        }
    }
}
