//! CACHEFILE: merge a YAML file into the argument cache.

use crate::{exec_argv, Component, CommonExecArgs, ParsedExec, TaskContext, TaskOutcome};
use clap::Parser;
use directord_cache::SetOptions;
use directord_protocol::{JobItem, VerbPayload};
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(name = "CACHEFILE", about = "Process cachefile commands", disable_help_flag = true)]
struct CachefileExec {
    #[command(flatten)]
    common: CommonExecArgs,

    /// Load a cached file and store it as an update to ARGs.
    cachefile: String,
}

pub struct Cachefile;

impl Component for Cachefile {
    fn verb(&self) -> &'static str {
        "CACHEFILE"
    }

    fn cacheable(&self) -> bool {
        false
    }

    fn lock_name(&self) -> Option<&'static str> {
        Some("arg")
    }

    fn server(&self, exec: &[String]) -> anyhow::Result<ParsedExec> {
        let parsed = CachefileExec::try_parse_from(exec_argv("CACHEFILE", exec))?;
        Ok(ParsedExec::new(
            VerbPayload::Cachefile {
                cachefile: parsed.cachefile,
            },
            parsed.common,
        ))
    }

    fn client(&self, ctx: &mut TaskContext, job: &JobItem) -> TaskOutcome {
        let VerbPayload::Cachefile { cachefile } = &job.payload else {
            return TaskOutcome::failure("CACHEFILE received a mismatched payload");
        };

        let content = match std::fs::read_to_string(cachefile) {
            Ok(content) => content,
            Err(e) => return TaskOutcome::failure(format!("{cachefile}: {e}")),
        };
        let value: Value = match serde_yaml::from_str(&content) {
            Ok(value) => value,
            Err(e) => return TaskOutcome::failure(format!("{cachefile}: {e}")),
        };
        if !value.is_object() {
            return TaskOutcome::failure(format!(
                "{cachefile}: top level of a cache file must be a mapping"
            ));
        }

        let options = SetOptions::tagged("args").updating(true);
        match ctx.cache.set("args", value, options) {
            Ok(()) => TaskOutcome::success(Some("Cache file loaded".to_string()), None),
            Err(e) => TaskOutcome::failure(e.to_string()),
        }
    }
}
