//! ECHO: render and return the input.

use crate::{blueprint, exec_argv, Component, CommonExecArgs, ParsedExec, TaskContext, TaskOutcome};
use clap::Parser;
use directord_protocol::{JobItem, VerbPayload};

#[derive(Parser, Debug)]
#[command(name = "ECHO", about = "Return the provided content", disable_help_flag = true)]
struct EchoExec {
    #[command(flatten)]
    common: CommonExecArgs,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    content: Vec<String>,
}

pub struct Echo;

impl Component for Echo {
    fn verb(&self) -> &'static str {
        "ECHO"
    }

    fn server(&self, exec: &[String]) -> anyhow::Result<ParsedExec> {
        let parsed = EchoExec::try_parse_from(exec_argv("ECHO", exec))?;
        Ok(ParsedExec::new(
            VerbPayload::Echo {
                content: parsed.content.join(" "),
            },
            parsed.common,
        ))
    }

    fn client(&self, ctx: &mut TaskContext, job: &JobItem) -> TaskOutcome {
        let VerbPayload::Echo { content } = &job.payload else {
            return TaskOutcome::failure("ECHO received a mismatched payload");
        };

        match blueprint::render(content, &ctx.args(), true) {
            Ok(rendered) => TaskOutcome::success(Some(rendered), None),
            Err(e) => TaskOutcome::failure(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use directord_cache::{Cache, SetOptions};
    use directord_transport::{Driver, DriverConfig};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_echo_renders_args() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(Cache::open(dir.path().join("cache")).unwrap());
        cache
            .set("args", json!({"site": "east"}), SetOptions::tagged("args"))
            .unwrap();
        let driver = Arc::new(Driver::new(DriverConfig::new("inproc://echo-test", "w1")));
        let mut ctx = TaskContext::new(cache, driver);

        let job = JobItem::new(VerbPayload::Echo {
            content: "site={{ site }}".to_string(),
        });
        let outcome = Echo.client(&mut ctx, &job);
        assert!(outcome.outcome);
        assert_eq!(outcome.stdout.as_deref(), Some("site=east"));
    }
}
