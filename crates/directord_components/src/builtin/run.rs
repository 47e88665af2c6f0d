//! RUN: templated shell execution.

use crate::{blueprint, command, exec_argv, Component, CommonExecArgs, ParsedExec, TaskContext, TaskOutcome};
use directord_protocol::{JobItem, VerbPayload};
use clap::Parser;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "RUN", about = "Process run commands", disable_help_flag = true)]
struct RunExec {
    #[command(flatten)]
    common: CommonExecArgs,

    /// Run the command in fire-and-forget mode.
    #[arg(long)]
    no_block: bool,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

pub struct Run;

impl Component for Run {
    fn verb(&self) -> &'static str {
        "RUN"
    }

    fn server(&self, exec: &[String]) -> anyhow::Result<ParsedExec> {
        let parsed = RunExec::try_parse_from(exec_argv("RUN", exec))?;
        let payload = VerbPayload::Run {
            command: parsed.command.join(" "),
            no_block: parsed.no_block,
        };
        Ok(ParsedExec::new(payload, parsed.common))
    }

    fn client(&self, ctx: &mut TaskContext, job: &JobItem) -> TaskOutcome {
        let VerbPayload::Run { command, no_block } = &job.payload else {
            return TaskOutcome::failure("RUN received a mismatched payload");
        };

        let command = match blueprint::render(command, &ctx.args(), true) {
            Ok(command) => command,
            Err(e) => return TaskOutcome::failure(e),
        };
        if command.is_empty() {
            return TaskOutcome::failure("Rendered command was empty");
        }

        debug!("Job [ {} ] running command [ {} ]", job.job_id, command);
        let (stdout, stderr, outcome) = command::run_command(&command, &ctx.envs(), *no_block);
        TaskOutcome {
            stdout: Some(stdout),
            stderr: Some(stderr),
            outcome,
            info: Some(command),
        }
    }
}
