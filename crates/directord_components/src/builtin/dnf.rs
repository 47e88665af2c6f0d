//! DNF: package management through the system package manager.

use crate::{command, exec_argv, Component, CommonExecArgs, ParsedExec, TaskContext, TaskOutcome};
use clap::Parser;
use directord_protocol::{JobItem, VerbPayload};

const DEFAULT_RETRY: u32 = 3;

#[derive(Parser, Debug)]
#[command(name = "DNF", about = "Manage packages with dnf", disable_help_flag = true)]
struct DnfExec {
    #[command(flatten)]
    common: CommonExecArgs,

    /// Clear dnf metadata and make cache before running the action.
    #[arg(long)]
    clear_metadata: bool,

    /// Ensure the latest package is installed.
    #[arg(long, conflicts_with = "absent")]
    latest: bool,

    /// Ensure packages are removed.
    #[arg(long)]
    absent: bool,

    /// Number of times to retry.
    #[arg(long, default_value_t = DEFAULT_RETRY)]
    retry: u32,

    /// Packages to manage.
    #[arg(required = true)]
    packages: Vec<String>,
}

pub struct Dnf;

impl Component for Dnf {
    fn verb(&self) -> &'static str {
        "DNF"
    }

    fn lock_name(&self) -> Option<&'static str> {
        Some("dnf")
    }

    fn server(&self, exec: &[String]) -> anyhow::Result<ParsedExec> {
        let parsed = DnfExec::try_parse_from(exec_argv("DNF", exec))?;
        let state = if parsed.absent {
            "absent"
        } else if parsed.latest {
            "latest"
        } else {
            "present"
        };

        let mut parsed_exec = ParsedExec::new(
            VerbPayload::Dnf {
                packages: parsed.packages,
                state: state.to_string(),
                clear_metadata: parsed.clear_metadata,
            },
            parsed.common,
        );
        parsed_exec.retry = parsed.retry;
        Ok(parsed_exec)
    }

    fn client(&self, ctx: &mut TaskContext, job: &JobItem) -> TaskOutcome {
        let VerbPayload::Dnf {
            packages,
            state,
            clear_metadata,
        } = &job.payload
        else {
            return TaskOutcome::failure("DNF received a mismatched payload");
        };

        if packages.is_empty() {
            return TaskOutcome::failure("DNF job carried no packages");
        }

        let envs = ctx.envs();
        let mut stdout_parts = Vec::new();
        let mut stderr_parts = Vec::new();

        if *clear_metadata {
            for cmd in ["dnf clean all", "dnf makecache"] {
                stdout_parts.push(format!("=== {cmd} ===\n"));
                let (stdout, stderr, _) = command::run_command(cmd, &envs, false);
                stdout_parts.push(stdout);
                stderr_parts.push(stderr);
            }
        }

        let cmd = match state.as_str() {
            "absent" => format!("dnf -q -y remove {}", packages.join(" ")),
            "latest" => format!("dnf -q -y --best install {}", packages.join(" ")),
            _ => format!("dnf -q -y install {}", packages.join(" ")),
        };
        stdout_parts.push(format!("=== {cmd} ===\n"));
        let (stdout, stderr, outcome) = command::run_command(&cmd, &envs, false);
        stdout_parts.push(stdout);
        stderr_parts.push(stderr);

        TaskOutcome {
            stdout: Some(stdout_parts.concat()),
            stderr: Some(stderr_parts.concat()),
            outcome,
            info: Some(cmd),
        }
    }
}
