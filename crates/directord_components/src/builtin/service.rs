//! SERVICE: service management through systemd.

use crate::{command, exec_argv, Component, CommonExecArgs, ParsedExec, TaskContext, TaskOutcome};
use clap::Parser;
use directord_protocol::{JobItem, VerbPayload};

#[derive(Parser, Debug)]
#[command(name = "SERVICE", about = "Manage services with systemd", disable_help_flag = true)]
struct ServiceExec {
    #[command(flatten)]
    common: CommonExecArgs,

    /// Ensure the services are restarted.
    #[arg(long, conflicts_with_all = ["stopped", "daemon_reload"])]
    restarted: bool,

    /// Ensure the services are stopped.
    #[arg(long)]
    stopped: bool,

    /// Ensure the services are enabled.
    #[arg(long, conflicts_with = "disable")]
    enable: bool,

    /// Ensure the services are disabled.
    #[arg(long)]
    disable: bool,

    /// Reload the systemd daemon first.
    #[arg(long)]
    daemon_reload: bool,

    /// Services to manage.
    #[arg(required = true)]
    services: Vec<String>,
}

pub struct Service;

impl Component for Service {
    fn verb(&self) -> &'static str {
        "SERVICE"
    }

    fn lock_name(&self) -> Option<&'static str> {
        Some("service")
    }

    fn server(&self, exec: &[String]) -> anyhow::Result<ParsedExec> {
        let parsed = ServiceExec::try_parse_from(exec_argv("SERVICE", exec))?;
        let state = if parsed.enable {
            Some("enable".to_string())
        } else if parsed.disable {
            Some("disable".to_string())
        } else {
            None
        };
        let running = if parsed.restarted {
            "restart"
        } else if parsed.stopped {
            "stop"
        } else {
            "start"
        };

        Ok(ParsedExec::new(
            VerbPayload::Service {
                services: parsed.services,
                state,
                running: Some(running.to_string()),
                daemon_reload: parsed.daemon_reload,
            },
            parsed.common,
        ))
    }

    fn client(&self, ctx: &mut TaskContext, job: &JobItem) -> TaskOutcome {
        let VerbPayload::Service {
            services,
            state,
            running,
            daemon_reload,
        } = &job.payload
        else {
            return TaskOutcome::failure("SERVICE received a mismatched payload");
        };

        if services.is_empty() {
            return TaskOutcome::failure("SERVICE job carried no services");
        }

        let envs = ctx.envs();
        let mut stdout_parts = Vec::new();
        let mut stderr_parts = Vec::new();
        let mut outcome = true;

        let mut commands = Vec::new();
        if *daemon_reload {
            commands.push("systemctl daemon-reload".to_string());
        }
        if let Some(state) = state {
            commands.push(format!("systemctl {state} {}", services.join(" ")));
        }
        let running = running.as_deref().unwrap_or("start");
        commands.push(format!("systemctl {running} {}", services.join(" ")));

        for cmd in &commands {
            stdout_parts.push(format!("=== {cmd} ===\n"));
            let (stdout, stderr, ok) = command::run_command(cmd, &envs, false);
            stdout_parts.push(stdout);
            stderr_parts.push(stderr);
            outcome = outcome && ok;
        }

        TaskOutcome {
            stdout: Some(stdout_parts.concat()),
            stderr: Some(stderr_parts.concat()),
            outcome,
            info: Some(commands.join("; ")),
        }
    }
}
