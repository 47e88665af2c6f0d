//! WORKDIR: idempotent directory creation.

use crate::{blueprint, exec_argv, fsops, Component, CommonExecArgs, ParsedExec, TaskContext, TaskOutcome};
use clap::Parser;
use directord_protocol::{JobItem, VerbPayload};
use std::path::Path;

#[derive(Parser, Debug)]
#[command(name = "WORKDIR", about = "Process workdir commands", disable_help_flag = true)]
struct WorkdirExec {
    #[command(flatten)]
    common: CommonExecArgs,

    /// Set the directory ownership, `user[:group]`.
    #[arg(long)]
    chown: Option<String>,

    /// Set the directory mode, octal.
    #[arg(long)]
    chmod: Option<String>,

    /// Recursive chown/chmod.
    #[arg(long)]
    recursive: bool,

    /// Directory to create.
    workdir: String,
}

pub struct Workdir;

impl Component for Workdir {
    fn verb(&self) -> &'static str {
        "WORKDIR"
    }

    fn server(&self, exec: &[String]) -> anyhow::Result<ParsedExec> {
        let parsed = WorkdirExec::try_parse_from(exec_argv("WORKDIR", exec))?;
        if parsed.recursive && parsed.chown.is_none() && parsed.chmod.is_none() {
            anyhow::bail!("--recursive requires --chown or --chmod");
        }
        let (user, group) = match parsed.chown.as_deref() {
            Some(spec) => {
                let (user, group) = fsops::parse_chown(spec);
                (Some(user), group)
            }
            None => (None, None),
        };
        let mode = parsed
            .chmod
            .as_deref()
            .map(fsops::parse_mode)
            .transpose()
            .map_err(anyhow::Error::msg)?;

        Ok(ParsedExec::new(
            VerbPayload::Workdir {
                workdir: parsed.workdir,
                user,
                group,
                mode,
                recursive: parsed.recursive,
            },
            parsed.common,
        ))
    }

    fn client(&self, ctx: &mut TaskContext, job: &JobItem) -> TaskOutcome {
        let VerbPayload::Workdir {
            workdir,
            user,
            group,
            mode,
            recursive,
        } = &job.payload
        else {
            return TaskOutcome::failure("WORKDIR received a mismatched payload");
        };

        let workdir = match blueprint::render(workdir, &ctx.args(), true) {
            Ok(rendered) => rendered,
            Err(e) => return TaskOutcome::failure(e),
        };
        if workdir.is_empty() {
            return TaskOutcome::failure("Rendered workdir was empty");
        }

        let path = Path::new(&workdir);
        if let Err(e) = std::fs::create_dir_all(path) {
            return TaskOutcome::failure(e.to_string());
        }

        let result = if *recursive {
            fsops::apply_recursive(path, user.as_deref(), group.as_deref(), *mode)
        } else {
            fsops::apply_ownership(path, user.as_deref(), group.as_deref()).and_then(|_| {
                match mode {
                    Some(mode) => fsops::apply_mode(path, *mode),
                    None => Ok(()),
                }
            })
        };
        if let Err(e) = result {
            return TaskOutcome::failure(e);
        }

        TaskOutcome::success(Some(format!("Directory {workdir} OK")), None)
    }
}
