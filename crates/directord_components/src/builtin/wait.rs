//! WAIT: block until a condition is met.

use crate::{blueprint, command, exec_argv, Component, CommonExecArgs, ParsedExec, TaskContext, TaskOutcome};
use clap::Parser;
use directord_protocol::{JobItem, VerbPayload};
use std::time::Duration;
use tracing::debug;

const DEFAULT_RETRY: u32 = 30;
const DEFAULT_RETRY_WAIT_SECS: u64 = 1;

#[derive(Parser, Debug)]
#[command(name = "WAIT", about = "Wait until a condition is met", disable_help_flag = true)]
struct WaitExec {
    #[command(flatten)]
    common: CommonExecArgs,

    /// Wait for the provided seconds.
    #[arg(long, conflicts_with_all = ["url", "cmd"])]
    seconds: Option<u64>,

    /// Wait for the URL to return 2xx or 3xx.
    #[arg(long, conflicts_with = "cmd")]
    url: Option<String>,

    /// Wait for the trailing command to return successfully.
    #[arg(long)]
    cmd: bool,

    /// Number of times to retry the condition (ignored with --seconds).
    #[arg(long, default_value_t = DEFAULT_RETRY)]
    retry: u32,

    /// Time to wait between retries (ignored with --seconds).
    #[arg(long, default_value_t = DEFAULT_RETRY_WAIT_SECS)]
    retry_wait: u64,

    /// Allow insecure server connections when using SSL.
    #[arg(long)]
    insecure: bool,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

pub struct Wait;

impl Component for Wait {
    fn verb(&self) -> &'static str {
        "WAIT"
    }

    fn server(&self, exec: &[String]) -> anyhow::Result<ParsedExec> {
        let parsed = WaitExec::try_parse_from(exec_argv("WAIT", exec))?;
        let command = if parsed.cmd {
            Some(parsed.command.join(" "))
        } else {
            None
        };
        if parsed.seconds.is_none() && parsed.url.is_none() && command.is_none() {
            anyhow::bail!("WAIT requires one of --seconds, --url or --cmd");
        }

        Ok(ParsedExec::new(
            VerbPayload::Wait {
                seconds: parsed.seconds,
                url: parsed.url,
                command,
                retry: Some(parsed.retry),
                retry_wait: Some(parsed.retry_wait),
                insecure: parsed.insecure,
            },
            parsed.common,
        ))
    }

    fn client(&self, ctx: &mut TaskContext, job: &JobItem) -> TaskOutcome {
        let VerbPayload::Wait {
            seconds,
            url,
            command,
            retry,
            retry_wait,
            insecure,
        } = &job.payload
        else {
            return TaskOutcome::failure("WAIT received a mismatched payload");
        };

        if let Some(seconds) = seconds {
            std::thread::sleep(Duration::from_secs(*seconds));
            return TaskOutcome::success(None, Some(format!("Waited {seconds} seconds")));
        }

        let retry = retry.unwrap_or(DEFAULT_RETRY).max(1);
        let retry_wait = Duration::from_secs(retry_wait.unwrap_or(DEFAULT_RETRY_WAIT_SECS));

        if let Some(url) = url {
            let url = match blueprint::render(url, &ctx.args(), true) {
                Ok(url) => url,
                Err(e) => return TaskOutcome::failure(e),
            };
            return wait_for_url(&url, retry, retry_wait, *insecure);
        }

        if let Some(cmd) = command {
            let cmd = match blueprint::render(cmd, &ctx.args(), true) {
                Ok(cmd) => cmd,
                Err(e) => return TaskOutcome::failure(e),
            };
            let envs = ctx.envs();
            let mut last_stderr = String::new();
            for attempt in 1..=retry {
                let (_, stderr, outcome) = command::run_command(&cmd, &envs, false);
                if outcome {
                    return TaskOutcome::success(
                        None,
                        Some(format!("Command succeeded after {attempt} attempts")),
                    );
                }
                last_stderr = stderr;
                if attempt < retry {
                    std::thread::sleep(retry_wait);
                }
            }
            return TaskOutcome::failure_with_info(
                last_stderr,
                format!("Command never succeeded within {retry} attempts"),
            );
        }

        TaskOutcome::failure("WAIT job carried no condition")
    }
}

fn wait_for_url(url: &str, retry: u32, retry_wait: Duration, insecure: bool) -> TaskOutcome {
    let client = match reqwest::blocking::Client::builder()
        .danger_accept_invalid_certs(insecure)
        .build()
    {
        Ok(client) => client,
        Err(e) => return TaskOutcome::failure(e.to_string()),
    };

    for attempt in 1..=retry {
        match client.get(url).send() {
            Ok(response) if response.status().is_success() || response.status().is_redirection() => {
                return TaskOutcome::success(
                    None,
                    Some(format!("URL {url} responded after {attempt} attempts")),
                );
            }
            Ok(response) => {
                debug!("WAIT url [ {} ] returned {}", url, response.status());
            }
            Err(e) => {
                debug!("WAIT url [ {} ] errored: {}", url, e);
            }
        }
        if attempt < retry {
            std::thread::sleep(retry_wait);
        }
    }
    TaskOutcome::failure(format!("URL {url} never became ready within {retry} attempts"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use directord_cache::Cache;
    use directord_transport::{Driver, DriverConfig};
    use std::sync::Arc;

    fn context() -> (tempfile::TempDir, TaskContext) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(Cache::open(dir.path().join("cache")).unwrap());
        let driver = Arc::new(Driver::new(DriverConfig::new("inproc://wait-test", "w1")));
        (dir, TaskContext::new(cache, driver))
    }

    #[test]
    fn test_server_requires_a_condition() {
        assert!(Wait.server(&[]).is_err());
    }

    #[test]
    fn test_server_parses_seconds() {
        let exec: Vec<String> = ["--seconds", "5"].iter().map(|s| s.to_string()).collect();
        let parsed = Wait.server(&exec).unwrap();
        match parsed.payload {
            VerbPayload::Wait { seconds, .. } => assert_eq!(seconds, Some(5)),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_server_parses_cmd_mode() {
        let exec: Vec<String> = ["--cmd", "--retry", "2", "test", "-f", "/some/file"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let parsed = Wait.server(&exec).unwrap();
        match parsed.payload {
            VerbPayload::Wait { command, retry, .. } => {
                assert_eq!(command.as_deref(), Some("test -f /some/file"));
                assert_eq!(retry, Some(2));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_cmd_condition_retries_until_success() {
        let (dir, mut ctx) = context();
        let flag = dir.path().join("ready");
        std::fs::write(&flag, b"ok").unwrap();

        let job = JobItem::new(VerbPayload::Wait {
            seconds: None,
            url: None,
            command: Some(format!("test -f {}", flag.display())),
            retry: Some(2),
            retry_wait: Some(0),
            insecure: false,
        });
        let outcome = Wait.client(&mut ctx, &job);
        assert!(outcome.outcome);
    }

    #[test]
    fn test_cmd_condition_fails_after_retries() {
        let (_dir, mut ctx) = context();
        let job = JobItem::new(VerbPayload::Wait {
            seconds: None,
            url: None,
            command: Some("test -f /definitely/not/here".to_string()),
            retry: Some(2),
            retry_wait: Some(0),
            insecure: false,
        });
        let outcome = Wait.client(&mut ctx, &job);
        assert!(!outcome.outcome);
        assert!(outcome.info.unwrap().contains("never succeeded"));
    }
}
