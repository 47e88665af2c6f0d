//! Shell execution with the cached environment applied.

use serde_json::{Map, Value};
use std::process::{Command, Stdio};
use tracing::debug;

const SHELL: &str = "/bin/sh";

/// Run a command through the shell.
///
/// Returns `(stdout, stderr, outcome)`. Cached environment values are
/// layered over the process environment. With `no_block` the child is
/// detached into its own process group and the result is an immediate
/// success with no captured output.
pub fn run_command(command: &str, env: &Map<String, Value>, no_block: bool) -> (String, String, bool) {
    let mut shell = Command::new(SHELL);
    shell.arg("-c").arg(command);
    for (key, value) in env {
        shell.env(key, value_to_env(value));
    }

    if no_block {
        shell
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .stdin(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            shell.process_group(0);
        }
        return match shell.spawn() {
            Ok(_child) => (String::new(), String::new(), true),
            Err(e) => (String::new(), e.to_string(), false),
        };
    }

    match shell.output() {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            debug!(
                "Command [ {} ] exited with {:?}",
                command,
                output.status.code()
            );
            (stdout, stderr, output.status.success())
        }
        Err(e) => (String::new(), e.to_string(), false),
    }
}

fn value_to_env(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env() -> Map<String, Value> {
        let Value::Object(map) = json!({"GREETING": "hello", "COUNT": 3}) else {
            unreachable!()
        };
        map
    }

    #[test]
    fn test_successful_command_captures_stdout() {
        let (stdout, stderr, outcome) = run_command("echo hi", &Map::new(), false);
        assert!(outcome);
        assert_eq!(stdout.trim(), "hi");
        assert!(stderr.is_empty());
    }

    #[test]
    fn test_failing_command_reports_outcome() {
        let (_, _, outcome) = run_command("exit 2", &Map::new(), false);
        assert!(!outcome);
    }

    #[test]
    fn test_cached_environment_is_applied() {
        let (stdout, _, outcome) = run_command("echo $GREETING-$COUNT", &env(), false);
        assert!(outcome);
        assert_eq!(stdout.trim(), "hello-3");
    }

    #[test]
    fn test_no_block_returns_immediately() {
        let (stdout, stderr, outcome) = run_command("sleep 30", &Map::new(), true);
        assert!(outcome);
        assert!(stdout.is_empty());
        assert!(stderr.is_empty());
    }
}
