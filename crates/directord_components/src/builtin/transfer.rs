//! COPY / ADD: chunked file pull over the backend channel.

use crate::{blueprint, exec_argv, fsops, Component, CommonExecArgs, ParsedExec, TaskContext, TaskOutcome};
use base64::Engine;
use clap::Parser;
use directord_protocol::{file_sha3_224, Control, Frame, TRANSFER_CHUNK_SIZE};
use directord_transport::Channel;
use directord_protocol::{JobItem, VerbPayload};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Per-chunk receive deadline in milliseconds.
const CHUNK_RECV_TIMEOUT_MS: i64 = 30_000;

#[derive(Parser, Debug)]
#[command(name = "COPY", about = "Process transfer commands", disable_help_flag = true)]
struct TransferExec {
    #[command(flatten)]
    common: CommonExecArgs,

    /// Set the file ownership, `user[:group]`.
    #[arg(long)]
    chown: Option<String>,

    /// Set the file mode, octal.
    #[arg(long)]
    chmod: Option<String>,

    /// Blueprint the transferred file through the template engine.
    #[arg(long)]
    blueprint: bool,

    /// Files to transfer: 'FROM'... 'TO'.
    #[arg(required = true, num_args = 2..)]
    files: Vec<String>,
}

pub struct Transfer;

impl Component for Transfer {
    fn verb(&self) -> &'static str {
        "COPY"
    }

    // Terminal-state caching cannot tell two files of one job apart; the
    // existing-file fingerprint check supplies idempotence instead.
    fn cacheable(&self) -> bool {
        false
    }

    fn lock_name(&self) -> Option<&'static str> {
        Some("copy")
    }

    fn server(&self, exec: &[String]) -> anyhow::Result<ParsedExec> {
        let mut parsed = TransferExec::try_parse_from(exec_argv("COPY", exec))?;

        let to = parsed.files.pop().unwrap_or_default();
        let sources = parsed.files;
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

        let payload = VerbPayload::Copy {
            sources,
            to,
            file_to: None,
            file_sha3_224: None,
            user,
            group,
            mode,
            blueprint: parsed.blueprint,
        };
        Ok(ParsedExec::new(payload, parsed.common))
    }

    fn client(&self, ctx: &mut TaskContext, job: &JobItem) -> TaskOutcome {
        let VerbPayload::Copy {
            sources,
            file_to,
            file_sha3_224: expected_sha,
            user,
            group,
            mode,
            blueprint: blueprint_file,
            ..
        } = &job.payload
        else {
            return TaskOutcome::failure("COPY received a mismatched payload");
        };

        let Some(source_file) = sources.first() else {
            return TaskOutcome::failure("COPY job carried no source file");
        };
        let Some(file_to) = file_to else {
            return TaskOutcome::failure("COPY job carried no destination file");
        };

        let file_to = match blueprint::render(file_to, &ctx.args(), true) {
            Ok(rendered) => rendered,
            Err(e) => return TaskOutcome::failure(e),
        };
        let destination = Path::new(&file_to);

        let expected = expected_sha.as_deref().unwrap_or_default();
        if destination.is_file() {
            if let Ok(actual) = file_sha3_224(destination) {
                if actual == expected {
                    let info = format!(
                        "File exists {file_to} and SHA3_224 {expected} matches, nothing to transfer"
                    );
                    if *blueprint_file {
                        if let Err(e) = blueprint::render_file(destination, &ctx.args()) {
                            return TaskOutcome::failure(e);
                        }
                    }
                    return TaskOutcome::success(Some(info), None);
                }
            }
        }

        debug!(
            "Job [ {} ] requesting transfer of source file:{}",
            job.job_id, source_file
        );
        let channel = match ctx.driver.backend_connect_ephemeral(&job.job_id) {
            Ok(channel) => channel,
            Err(e) => {
                return TaskOutcome::failure(format!("Transfer never started: {e}"));
            }
        };
        let result = pull_file(&channel, &job.job_id, source_file, destination);
        let _ = channel.close();
        if let Err(e) = result {
            return TaskOutcome::failure(e);
        }

        if *blueprint_file {
            if let Err(e) = blueprint::render_file(destination, &ctx.args()) {
                return TaskOutcome::failure(e);
            }
        }

        if let Err(e) = fsops::apply_ownership(destination, user.as_deref(), group.as_deref()) {
            return TaskOutcome::failure(e);
        }
        if let Some(mode) = mode {
            if let Err(e) = fsops::apply_mode(destination, *mode) {
                return TaskOutcome::failure(e);
            }
        }

        let actual = match file_sha3_224(destination) {
            Ok(actual) => actual,
            Err(e) => return TaskOutcome::failure(e.to_string()),
        };
        if !blueprint_file && actual != expected {
            return TaskOutcome::failure(format!(
                "Data integrity failure. Expected SHA {expected}, found SHA {actual}. Check transfer logs for more details."
            ));
        }

        TaskOutcome::success(Some(actual), None)
    }
}

/// Request chunks at a running offset until the end marker or a short
/// chunk arrives.
fn pull_file(
    channel: &Channel,
    job_id: &str,
    source_file: &str,
    destination: &Path,
) -> Result<(), String> {
    let mut file = File::create(destination).map_err(|e| e.to_string())?;
    let mut offset: usize = 0;

    loop {
        channel
            .send(
                &Frame::status(job_id, Control::TransferStart)
                    .with_command(offset.to_string())
                    .with_data(TRANSFER_CHUNK_SIZE.to_string())
                    .with_info(source_file),
            )
            .map_err(|e| e.to_string())?;

        let frame = channel
            .recv_timeout(CHUNK_RECV_TIMEOUT_MS)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "Transfer stalled waiting for a chunk".to_string())?;

        match frame.control {
            Some(Control::JobProcessing) | Some(Control::TransferEnd) => {
                let chunk = base64::engine::general_purpose::STANDARD
                    .decode(&frame.data)
                    .map_err(|e| format!("Chunk decode failure: {e}"))?;
                file.write_all(&chunk).map_err(|e| e.to_string())?;
                offset += chunk.len();
                if frame.control == Some(Control::TransferEnd) || chunk.len() < TRANSFER_CHUNK_SIZE
                {
                    debug!(
                        "Job [ {} ] transfer of source file:{} complete after {} bytes",
                        job_id, source_file, offset
                    );
                    return Ok(());
                }
            }
            Some(Control::JobFailed) => {
                return Err(format!("Transfer failed: {}", frame.info));
            }
            other => {
                return Err(format!("Unexpected transfer control: {other:?}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_splits_sources_and_destination() {
        let exec: Vec<String> = ["--chown", "svc:web", "--chmod", "0644", "/a", "/b", "/dest/"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let parsed = Transfer.server(&exec).unwrap();
        match parsed.payload {
            VerbPayload::Copy {
                sources,
                to,
                user,
                group,
                mode,
                ..
            } => {
                assert_eq!(sources, vec!["/a".to_string(), "/b".to_string()]);
                assert_eq!(to, "/dest/");
                assert_eq!(user.as_deref(), Some("svc"));
                assert_eq!(group.as_deref(), Some("web"));
                assert_eq!(mode, Some(0o644));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_server_requires_two_files() {
        let exec = vec!["/only-one".to_string()];
        assert!(Transfer.server(&exec).is_err());
    }

    #[test]
    fn test_integrity_mismatch_fails_without_retry() {
        use directord_cache::Cache;
        use directord_protocol::object_sha3_224;
        use directord_transport::{Driver, DriverConfig};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("pulled");

        let driver = Arc::new(Driver::new(DriverConfig::new(
            "inproc://transfer-mismatch",
            "w1",
        )));
        let bound = driver.backend_bind().unwrap();

        // Answer the worker's chunk request with content that cannot
        // match the advertised fingerprint.
        let responder = std::thread::spawn(move || loop {
            let (identity, frame) = bound.recv_routed_timeout(5_000).unwrap().unwrap();
            match frame.control {
                Some(Control::Ready) => continue,
                Some(Control::TransferStart) => {
                    let corrupted = base64::engine::general_purpose::STANDARD
                        .encode(b"corrupted payload");
                    let reply = Frame::status(&frame.msg_id, Control::TransferEnd)
                        .with_data(corrupted.into_bytes())
                        .with_info(&frame.info);
                    bound.send_to(&identity, &reply).unwrap();
                    return;
                }
                other => panic!("unexpected control: {other:?}"),
            }
        });

        let cache = Arc::new(Cache::open(dir.path().join("cache")).unwrap());
        let mut ctx = TaskContext::new(cache, driver);

        let expected_sha = object_sha3_224(&serde_json::Value::String("intact".to_string()));
        let mut job = JobItem::new(VerbPayload::Copy {
            sources: vec!["/srv/intact".to_string()],
            to: destination.display().to_string(),
            file_to: Some(destination.display().to_string()),
            file_sha3_224: Some(expected_sha),
            user: None,
            group: None,
            mode: None,
            blueprint: false,
        });
        job.job_id = "job-mismatch".to_string();

        let outcome = Transfer.client(&mut ctx, &job);
        responder.join().unwrap();

        assert!(!outcome.outcome);
        assert!(outcome
            .stderr
            .unwrap()
            .contains("Data integrity failure"));
    }

    #[test]
    fn test_existing_matching_file_skips_transfer() {
        use directord_cache::Cache;
        use directord_transport::{Driver, DriverConfig};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("present");
        std::fs::write(&destination, b"already here").unwrap();
        let sha = file_sha3_224(&destination).unwrap();

        let cache = Arc::new(Cache::open(dir.path().join("cache")).unwrap());
        let driver = Arc::new(Driver::new(DriverConfig::new(
            "inproc://transfer-test",
            "w1",
        )));
        let mut ctx = TaskContext::new(cache, driver);

        let job = JobItem::new(VerbPayload::Copy {
            sources: vec!["/srv/present".to_string()],
            to: destination.display().to_string(),
            file_to: Some(destination.display().to_string()),
            file_sha3_224: Some(sha),
            user: None,
            group: None,
            mode: None,
            blueprint: false,
        });

        let outcome = Transfer.client(&mut ctx, &job);
        assert!(outcome.outcome);
        assert!(outcome
            .stdout
            .unwrap()
            .contains("nothing to transfer"));
    }
}
