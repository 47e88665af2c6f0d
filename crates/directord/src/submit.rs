//! Submission socket client.

use anyhow::{Context, Result};
use directord_protocol::ManageRequest;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Send one JSON document to the coordinator and collect the reply.
pub fn send_data(socket_path: &Path, data: &Value) -> Result<String> {
    let mut stream = UnixStream::connect(socket_path).with_context(|| {
        format!(
            "Failed to connect to the coordinator socket at {}",
            socket_path.display()
        )
    })?;
    stream
        .write_all(data.to_string().as_bytes())
        .context("Submission write failed")?;
    stream
        .shutdown(Shutdown::Write)
        .context("Submission shutdown failed")?;

    let mut reply = String::new();
    stream
        .read_to_string(&mut reply)
        .context("Submission reply read failed")?;
    Ok(reply)
}

/// Issue a management request and parse the serialized view.
pub fn manage(socket_path: &Path, request: ManageRequest) -> Result<Value> {
    let reply = send_data(socket_path, &json!({ "manage": request.as_str() }))?;
    serde_json::from_str(&reply).context("Management reply is not valid JSON")
}
