//! The seven-field message frame and its multipart encoding.

use crate::{Control, ProtocolError};

/// Placeholder for unset fields on the wire.
pub const NULL_FIELD: &[u8] = &[0x00];

const FIELD_COUNT: usize = 7;

/// One protocol message.
///
/// `msg_id`, `command` and `info` are text in practice (job ids, verbs,
/// human diagnostics); `data`, `stderr` and `stdout` stay raw since they
/// carry JSON documents, base64 chunks and process output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub msg_id: String,
    pub control: Option<Control>,
    pub command: String,
    pub data: Vec<u8>,
    pub info: String,
    pub stderr: Vec<u8>,
    pub stdout: Vec<u8>,
}

impl Frame {
    /// A frame carrying just a control byte, with a generated message id.
    pub fn control(control: Control) -> Self {
        Frame {
            msg_id: crate::get_uuid(),
            control: Some(control),
            ..Frame::default()
        }
    }

    /// A control frame for an existing message id.
    pub fn status(msg_id: impl AsRef<str>, control: Control) -> Self {
        Frame {
            msg_id: msg_id.as_ref().to_string(),
            control: Some(control),
            ..Frame::default()
        }
    }

    pub fn with_command(mut self, command: impl AsRef<str>) -> Self {
        self.command = command.as_ref().to_string();
        self
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_info(mut self, info: impl AsRef<str>) -> Self {
        self.info = info.as_ref().to_string();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<Vec<u8>>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_stdout(mut self, stdout: impl Into<Vec<u8>>) -> Self {
        self.stdout = stdout.into();
        self
    }

    /// Encode as multipart, optionally prefixed by a target identity.
    ///
    /// A message id is generated when unset so every frame on the wire is
    /// addressable.
    pub fn to_parts(&self, identity: Option<&str>) -> Vec<Vec<u8>> {
        let mut parts = Vec::with_capacity(FIELD_COUNT + 1);
        if let Some(identity) = identity {
            parts.push(identity.as_bytes().to_vec());
        }
        parts.push(encode_text(&self.msg_id));
        parts.push(vec![self.control.map_or(0x00, Control::as_byte)]);
        parts.push(encode_text(&self.command));
        parts.push(encode_bytes(&self.data));
        parts.push(encode_text(&self.info));
        parts.push(encode_bytes(&self.stderr));
        parts.push(encode_bytes(&self.stdout));
        parts
    }

    /// Decode a multipart message received on a connected (DEALER) socket.
    pub fn from_parts(parts: &[Vec<u8>]) -> Result<Frame, ProtocolError> {
        if parts.len() != FIELD_COUNT {
            return Err(ProtocolError::InvalidFrameCount {
                expected: FIELD_COUNT,
                got: parts.len(),
            });
        }

        let control_field = decode_bytes(&parts[1]);
        let control = match control_field.first() {
            None => None,
            Some(byte) => Some(Control::from_byte(*byte)?),
        };

        Ok(Frame {
            msg_id: decode_text(&parts[0], "msg_id")?,
            control,
            command: decode_text(&parts[2], "command")?,
            data: decode_bytes(&parts[3]),
            info: decode_text(&parts[4], "info")?,
            stderr: decode_bytes(&parts[5]),
            stdout: decode_bytes(&parts[6]),
        })
    }

    /// Decode a multipart message received on a bound (ROUTER) socket,
    /// returning the sender identity alongside the frame.
    pub fn from_routed_parts(parts: &[Vec<u8>]) -> Result<(String, Frame), ProtocolError> {
        if parts.len() != FIELD_COUNT + 1 {
            return Err(ProtocolError::InvalidFrameCount {
                expected: FIELD_COUNT + 1,
                got: parts.len(),
            });
        }
        let identity = decode_text(&parts[0], "identity")?;
        let frame = Frame::from_parts(&parts[1..])?;
        Ok((identity, frame))
    }

    /// The data field as UTF-8, lossy.
    pub fn data_string(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

fn encode_text(value: &str) -> Vec<u8> {
    if value.is_empty() {
        NULL_FIELD.to_vec()
    } else {
        value.as_bytes().to_vec()
    }
}

fn encode_bytes(value: &[u8]) -> Vec<u8> {
    if value.is_empty() {
        NULL_FIELD.to_vec()
    } else {
        value.to_vec()
    }
}

fn decode_bytes(part: &[u8]) -> Vec<u8> {
    if part == NULL_FIELD {
        Vec::new()
    } else {
        part.to_vec()
    }
}

fn decode_text(part: &[u8], field: &'static str) -> Result<String, ProtocolError> {
    if part == NULL_FIELD {
        return Ok(String::new());
    }
    String::from_utf8(part.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::status("job-1", Control::JobEnd)
            .with_command("RUN")
            .with_data(br#"{"verb":"RUN"}"#.to_vec())
            .with_info("done")
            .with_stdout(b"hi\n".to_vec());

        let parts = frame.to_parts(None);
        assert_eq!(parts.len(), 7);

        let decoded = Frame::from_parts(&parts).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_unset_fields_are_null_bytes() {
        let frame = Frame::status("job-2", Control::JobAck);
        let parts = frame.to_parts(None);
        // command, data, info, stderr, stdout are all unset
        for part in &parts[2..] {
            assert_eq!(part.as_slice(), NULL_FIELD);
        }

        let decoded = Frame::from_parts(&parts).unwrap();
        assert!(decoded.command.is_empty());
        assert!(decoded.data.is_empty());
        assert!(decoded.stdout.is_empty());
    }

    #[test]
    fn test_identity_prefix() {
        let frame = Frame::status("job-3", Control::Notice);
        let parts = frame.to_parts(Some("worker-1"));
        assert_eq!(parts.len(), 8);
        assert_eq!(parts[0], b"worker-1".to_vec());

        let (identity, decoded) = Frame::from_routed_parts(&parts).unwrap();
        assert_eq!(identity, "worker-1");
        assert_eq!(decoded.msg_id, "job-3");
    }

    #[test]
    fn test_bad_part_count() {
        let err = Frame::from_parts(&[vec![1], vec![2]]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidFrameCount {
                expected: 7,
                got: 2
            }
        ));
    }
}
