//! ZAP (RFC 27) authenticator thread.
//!
//! libzmq delegates PLAIN and CURVE credential checks to a REP socket
//! bound at `inproc://zeromq.zap.01` within the same context. The handler
//! runs on its own thread and exits when the context is terminated.

use crate::auth::{load_authorized_keys, AuthConfig, AuthMode, PLAIN_USER};
use crate::Result;
use tracing::{debug, warn};

const ZAP_ENDPOINT: &str = "inproc://zeromq.zap.01";
const ZAP_VERSION: &[u8] = b"1.0";

pub struct ZapHandle {
    _thread: std::thread::JoinHandle<()>,
}

/// Start the authenticator for a bound driver. Must run before the first
/// authenticated bind on the same context.
pub fn start(context: &zmq::Context, config: &AuthConfig) -> Result<ZapHandle> {
    let socket = context.socket(zmq::REP)?;
    socket.bind(ZAP_ENDPOINT)?;

    let shared_key = match &config.mode {
        AuthMode::SharedKey(key) => Some(key.clone()),
        _ => None,
    };
    let authorized_keys = match config.mode {
        AuthMode::Curve => load_authorized_keys(config)?,
        _ => Vec::new(),
    };

    let thread = std::thread::Builder::new()
        .name("zap-auth".to_string())
        .spawn(move || zap_loop(socket, shared_key, authorized_keys))?;

    Ok(ZapHandle { _thread: thread })
}

fn zap_loop(socket: zmq::Socket, shared_key: Option<String>, authorized_keys: Vec<Vec<u8>>) {
    loop {
        let request = match socket.recv_multipart(0) {
            Ok(request) => request,
            // Context terminated, or the socket went away with it.
            Err(_) => return,
        };

        let reply = evaluate(&request, shared_key.as_deref(), &authorized_keys);
        if socket.send_multipart(reply, 0).is_err() {
            return;
        }
    }
}

/// Request frames: version, request id, domain, address, identity,
/// mechanism, credentials... Reply: version, request id, status code,
/// status text, user id, metadata.
fn evaluate(
    request: &[Vec<u8>],
    shared_key: Option<&str>,
    authorized_keys: &[Vec<u8>],
) -> Vec<Vec<u8>> {
    let request_id = request.get(1).cloned().unwrap_or_default();
    let mechanism = request.get(5).map(|m| m.as_slice()).unwrap_or(b"");

    let allowed = match mechanism {
        b"PLAIN" => {
            let user = request.get(6).map(|u| u.as_slice()).unwrap_or(b"");
            let password = request.get(7).map(|p| p.as_slice()).unwrap_or(b"");
            match shared_key {
                Some(key) => user == PLAIN_USER.as_bytes() && password == key.as_bytes(),
                None => false,
            }
        }
        b"CURVE" => {
            let client_key = request.get(6).map(|k| k.as_slice()).unwrap_or(b"");
            authorized_keys.iter().any(|key| key == client_key)
        }
        b"NULL" => true,
        other => {
            warn!(
                "Rejecting unknown auth mechanism [ {} ]",
                String::from_utf8_lossy(other)
            );
            false
        }
    };

    debug!(
        "ZAP {} for mechanism [ {} ]",
        if allowed { "allow" } else { "deny" },
        String::from_utf8_lossy(mechanism)
    );

    let (code, text, user): (&[u8], &[u8], &[u8]) = if allowed {
        (b"200", b"OK", PLAIN_USER.as_bytes())
    } else {
        (b"400", b"Credentials rejected", b"")
    };

    vec![
        ZAP_VERSION.to_vec(),
        request_id,
        code.to_vec(),
        text.to_vec(),
        user.to_vec(),
        Vec::new(),
    ]
}
