//! The channel driver.

use crate::auth::{AuthMode, KeyPairFiles};
use crate::{zap, AuthConfig, Result, TransportError};
use directord_protocol::{Control, Frame};
use std::sync::Mutex;
use tracing::{debug, info};

pub const DEFAULT_JOB_PORT: u16 = 5555;
pub const DEFAULT_BACKEND_PORT: u16 = 5556;
pub const DEFAULT_HEARTBEAT_PORT: u16 = 5557;

/// Connection parameters shared by both roles.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Scheme and host, e.g. `tcp://127.0.0.1`.
    pub connection: String,
    pub job_port: u16,
    pub backend_port: u16,
    pub heartbeat_port: u16,
    /// This node's identity; workers use their hostname.
    pub identity: String,
    pub auth: AuthConfig,
}

impl DriverConfig {
    pub fn new(connection: impl Into<String>, identity: impl Into<String>) -> Self {
        DriverConfig {
            connection: connection.into(),
            job_port: DEFAULT_JOB_PORT,
            backend_port: DEFAULT_BACKEND_PORT,
            heartbeat_port: DEFAULT_HEARTBEAT_PORT,
            identity: identity.into(),
            auth: AuthConfig::disabled(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Bound,
    Connected,
}

/// Socket factory for the three logical channels.
///
/// The zmq context is thread-safe; each loop thread creates its own
/// channels from a shared driver.
pub struct Driver {
    context: zmq::Context,
    config: DriverConfig,
    zap: Mutex<Option<zap::ZapHandle>>,
}

impl Driver {
    pub fn new(config: DriverConfig) -> Self {
        Driver {
            context: zmq::Context::new(),
            config,
            zap: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn job_bind(&self) -> Result<Channel> {
        self.bind(self.config.job_port)
    }

    pub fn backend_bind(&self) -> Result<Channel> {
        self.bind(self.config.backend_port)
    }

    pub fn heartbeat_bind(&self) -> Result<Channel> {
        self.bind(self.config.heartbeat_port)
    }

    pub fn job_connect(&self) -> Result<Channel> {
        debug!("Establishing job connection.");
        self.connect(self.config.job_port, false)
    }

    /// Backend connections are ephemeral: opened per transfer or barrier
    /// and closed with a bounded linger so a peer disconnect does not
    /// disturb the job flow.
    pub fn backend_connect(&self) -> Result<Channel> {
        debug!("Establishing backend connection.");
        self.connect(self.config.backend_port, true)
    }

    pub fn heartbeat_connect(&self) -> Result<Channel> {
        debug!("Establishing heartbeat connection.");
        self.connect(self.config.heartbeat_port, true)
    }

    /// Open a backend connection under a derived identity.
    ///
    /// A ROUTER treats duplicate identities as one peer, so a per-job
    /// channel must not reuse the identity of the worker's resident
    /// backend connection.
    pub fn backend_connect_ephemeral(&self, suffix: &str) -> Result<Channel> {
        let identity = format!("{}:{}", self.config.identity, suffix);
        debug!("Establishing ephemeral backend connection as [ {} ].", identity);
        self.connect_as(self.config.backend_port, &identity, true)
    }

    fn bind(&self, port: u16) -> Result<Channel> {
        if self.config.auth.enabled() {
            self.ensure_zap()?;
        }

        let socket = self.context.socket(zmq::ROUTER)?;
        match &self.config.auth.mode {
            AuthMode::None => {}
            AuthMode::SharedKey(_) => {
                socket.set_plain_server(true)?;
                info!("Shared key authentication enabled.");
            }
            AuthMode::Curve => {
                let files = KeyPairFiles::locate(&self.config.auth, "server");
                socket.set_curve_secretkey(&files.read_secret()?)?;
                socket.set_curve_publickey(&files.read_public()?)?;
                socket.set_curve_server(true)?;
                info!("Curve authentication enabled.");
            }
        }
        socket.set_linger(0)?;
        let address = format!("{}:{}", self.config.connection, port);
        socket.bind(&address)?;
        debug!("Socket bound to [ {} ].", address);

        Ok(Channel {
            socket,
            role: Role::Bound,
        })
    }

    fn connect(&self, port: u16, send_ready: bool) -> Result<Channel> {
        let identity = self.config.identity.clone();
        self.connect_as(port, &identity, send_ready)
    }

    fn connect_as(&self, port: u16, identity: &str, send_ready: bool) -> Result<Channel> {
        let socket = self.context.socket(zmq::DEALER)?;
        match &self.config.auth.mode {
            AuthMode::None => {}
            AuthMode::SharedKey(key) => {
                socket.set_plain_username(Some(crate::auth::PLAIN_USER))?;
                socket.set_plain_password(Some(key))?;
                info!("Shared key authentication enabled.");
            }
            AuthMode::Curve => {
                let client = KeyPairFiles::locate(&self.config.auth, "client");
                let server = KeyPairFiles::locate(&self.config.auth, "server");
                socket.set_curve_secretkey(&client.read_secret()?)?;
                socket.set_curve_publickey(&client.read_public()?)?;
                socket.set_curve_serverkey(&server.read_public()?)?;
                info!("Curve authentication enabled.");
            }
        }
        socket.set_identity(identity.as_bytes())?;
        socket.set_linger(0)?;
        let address = format!("{}:{}", self.config.connection, port);
        socket.connect(&address)?;
        info!("Socket connected to [ {} ].", address);

        let channel = Channel {
            socket,
            role: Role::Connected,
        };
        if send_ready {
            channel.send(&Frame::control(Control::Ready))?;
        }
        Ok(channel)
    }

    fn ensure_zap(&self) -> Result<()> {
        let mut guard = self
            .zap
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_none() {
            *guard = Some(zap::start(&self.context, &self.config.auth)?);
        }
        Ok(())
    }
}

/// One channel endpoint.
pub struct Channel {
    socket: zmq::Socket,
    role: Role,
}

impl Channel {
    pub fn role(&self) -> Role {
        self.role
    }

    /// Send from the connected side; no identity on the wire.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        self.socket.send_multipart(frame.to_parts(None), 0)?;
        Ok(())
    }

    /// Send from the bound side toward one worker identity.
    pub fn send_to(&self, identity: &str, frame: &Frame) -> Result<()> {
        self.socket
            .send_multipart(frame.to_parts(Some(identity)), 0)?;
        Ok(())
    }

    /// Blocking receive on the connected side.
    pub fn recv(&self) -> Result<Frame> {
        let parts = self.socket.recv_multipart(0)?;
        Ok(Frame::from_parts(&parts)?)
    }

    /// Blocking receive on the bound side; returns the sender identity.
    pub fn recv_routed(&self) -> Result<(String, Frame)> {
        let parts = self.socket.recv_multipart(0)?;
        Ok(Frame::from_routed_parts(&parts)?)
    }

    /// Report readiness without consuming.
    pub fn check(&self, timeout_ms: i64) -> Result<bool> {
        let events = self.socket.poll(zmq::POLLIN, timeout_ms)?;
        Ok(events > 0)
    }

    /// Poll-then-receive convenience for the connected side.
    pub fn recv_timeout(&self, timeout_ms: i64) -> Result<Option<Frame>> {
        if self.check(timeout_ms)? {
            Ok(Some(self.recv()?))
        } else {
            Ok(None)
        }
    }

    /// Poll-then-receive convenience for the bound side.
    pub fn recv_routed_timeout(&self, timeout_ms: i64) -> Result<Option<(String, Frame)>> {
        if self.check(timeout_ms)? {
            Ok(Some(self.recv_routed()?))
        } else {
            Ok(None)
        }
    }

    /// Close with a bounded linger so queued frames get a brief flush
    /// window but a dead peer cannot wedge shutdown.
    pub fn close(self) -> Result<()> {
        self.socket.set_linger(2_000)?;
        drop(self.socket);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use directord_protocol::Control;

    fn test_driver(identity: &str) -> Driver {
        Driver::new(DriverConfig::new("inproc://driver-test", identity))
    }

    #[test]
    fn test_default_ports() {
        let config = DriverConfig::new("tcp://127.0.0.1", "w1");
        assert_eq!(config.job_port, DEFAULT_JOB_PORT);
        assert_eq!(config.backend_port, DEFAULT_BACKEND_PORT);
        assert_eq!(config.heartbeat_port, DEFAULT_HEARTBEAT_PORT);
    }

    #[test]
    fn test_connected_frames_carry_identity_to_bound_side() {
        // Bind and connect share one inproc context via a shared driver.
        let driver = test_driver("worker-a");
        let bound = driver.job_bind().unwrap();
        let connected = driver.job_connect().unwrap();

        connected
            .send(&Frame::status("job-1", Control::JobAck).with_info("ok"))
            .unwrap();

        assert!(bound.check(2_000).unwrap());
        let (identity, frame) = bound.recv_routed().unwrap();
        assert_eq!(identity, "worker-a");
        assert_eq!(frame.msg_id, "job-1");
        assert_eq!(frame.control, Some(Control::JobAck));
        assert_eq!(frame.info, "ok");
    }

    #[test]
    fn test_bound_side_addresses_by_identity() {
        let driver = test_driver("worker-b");
        let bound = driver.heartbeat_bind().unwrap();
        let connected = driver.heartbeat_connect().unwrap();

        // Drain the READY sent on connect so the bound side learns the
        // identity.
        let (identity, ready) = bound.recv_routed().unwrap();
        assert_eq!(ready.control, Some(Control::Ready));

        bound
            .send_to(&identity, &Frame::control(Control::Notice).with_info("120.5"))
            .unwrap();
        let frame = connected.recv_timeout(2_000).unwrap().unwrap();
        assert_eq!(frame.control, Some(Control::Notice));
        assert_eq!(frame.info, "120.5");
    }

    #[test]
    fn test_check_times_out_quietly() {
        let driver = test_driver("worker-c");
        let bound = driver.backend_bind().unwrap();
        assert!(!bound.check(10).unwrap());
    }
}
