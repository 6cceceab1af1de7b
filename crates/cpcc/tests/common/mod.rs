//! In-process mock CPC daemon used by the integration suites.
//!
//! Serves the daemon side of the exchange protocol over real seqpacket
//! sockets in a per-test temp directory: control handshake, endpoint
//! open/close/status, and an echo loop on every opened endpoint.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::BytesMut;
use cpcc::{SessionConfig, PROTOCOL_VERSION, SECURITY_ENDPOINT_ID};
use cpcc_exchange::{
    encode_open_ack, EndpointState, ExchangeKind, ExchangeMessage, MAX_MESSAGE_SIZE,
};
use cpcc_transport::{SeqPacketListener, SeqPacketSocket};

/// Max write size the mock negotiates during the handshake.
pub const MOCK_MAX_WRITE_SIZE: u32 = 64;

/// Instance name the mock daemon serves.
pub const MOCK_INSTANCE: &str = "mock";

/// Endpoint message that makes the echo loop drop the connection.
pub const CLOSE_SENTINEL: &[u8] = b"drop-me";

#[derive(Clone)]
pub struct MockDaemonConfig {
    /// Version the daemon reports in the version exchange.
    pub version: u8,
    pub max_write_size: u32,
    /// Endpoint ids answered with `can_open == false`.
    pub refuse_open: Vec<u8>,
    /// Artificial delay while serving a status query; widens the race
    /// window in the serialization test.
    pub status_delay: Duration,
    /// Stop serving after this many control connections.
    pub max_connections: usize,
    /// Drop the control connection instead of answering a status
    /// query; the client observes a 0-byte read mid-exchange.
    pub drop_on_status: bool,
}

impl Default for MockDaemonConfig {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            max_write_size: MOCK_MAX_WRITE_SIZE,
            refuse_open: Vec::new(),
            status_delay: Duration::ZERO,
            max_connections: usize::MAX,
            drop_on_status: false,
        }
    }
}

pub struct MockDaemon {
    socket_dir: PathBuf,
}

impl MockDaemon {
    /// Bind the control socket and serve in a background thread.
    pub fn start(tag: &str, config: MockDaemonConfig) -> Self {
        let socket_dir = make_socket_dir(tag);
        serve_in_background(&socket_dir, config, Duration::ZERO);
        Self { socket_dir }
    }

    /// Like [`start`](Self::start), but the control socket only
    /// appears after `delay`. Used by the restart tests.
    pub fn start_delayed_in(socket_dir: &Path, config: MockDaemonConfig, delay: Duration) {
        serve_in_background(socket_dir, config, delay);
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    /// Session configuration pointing at this mock instance.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            instance_name: Some(MOCK_INSTANCE.to_string()),
            socket_dir: Some(self.socket_dir.clone()),
            ..SessionConfig::default()
        }
    }
}

impl Drop for MockDaemon {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.socket_dir);
    }
}

pub fn make_socket_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/cpcc-it-{}-{}-{}",
        tag,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

/// Daemon-side state reported for an endpoint id in status replies.
pub fn state_for_id(id: u8) -> EndpointState {
    EndpointState::from_u8(id % 6).expect("id % 6 should name a state")
}

fn instance_dir(socket_dir: &Path) -> PathBuf {
    socket_dir.join("cpcd").join(MOCK_INSTANCE)
}

fn serve_in_background(socket_dir: &Path, config: MockDaemonConfig, delay: Duration) {
    let socket_dir = socket_dir.to_path_buf();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    // The restart tests depend on the delayed bind; everyone else must
    // not observe an unbound control socket.
    let wait_for_bind = delay.is_zero();
    std::thread::spawn(move || {
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let dir = instance_dir(&socket_dir);
        std::fs::create_dir_all(&dir).expect("instance dir should be creatable");
        let listener =
            SeqPacketListener::bind(dir.join("ctrl.cpcd.sock")).expect("control socket should bind");
        // Delayed callers have already dropped the receiver.
        let _ = ready_tx.send(());

        let mut served = 0;
        while served < config.max_connections {
            let control = match listener.accept() {
                Ok(socket) => socket,
                Err(_) => return,
            };
            served += 1;
            serve_control(&socket_dir, control, &config);
        }
    });
    if wait_for_bind {
        ready_rx
            .recv()
            .expect("server thread should report the bound control socket");
    }
}

fn serve_control(socket_dir: &Path, control: SeqPacketSocket, config: &MockDaemonConfig) {
    let mut buf = [0u8; MAX_MESSAGE_SIZE];
    loop {
        let received = match control.recv(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let request =
            ExchangeMessage::decode(&buf[..received]).expect("client request should decode");

        match request.kind {
            ExchangeKind::SetPid => {
                // Registration only; no reply.
            }
            ExchangeKind::MaxWriteSizeQuery => {
                let reply = ExchangeMessage::max_write_size_reply(config.max_write_size);
                control
                    .send(&reply.to_bytes())
                    .expect("max-write reply should send");
            }
            ExchangeKind::VersionQuery => {
                let reply = ExchangeMessage::version_query(config.version);
                control
                    .send(&reply.to_bytes())
                    .expect("version reply should send");
            }
            ExchangeKind::OpenEndpoint => {
                serve_open(socket_dir, &control, config, request.endpoint_id);
            }
            ExchangeKind::CloseEndpoint => {
                let reply = ExchangeMessage::close_request(request.endpoint_id);
                control
                    .send(&reply.to_bytes())
                    .expect("close echo should send");
            }
            ExchangeKind::EndpointStatusQuery => {
                if config.drop_on_status {
                    return;
                }
                if !config.status_delay.is_zero() {
                    std::thread::sleep(config.status_delay);
                }
                let reply = ExchangeMessage::status_reply(
                    request.endpoint_id,
                    state_for_id(request.endpoint_id),
                );
                control
                    .send(&reply.to_bytes())
                    .expect("status reply should send");
            }
        }
    }
}

fn serve_open(socket_dir: &Path, control: &SeqPacketSocket, config: &MockDaemonConfig, id: u8) {
    let can_open = id != SECURITY_ENDPOINT_ID && !config.refuse_open.contains(&id);
    if !can_open {
        let reply = ExchangeMessage::open_reply(id, false);
        control
            .send(&reply.to_bytes())
            .expect("refusal reply should send");
        return;
    }

    // The endpoint socket must be listening before the client learns it
    // may connect.
    let path = instance_dir(socket_dir).join(format!("ep{id}.cpcd.sock"));
    let listener = SeqPacketListener::bind(&path).expect("endpoint socket should bind");

    let reply = ExchangeMessage::open_reply(id, true);
    control
        .send(&reply.to_bytes())
        .expect("open reply should send");

    let data = listener.accept().expect("endpoint accept should succeed");

    let mut ack = BytesMut::new();
    encode_open_ack(id, &mut ack);
    data.send(&ack).expect("open ack should send");

    std::thread::spawn(move || echo_loop(data));
}

fn echo_loop(data: SeqPacketSocket) {
    let mut buf = vec![0u8; 8192];
    loop {
        let received = match data.recv(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        if &buf[..received] == CLOSE_SENTINEL {
            return;
        }
        if data.send(&buf[..received]).is_err() {
            return;
        }
    }
}
