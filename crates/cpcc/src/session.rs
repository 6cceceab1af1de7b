//! Session lifecycle management.
//!
//! A [`Session`] owns the control channel and the parameters needed to
//! rebuild it after a daemon reset. The instance name is fixed at first
//! initialization and reused verbatim across restarts; endpoints opened
//! through the session only hold weak references to the control
//! channel, so tearing it down never keeps stale sockets alive.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpcc_exchange::EndpointState;
use tracing::{info, warn};

use crate::control::ControlChannel;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::{reset, DEFAULT_INSTANCE_NAME, DEFAULT_SOCKET_DIR, RESTART_ATTEMPTS};

/// Callback invoked from the reset watcher thread when the daemon
/// signals a reset. Runs with no library lock held.
pub type ResetCallback = Arc<dyn Fn() + Send + Sync>;

/// Parameters for [`Session::initialize`].
#[derive(Clone, Default)]
pub struct SessionConfig {
    /// Daemon instance to attach to; `None` selects
    /// [`DEFAULT_INSTANCE_NAME`](crate::DEFAULT_INSTANCE_NAME).
    pub instance_name: Option<String>,
    /// Runtime directory the daemon sockets live under; `None` selects
    /// [`DEFAULT_SOCKET_DIR`](crate::DEFAULT_SOCKET_DIR).
    pub socket_dir: Option<PathBuf>,
    /// Whether the host application asked for library tracing.
    /// Retained across restarts; filtering is the subscriber's job.
    pub tracing_enabled: bool,
    /// Invoked when the daemon signals a reset.
    pub reset_callback: Option<ResetCallback>,
    /// Delay before each reconnection attempt in [`Session::restart`];
    /// `None` selects one second.
    pub restart_backoff: Option<Duration>,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("instance_name", &self.instance_name)
            .field("socket_dir", &self.socket_dir)
            .field("tracing_enabled", &self.tracing_enabled)
            .field("has_reset_callback", &self.reset_callback.is_some())
            .field("restart_backoff", &self.restart_backoff)
            .finish()
    }
}

const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// A process's connection to one CPC daemon instance.
///
/// Thread-safe shared object: any number of threads may issue
/// operations concurrently; control-plane exchanges are serialized by
/// the control channel's lock.
pub struct Session {
    instance_name: String,
    socket_dir: PathBuf,
    tracing_enabled: bool,
    restart_backoff: Duration,
    channel: Mutex<Option<Arc<ControlChannel>>>,
}

impl Session {
    /// Connect to the daemon and perform the session handshake.
    ///
    /// Registers the reset callback, if configured, before touching the
    /// socket so a reset racing initialization is not lost.
    pub fn initialize(config: SessionConfig) -> Result<Session> {
        let instance_name = config
            .instance_name
            .unwrap_or_else(|| DEFAULT_INSTANCE_NAME.to_string());
        let socket_dir = config
            .socket_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_DIR));

        if let Some(callback) = config.reset_callback {
            reset::register_reset_callback(callback)?;
        }

        let channel = Self::connect_channel(&socket_dir, &instance_name)?;

        info!(instance = %instance_name, "cpc session initialized");
        Ok(Session {
            instance_name,
            socket_dir,
            tracing_enabled: config.tracing_enabled,
            restart_backoff: config.restart_backoff.unwrap_or(DEFAULT_RESTART_BACKOFF),
            channel: Mutex::new(Some(Arc::new(channel))),
        })
    }

    fn connect_channel(socket_dir: &std::path::Path, instance_name: &str) -> Result<ControlChannel> {
        let mut channel = ControlChannel::connect(socket_dir, instance_name)?;
        channel.handshake()?;
        Ok(channel)
    }

    /// Reconnect after a daemon reset.
    ///
    /// Tears down the current control channel, then retries
    /// initialization with the stored parameters up to
    /// [`RESTART_ATTEMPTS`](crate::RESTART_ATTEMPTS) times, sleeping
    /// the configured backoff before each attempt. Returns on the
    /// first attempt that completes the handshake; otherwise the last
    /// error.
    pub fn restart(&self) -> Result<()> {
        {
            let mut slot = self
                .channel
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            // Dropping the channel closes the control socket and
            // invalidates every endpoint's weak reference.
            *slot = None;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            std::thread::sleep(self.restart_backoff);
            match Self::connect_channel(&self.socket_dir, &self.instance_name) {
                Ok(channel) => {
                    *self
                        .channel
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner) =
                        Some(Arc::new(channel));
                    info!(instance = %self.instance_name, attempt, "cpc session reconnected");
                    return Ok(());
                }
                Err(err) if attempt < RESTART_ATTEMPTS => {
                    warn!(attempt, error = %err, "reinitialization attempt failed");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Open endpoint `id` through the two-phase handshake.
    pub fn open_endpoint(&self, id: u8) -> Result<Endpoint> {
        let channel = self.channel()?;
        Endpoint::open(&channel, &self.socket_dir, &self.instance_name, id)
    }

    /// Query the daemon-side state of endpoint `id`.
    pub fn endpoint_state(&self, id: u8) -> Result<EndpointState> {
        self.channel()?.query_endpoint_state(id)
    }

    /// Negotiated maximum write size for this session.
    pub fn max_write_size(&self) -> Result<usize> {
        Ok(self.channel()?.max_write_size())
    }

    /// Instance this session is attached to. Fixed at initialization.
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Whether the host application asked for library tracing.
    pub fn tracing_enabled(&self) -> bool {
        self.tracing_enabled
    }

    fn channel(&self) -> Result<Arc<ControlChannel>> {
        self.channel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .cloned()
            .ok_or(Error::InvalidState)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("instance_name", &self.instance_name)
            .field("socket_dir", &self.socket_dir)
            .field("tracing_enabled", &self.tracing_enabled)
            .finish_non_exhaustive()
    }
}
