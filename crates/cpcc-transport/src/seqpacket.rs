use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};

/// Maximum socket path length.
/// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
#[cfg(target_os = "linux")]
const MAX_PATH_LEN: usize = 108;
#[cfg(not(target_os = "linux"))]
const MAX_PATH_LEN: usize = 104;

/// Default permission mode for created socket paths.
const DEFAULT_SOCKET_MODE: u32 = 0o600;

fn sockaddr_un(path: &Path) -> Result<libc::sockaddr_un> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= MAX_PATH_LEN {
        return Err(TransportError::PathTooLong {
            path: path.to_path_buf(),
            len: bytes.len(),
            max: MAX_PATH_LEN,
        });
    }

    // SAFETY: sockaddr_un is plain old data; an all-zero value is valid.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }
    Ok(addr)
}

fn new_seqpacket_fd() -> io::Result<OwnedFd> {
    // SAFETY: plain socket(2) call; the returned descriptor is owned here.
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just returned by socket(2) and is not owned elsewhere.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(target_os = "linux")]
const SEND_BASE_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_BASE_FLAGS: libc::c_int = 0;

/// A connected sequenced-packet Unix domain socket.
///
/// Message boundaries are preserved by the kernel: a `send` transfers
/// the whole buffer or fails, and a `recv` returns exactly one queued
/// message. The descriptor is closed on drop.
///
/// All operations take `&self`; serialization of concurrent callers,
/// where required, is the responsibility of the layer above.
#[derive(Debug)]
pub struct SeqPacketSocket {
    fd: OwnedFd,
}

impl SeqPacketSocket {
    /// Connect to a listening seqpacket socket (blocking).
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let addr = sockaddr_un(path)?;
        let fd = new_seqpacket_fd().map_err(|e| TransportError::Connect {
            path: path.to_path_buf(),
            source: e,
        })?;

        // SAFETY: addr is a fully initialized sockaddr_un and fd is open.
        let rc = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                (&addr as *const libc::sockaddr_un).cast::<libc::sockaddr>(),
                std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(TransportError::Connect {
                path: path.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }

        let socket = Self { fd };
        #[cfg(not(target_os = "linux"))]
        socket.set_nosigpipe().map_err(|e| TransportError::Connect {
            path: path.to_path_buf(),
            source: e,
        })?;

        debug!(?path, "connected to seqpacket socket");
        Ok(socket)
    }

    /// Send one message (blocking). Returns the number of bytes sent.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.send_with_flags(buf, SEND_BASE_FLAGS)
    }

    /// Send one message without blocking.
    ///
    /// Fails with `ErrorKind::WouldBlock` if the send buffer is full.
    pub fn send_nonblocking(&self, buf: &[u8]) -> io::Result<usize> {
        self.send_with_flags(buf, SEND_BASE_FLAGS | libc::MSG_DONTWAIT)
    }

    /// Receive one message (blocking). Returns 0 when the peer closed.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv_with_flags(buf, 0)
    }

    /// Receive one message without blocking.
    ///
    /// Fails with `ErrorKind::WouldBlock` if no message is queued.
    pub fn recv_nonblocking(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv_with_flags(buf, libc::MSG_DONTWAIT)
    }

    fn send_with_flags(&self, buf: &[u8], flags: libc::c_int) -> io::Result<usize> {
        loop {
            // SAFETY: buf is valid for buf.len() bytes and fd is open.
            let rc = unsafe {
                libc::send(
                    self.fd.as_raw_fd(),
                    buf.as_ptr().cast::<libc::c_void>(),
                    buf.len(),
                    flags,
                )
            };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn recv_with_flags(&self, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
        loop {
            // SAFETY: buf is valid for writes of buf.len() bytes and fd is open.
            let rc = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr().cast::<libc::c_void>(),
                    buf.len(),
                    flags,
                )
            };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Set the receive timeout (`SO_RCVTIMEO`). `None` clears it.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_timeout(libc::SO_RCVTIMEO, timeout)
    }

    /// Current receive timeout, `None` if the socket blocks forever.
    pub fn read_timeout(&self) -> io::Result<Option<Duration>> {
        self.timeout(libc::SO_RCVTIMEO)
    }

    /// Set the send timeout (`SO_SNDTIMEO`). `None` clears it.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_timeout(libc::SO_SNDTIMEO, timeout)
    }

    /// Current send timeout, `None` if the socket blocks forever.
    pub fn write_timeout(&self) -> io::Result<Option<Duration>> {
        self.timeout(libc::SO_SNDTIMEO)
    }

    fn set_timeout(&self, opt: libc::c_int, timeout: Option<Duration>) -> io::Result<()> {
        let tv = match timeout {
            Some(d) if d.is_zero() => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "cannot set a zero duration timeout",
                ));
            }
            Some(d) => libc::timeval {
                tv_sec: d.as_secs() as libc::time_t,
                tv_usec: d.subsec_micros() as libc::suseconds_t,
            },
            None => libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        };
        // SAFETY: tv lives for the duration of the call; sizes match.
        let rc = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                opt,
                (&tv as *const libc::timeval).cast::<libc::c_void>(),
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn timeout(&self, opt: libc::c_int) -> io::Result<Option<Duration>> {
        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        let mut len = std::mem::size_of::<libc::timeval>() as libc::socklen_t;
        // SAFETY: tv and len are valid writable pointers for the provided sizes.
        let rc = unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                opt,
                (&mut tv as *mut libc::timeval).cast::<libc::c_void>(),
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        if tv.tv_sec == 0 && tv.tv_usec == 0 {
            return Ok(None);
        }
        Ok(Some(
            Duration::from_secs(tv.tv_sec as u64) + Duration::from_micros(tv.tv_usec as u64),
        ))
    }

    /// Set the kernel send buffer size (`SO_SNDBUF`).
    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        let value = libc::c_int::try_from(size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "buffer size out of range"))?;
        // SAFETY: value lives for the duration of the call; sizes match.
        let rc = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                (&value as *const libc::c_int).cast::<libc::c_void>(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Kernel send buffer size as reported by `SO_SNDBUF`.
    ///
    /// Linux reports double the requested value (it accounts for
    /// bookkeeping overhead); the raw kernel figure is returned as-is.
    pub fn send_buffer_size(&self) -> io::Result<usize> {
        let mut value: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: value and len are valid writable pointers for the provided sizes.
        let rc = unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                (&mut value as *mut libc::c_int).cast::<libc::c_void>(),
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(value as usize)
    }

    /// Switch the descriptor between blocking and non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        // SAFETY: fcntl on an open descriptor owned by self.
        let flags = unsafe { libc::fcntl(self.fd.as_raw_fd(), libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        // SAFETY: as above.
        let rc = unsafe { libc::fcntl(self.fd.as_raw_fd(), libc::F_SETFL, flags) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Whether `O_NONBLOCK` is currently set on the descriptor.
    pub fn is_nonblocking(&self) -> io::Result<bool> {
        // SAFETY: fcntl on an open descriptor owned by self.
        let flags = unsafe { libc::fcntl(self.fd.as_raw_fd(), libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(flags & libc::O_NONBLOCK != 0)
    }

    #[cfg(not(target_os = "linux"))]
    fn set_nosigpipe(&self) -> io::Result<()> {
        let value: libc::c_int = 1;
        // SAFETY: value lives for the duration of the call; sizes match.
        let rc = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                (&value as *const libc::c_int).cast::<libc::c_void>(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn from_owned(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsRawFd for SeqPacketSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Listening side of a seqpacket socket.
///
/// The client core only connects; the listener exists for the daemon
/// side of integration tests and tooling. The bound path is created
/// with mode 0o600, stale sockets at the path are cleaned up first,
/// and the path is unlinked on drop when its identity is unchanged.
pub struct SeqPacketListener {
    fd: OwnedFd,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
}

impl SeqPacketListener {
    /// Bind and listen on a filesystem-path seqpacket socket.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let addr = sockaddr_un(&path)?;

        // Remove a stale socket if it exists, but never remove non-socket files.
        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(|e| TransportError::Bind {
                path: path.clone(),
                source: e,
            })?;
            if metadata.file_type().is_socket() {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(|e| TransportError::Bind {
                    path: path.clone(),
                    source: e,
                })?;
            } else {
                return Err(TransportError::Bind {
                    path: path.clone(),
                    source: io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                });
            }
        }

        let fd = new_seqpacket_fd().map_err(|e| TransportError::Bind {
            path: path.clone(),
            source: e,
        })?;

        // SAFETY: addr is a fully initialized sockaddr_un and fd is open.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&addr as *const libc::sockaddr_un).cast::<libc::sockaddr>(),
                std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(TransportError::Bind {
                path: path.clone(),
                source: io::Error::last_os_error(),
            });
        }

        // SAFETY: fd is a bound socket.
        let rc = unsafe { libc::listen(fd.as_raw_fd(), 16) };
        if rc != 0 {
            return Err(TransportError::Bind {
                path: path.clone(),
                source: io::Error::last_os_error(),
            });
        }

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(DEFAULT_SOCKET_MODE))
            .map_err(|e| TransportError::Bind {
                path: path.clone(),
                source: e,
            })?;
        let created_metadata =
            std::fs::symlink_metadata(&path).map_err(|e| TransportError::Bind {
                path: path.clone(),
                source: e,
            })?;
        let created_inode = Some((created_metadata.dev(), created_metadata.ino()));

        info!(?path, "listening on seqpacket socket");

        Ok(Self {
            fd,
            path,
            created_inode,
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<SeqPacketSocket> {
        loop {
            #[cfg(target_os = "linux")]
            // SAFETY: fd is a listening socket; the address output is unused.
            let rc = unsafe {
                libc::accept4(
                    self.fd.as_raw_fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_CLOEXEC,
                )
            };
            #[cfg(not(target_os = "linux"))]
            // SAFETY: fd is a listening socket; the address output is unused.
            let rc = unsafe {
                libc::accept(
                    self.fd.as_raw_fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                )
            };
            if rc >= 0 {
                debug!("accepted connection");
                // SAFETY: rc was just returned by accept and is not owned elsewhere.
                return Ok(SeqPacketSocket::from_owned(unsafe {
                    OwnedFd::from_raw_fd(rc)
                }));
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(TransportError::Accept(err));
            }
        }
    }

    /// The path this listener is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SeqPacketListener {
    fn drop(&mut self) {
        if let Some((expected_dev, expected_ino)) = self.created_inode {
            if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
                if metadata.file_type().is_socket()
                    && metadata.dev() == expected_dev
                    && metadata.ino() == expected_ino
                {
                    debug!(path = ?self.path, "cleaning up socket file");
                    let _ = std::fs::remove_file(&self.path);
                } else {
                    debug!(
                        path = ?self.path,
                        "socket path identity changed; skipping cleanup"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sock_path(tag: &str) -> PathBuf {
        let dir = PathBuf::from(format!(
            "/tmp/cpcc-tr-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir.join("test.sock")
    }

    fn cleanup(path: &Path) {
        if let Some(parent) = path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn connect_send_recv_preserves_message_boundaries() {
        let sock_path = make_sock_path("boundaries");
        let listener = SeqPacketListener::bind(&sock_path).expect("listener should bind");

        let path_clone = sock_path.clone();
        let client = std::thread::spawn(move || {
            let socket = SeqPacketSocket::connect(&path_clone).expect("client should connect");
            socket.send(b"first").expect("first send should succeed");
            socket.send(b"second").expect("second send should succeed");
        });

        let server = listener.accept().expect("listener should accept");
        let mut buf = [0u8; 64];
        let n = server.recv(&mut buf).expect("first recv should succeed");
        assert_eq!(&buf[..n], b"first");
        let n = server.recv(&mut buf).expect("second recv should succeed");
        assert_eq!(&buf[..n], b"second");

        client.join().expect("client thread should complete");
        drop(server);
        drop(listener);
        assert!(!sock_path.exists(), "socket file should be removed on drop");
        cleanup(&sock_path);
    }

    #[test]
    fn recv_returns_zero_after_peer_close() {
        let sock_path = make_sock_path("close");
        let listener = SeqPacketListener::bind(&sock_path).expect("listener should bind");

        let client = SeqPacketSocket::connect(&sock_path).expect("client should connect");
        let server = listener.accept().expect("listener should accept");
        drop(server);

        let mut buf = [0u8; 16];
        let n = client.recv(&mut buf).expect("recv should not error on close");
        assert_eq!(n, 0);
        cleanup(&sock_path);
    }

    #[test]
    fn recv_nonblocking_reports_would_block() {
        let sock_path = make_sock_path("nonblock");
        let listener = SeqPacketListener::bind(&sock_path).expect("listener should bind");
        let client = SeqPacketSocket::connect(&sock_path).expect("client should connect");
        let _server = listener.accept().expect("listener should accept");

        let mut buf = [0u8; 16];
        let err = client
            .recv_nonblocking(&mut buf)
            .expect_err("empty queue should not yield data");
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        cleanup(&sock_path);
    }

    #[test]
    fn read_timeout_round_trips_and_expires() {
        let sock_path = make_sock_path("timeout");
        let listener = SeqPacketListener::bind(&sock_path).expect("listener should bind");
        let client = SeqPacketSocket::connect(&sock_path).expect("client should connect");
        let _server = listener.accept().expect("listener should accept");

        assert!(client
            .read_timeout()
            .expect("timeout query should succeed")
            .is_none());
        client
            .set_read_timeout(Some(Duration::from_millis(50)))
            .expect("timeout should be settable");
        let configured = client
            .read_timeout()
            .expect("timeout query should succeed")
            .expect("timeout should be set");
        assert!(configured >= Duration::from_millis(50));

        let mut buf = [0u8; 16];
        let err = client
            .recv(&mut buf)
            .expect_err("recv should time out with no data");
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));
        cleanup(&sock_path);
    }

    #[test]
    fn zero_duration_timeout_is_rejected() {
        let sock_path = make_sock_path("zerotimeout");
        let listener = SeqPacketListener::bind(&sock_path).expect("listener should bind");
        let client = SeqPacketSocket::connect(&sock_path).expect("client should connect");
        let _server = listener.accept().expect("listener should accept");

        let err = client
            .set_read_timeout(Some(Duration::ZERO))
            .expect_err("zero timeout should be rejected");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        cleanup(&sock_path);
    }

    #[test]
    fn nonblocking_mode_round_trips() {
        let sock_path = make_sock_path("mode");
        let listener = SeqPacketListener::bind(&sock_path).expect("listener should bind");
        let client = SeqPacketSocket::connect(&sock_path).expect("client should connect");
        let _server = listener.accept().expect("listener should accept");

        assert!(!client
            .is_nonblocking()
            .expect("mode query should succeed"));
        client
            .set_nonblocking(true)
            .expect("mode should be settable");
        assert!(client.is_nonblocking().expect("mode query should succeed"));
        client
            .set_nonblocking(false)
            .expect("mode should be settable");
        assert!(!client
            .is_nonblocking()
            .expect("mode query should succeed"));
        cleanup(&sock_path);
    }

    #[test]
    fn bind_path_too_long() {
        let long_path = "/tmp/".to_string() + &"a".repeat(200) + ".sock";
        let result = SeqPacketListener::bind(&long_path);
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[test]
    fn bind_rejects_existing_non_socket_file() {
        let sock_path = make_sock_path("notasocket");
        std::fs::write(&sock_path, b"regular-file").expect("file should be writable");

        let result = SeqPacketListener::bind(&sock_path);
        assert!(matches!(result, Err(TransportError::Bind { .. })));
        cleanup(&sock_path);
    }

    #[test]
    fn connect_to_absent_path_fails() {
        let sock_path = make_sock_path("absent");
        let result = SeqPacketSocket::connect(&sock_path);
        assert!(matches!(result, Err(TransportError::Connect { .. })));
        cleanup(&sock_path);
    }
}
