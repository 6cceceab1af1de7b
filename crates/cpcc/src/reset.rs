//! Daemon-initiated reset notification.
//!
//! The daemon signals a reset by sending `SIGUSR1` to registered
//! clients. Arbitrary user callbacks are not async-signal-safe, so the
//! handler only writes one byte to a self-pipe; a dedicated watcher
//! thread blocks on the pipe's read end and invokes the registered
//! callback with no library lock held. One watcher serves the whole
//! process (signals are process-wide); the callback slot is refreshed
//! on every session initialization.

use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::session::ResetCallback;

static NOTIFY_WRITE_FD: AtomicI32 = AtomicI32::new(-1);
static CALLBACK: Mutex<Option<ResetCallback>> = Mutex::new(None);
static WATCHER: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Register `callback` to run when the daemon signals a reset.
///
/// The first call installs the signal handler and spawns the watcher
/// thread; later calls only swap the callback.
pub(crate) fn register_reset_callback(callback: ResetCallback) -> Result<()> {
    *CALLBACK
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(callback);

    match WATCHER.get_or_init(|| install_watcher().map_err(|e| e.to_string())) {
        Ok(()) => Ok(()),
        Err(message) => Err(Error::Io(io::Error::other(message.clone()))),
    }
}

fn install_watcher() -> io::Result<()> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds is a valid writable array of two c_ints.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);
    for fd in [read_fd, write_fd] {
        // SAFETY: fd was just returned by pipe(2).
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    NOTIFY_WRITE_FD.store(write_fd, Ordering::SeqCst);

    // SAFETY: sigaction is plain old data; an all-zero value is valid.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = on_reset_signal as libc::sighandler_t;
    action.sa_flags = libc::SA_RESTART;
    // SAFETY: action.sa_mask is a valid sigset_t; the handler stays
    // installed for the process lifetime, as the daemon expects.
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    std::thread::Builder::new()
        .name("cpc-reset".into())
        .spawn(move || watch(read_fd))?;
    Ok(())
}

/// Signal handler: only async-signal-safe work happens here.
extern "C" fn on_reset_signal(_signum: libc::c_int) {
    let fd = NOTIFY_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = 1u8;
        // SAFETY: write(2) is async-signal-safe; a failed or partial
        // write only drops a notification that is already pending.
        unsafe { libc::write(fd, (&byte as *const u8).cast(), 1) };
    }
}

fn watch(read_fd: libc::c_int) {
    let mut byte = 0u8;
    loop {
        // SAFETY: byte is a valid writable buffer of one byte.
        let n = unsafe { libc::read(read_fd, (&mut byte as *mut u8).cast(), 1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(error = %err, "reset watcher pipe failed");
            return;
        }
        if n == 0 {
            return;
        }

        // Clone the callback out and drop the guard before invoking:
        // the callback runs with no library lock held.
        let callback = CALLBACK
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            debug!("daemon signaled a reset");
            callback();
        }
    }
}
