//! Well-known socket path scheme shared with the daemon.
//!
//! All sockets for one daemon instance live under
//! `<dir>/cpcd/<instance>/`: the control socket plus one socket per
//! endpoint. Every control operation resolves through the same
//! per-instance rule.

use std::path::{Path, PathBuf};

/// Path of the per-instance control socket.
pub fn control_socket(socket_dir: &Path, instance_name: &str) -> PathBuf {
    socket_dir
        .join("cpcd")
        .join(instance_name)
        .join("ctrl.cpcd.sock")
}

/// Path of the per-endpoint data socket.
pub fn endpoint_socket(socket_dir: &Path, instance_name: &str, id: u8) -> PathBuf {
    socket_dir
        .join("cpcd")
        .join(instance_name)
        .join(format!("ep{id}.cpcd.sock"))
}
