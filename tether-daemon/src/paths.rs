use std::path::{Path, PathBuf};

pub const DAEMON_LABEL: &str = "dev.tether.daemon";
pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn tether_root(home: &Path) -> PathBuf {
    tether_core::store::tether_root(home)
}

pub fn socket_path(home: &Path) -> PathBuf {
    tether_root(home).join(DAEMON_SOCKET)
}

pub fn store_path(home: &Path) -> PathBuf {
    tether_core::store::store_path_at(home)
}

pub fn config_path(home: &Path) -> PathBuf {
    tether_core::config::config_path_at(home)
}
