//! Filesystem layout
//!
//! All well-known paths the daemon touches, collected in one place so that
//! tests can point the daemon at a scratch directory.

use std::path::PathBuf;

/// Default configuration file location.
pub const CONF_FILE: &str = "/etc/ipp-usb/ipp-usb.conf";

/// Directory with quirks files (`*.conf`).
pub const QUIRKS_DIR: &str = "/usr/share/ipp-usb/quirks";

/// Directory with per-device persistent state files.
pub const DEV_STATE_DIR: &str = "/var/ipp-usb/dev";

/// Directory with the single-instance lock file.
pub const LOCK_DIR: &str = "/var/ipp-usb/lock";

/// The single-instance lock file itself.
pub const LOCK_FILE: &str = "/var/ipp-usb/lock/ipp-usb.lock";

/// Directory with log files (main.log plus one per device).
pub const LOG_DIR: &str = "/var/log/ipp-usb";

/// Resolved filesystem layout, overridable for tests.
#[derive(Debug, Clone)]
pub struct Paths {
    pub conf_file: PathBuf,
    pub quirks_dir: PathBuf,
    pub dev_state_dir: PathBuf,
    pub lock_file: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            conf_file: PathBuf::from(CONF_FILE),
            quirks_dir: PathBuf::from(QUIRKS_DIR),
            dev_state_dir: PathBuf::from(DEV_STATE_DIR),
            lock_file: PathBuf::from(LOCK_FILE),
            log_dir: PathBuf::from(LOG_DIR),
        }
    }
}

