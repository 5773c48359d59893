//! Daemon-wide error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(String),

    #[error("ipp-usb already running")]
    LockBusy,

    #[error("this program requires root privileges")]
    Permission,

    #[error("no free port in the configured HTTP port range")]
    PortRangeExhausted,

    #[error("cannot open USB device: {0}")]
    UsbOpen(String),

    #[error("device is blacklisted")]
    Blacklisted,

    #[error("USB I/O: {0}")]
    Usb(#[from] rusb::Error),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("shutdown requested")]
    Shutdown,

    #[error("IPP: {0}")]
    Ipp(String),

    #[error("eSCL: {0}")]
    Escl(String),

    #[error("DNS-SD: {0}")]
    DnsSd(String),

    #[error("transport is not available")]
    TransportUnavailable,
}

pub type Result<T> = std::result::Result<T, Error>;
