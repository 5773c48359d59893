//! ipp-usb
//!
//! HTTP reverse proxy backed by IPP-over-USB connections to printers and
//! MFPs, with DNS-SD advertisement of the discovered services.
//!
//! The problem this daemon solves is an asymmetry in the IPP-over-USB
//! protocol: closing a TCP socket quietly discards in-flight
//! server-to-client data, but unread bytes on a USB bulk endpoint stay
//! in the device's buffer and corrupt the next transaction. The daemon
//! therefore terminates HTTP on the TCP side and reads every device
//! response to the exact end of its framing before the endpoint pair is
//! reused; see [`usb::transport`].

pub mod config;
pub mod device;
pub mod dnssd;
pub mod err;
pub mod escl;
pub mod http;
pub mod inifile;
pub mod ipp;
pub mod lock;
pub mod logging;
pub mod paths;
pub mod pnp;
pub mod quirks;
pub mod state;
pub mod usb;

pub use err::{Error, Result};
