//! USB subsystem
//!
//! Address model, IPP-over-USB discovery, the hot-plug watcher and the
//! transport that multiplexes HTTP transactions over bulk endpoint
//! pairs.

pub mod addr;
pub mod discover;
pub mod hotplug;
pub mod info;
pub mod io;
pub mod transport;

pub use addr::{UsbAddr, UsbAddrList, UsbDeviceDesc, UsbIfAddr};
pub use info::UsbDeviceInfo;
pub use transport::UsbTransport;
