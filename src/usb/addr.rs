//! USB address model
//!
//! Addresses of devices and their IPP-over-USB interfaces. Address lists
//! are kept sorted and deduplicated so that diffs, logs and reconciliation
//! are deterministic.

use std::fmt;

/// Address of a device on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UsbAddr {
    pub bus: u8,
    pub device: u8,
}

impl fmt::Display for UsbAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bus {:03} Device {:03}", self.bus, self.device)
    }
}

/// Sorted, deduplicated list of device addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbAddrList(Vec<UsbAddr>);

impl UsbAddrList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping sort order; inserting an existing address is a no-op.
    pub fn add(&mut self, addr: UsbAddr) {
        match self.0.binary_search(&addr) {
            Ok(_) => {}
            Err(pos) => self.0.insert(pos, addr),
        }
    }

    pub fn contains(&self, addr: UsbAddr) -> bool {
        self.0.binary_search(&addr).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = UsbAddr> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Elements to add to and remove from `self` to obtain `other`.
    /// Both outputs come out sorted and disjoint.
    pub fn diff(&self, other: &UsbAddrList) -> (UsbAddrList, UsbAddrList) {
        let mut added = UsbAddrList::new();
        let mut removed = UsbAddrList::new();

        for addr in other.iter() {
            if !self.contains(addr) {
                added.add(addr);
            }
        }
        for addr in self.iter() {
            if !other.contains(addr) {
                removed.add(addr);
            }
        }

        (added, removed)
    }
}

impl FromIterator<UsbAddr> for UsbAddrList {
    fn from_iter<I: IntoIterator<Item = UsbAddr>>(iter: I) -> Self {
        let mut list = UsbAddrList::new();
        for addr in iter {
            list.add(addr);
        }
        list
    }
}

/// Full address of one IPP-over-USB interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbIfAddr {
    pub addr: UsbAddr,
    /// bInterfaceNumber
    pub num: u8,
    /// bAlternateSetting carrying the IPP-over-USB protocol
    pub alt: u8,
    /// Bulk IN endpoint address (direction bit set).
    pub in_ep: u8,
    /// Bulk OUT endpoint address.
    pub out_ep: u8,
}

impl fmt::Display for UsbIfAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Interface {} Alt {}", self.addr, self.num, self.alt)
    }
}

/// Everything needed to claim a device: the chosen configuration and its
/// IPP-over-USB interfaces. `if_addrs` is non-empty by construction.
#[derive(Debug, Clone)]
pub struct UsbDeviceDesc {
    pub addr: UsbAddr,
    /// bConfigurationValue all interfaces live in.
    pub config: u8,
    pub if_addrs: Vec<UsbIfAddr>,
}
