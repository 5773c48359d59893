//! IPP-over-USB device discovery
//!
//! Walks descriptors looking for interfaces of class 7 (printer),
//! subclass 1, protocol 4 (IPP-over-USB) with a bulk IN/OUT endpoint pair,
//! and opens devices for the transport: configuration selected, kernel
//! driver detached, every IPP-over-USB interface claimed.

use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use tracing::{debug, warn};

use crate::err::{Error, Result};
use crate::usb::addr::{UsbAddr, UsbAddrList, UsbDeviceDesc, UsbIfAddr};
use crate::usb::info::UsbDeviceInfo;

const IPP_USB_CLASS: u8 = 0x07;
const IPP_USB_SUBCLASS: u8 = 0x01;
const IPP_USB_PROTOCOL: u8 = 0x04;

/// A device opened and claimed, ready to back a transport.
pub struct OpenedDevice {
    pub handle: DeviceHandle<Context>,
    pub desc: UsbDeviceDesc,
    pub info: UsbDeviceInfo,
}

/// Addresses of all IPP-over-USB devices currently on the bus, sorted.
pub fn enumerate(context: &Context) -> Result<UsbAddrList> {
    let mut list = UsbAddrList::new();

    for device in context.devices()?.iter() {
        match describe(&device) {
            Ok(Some(desc)) => list.add(desc.addr),
            Ok(None) => {}
            Err(e) => debug!(
                bus = device.bus_number(),
                device = device.address(),
                error = %e,
                "skipping undescribable device"
            ),
        }
    }

    Ok(list)
}

/// Build the IPP-over-USB descriptor of a device, or `None` when the
/// device does not expose the protocol in any configuration.
pub fn describe(device: &Device<Context>) -> Result<Option<UsbDeviceDesc>> {
    let addr = UsbAddr {
        bus: device.bus_number(),
        device: device.address(),
    };
    let descriptor = device.device_descriptor()?;

    for cfg_index in 0..descriptor.num_configurations() {
        let config = match device.config_descriptor(cfg_index) {
            Ok(c) => c,
            Err(e) => {
                debug!(%addr, config = cfg_index, error = %e, "unreadable configuration");
                continue;
            }
        };

        let mut if_addrs = Vec::new();
        for interface in config.interfaces() {
            for alt in interface.descriptors() {
                if alt.class_code() != IPP_USB_CLASS
                    || alt.sub_class_code() != IPP_USB_SUBCLASS
                    || alt.protocol_code() != IPP_USB_PROTOCOL
                {
                    continue;
                }

                let mut in_ep = None;
                let mut out_ep = None;
                for endpoint in alt.endpoint_descriptors() {
                    if endpoint.transfer_type() != TransferType::Bulk {
                        continue;
                    }
                    match endpoint.direction() {
                        Direction::In => in_ep = Some(endpoint.address()),
                        Direction::Out => out_ep = Some(endpoint.address()),
                    }
                }

                if let (Some(in_ep), Some(out_ep)) = (in_ep, out_ep) {
                    if_addrs.push(UsbIfAddr {
                        addr,
                        num: alt.interface_number(),
                        alt: alt.setting_number(),
                        in_ep,
                        out_ep,
                    });
                    // One IPP-over-USB alt setting per interface.
                    break;
                }
            }
        }

        if !if_addrs.is_empty() {
            return Ok(Some(UsbDeviceDesc {
                addr,
                config: config.number(),
                if_addrs,
            }));
        }
    }

    Ok(None)
}

/// Read device identity without claiming anything, so that blacklisted
/// devices are never touched beyond their descriptors.
pub fn read_device_info(context: &Context, addr: UsbAddr) -> Result<UsbDeviceInfo> {
    let device = context
        .devices()?
        .iter()
        .find(|d| d.bus_number() == addr.bus && d.address() == addr.device)
        .ok_or_else(|| Error::UsbOpen(format!("{addr}: no longer present")))?;
    let handle = device
        .open()
        .map_err(|e| Error::UsbOpen(format!("{addr}: {e}")))?;
    read_info(&device, &handle)
}

/// Open the device at `addr` and claim its IPP-over-USB interfaces.
pub fn open(context: &Context, addr: UsbAddr) -> Result<OpenedDevice> {
    let device = context
        .devices()?
        .iter()
        .find(|d| d.bus_number() == addr.bus && d.address() == addr.device)
        .ok_or_else(|| Error::UsbOpen(format!("{addr}: no longer present")))?;

    let desc = describe(&device)?
        .ok_or_else(|| Error::UsbOpen(format!("{addr}: no IPP-over-USB interfaces")))?;

    let mut handle = device
        .open()
        .map_err(|e| Error::UsbOpen(format!("{addr}: {e}")))?;

    if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
        // Not supported on all platforms.
        debug!(%addr, error = %e, "auto-detach of kernel driver not available");
    }

    let info = read_info(&device, &handle)?;

    match handle.active_configuration() {
        Ok(active) if active == desc.config => {}
        _ => {
            handle
                .set_active_configuration(desc.config)
                .map_err(|e| Error::UsbOpen(format!("{addr}: set configuration: {e}")))?;
        }
    }

    for ifaddr in &desc.if_addrs {
        handle
            .claim_interface(ifaddr.num)
            .map_err(|e| Error::UsbOpen(format!("{ifaddr}: claim: {e}")))?;
        if ifaddr.alt != 0 {
            if let Err(e) = handle.set_alternate_setting(ifaddr.num, ifaddr.alt) {
                warn!(%ifaddr, error = %e, "cannot select alternate setting");
            }
        }
    }

    debug!(
        %addr,
        interfaces = desc.if_addrs.len(),
        product = %info.product_name,
        "device opened"
    );

    Ok(OpenedDevice { handle, desc, info })
}

/// Read descriptor-level device information, string descriptors included.
fn read_info(device: &Device<Context>, handle: &DeviceHandle<Context>) -> Result<UsbDeviceInfo> {
    let descriptor = device.device_descriptor()?;

    let read_string = |index: Option<u8>| -> String {
        index
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };

    Ok(UsbDeviceInfo {
        vendor: descriptor.vendor_id(),
        product: descriptor.product_id(),
        serial: read_string(descriptor.serial_number_string_index()),
        manufacturer: read_string(descriptor.manufacturer_string_index()),
        product_name: read_string(descriptor.product_string_index()),
    })
}
