//! PnP loop
//!
//! The single task that owns the authoritative `UsbAddr → Device` map:
//! enumerate, diff against the previous bus state, bring up arrivals,
//! tear down departures, then sleep until the hot-plug watcher fires.

use std::collections::HashMap;

use tracing::{debug, error, info};

use crate::device::{DaemonEnv, Device};
use crate::err::{Error, Result};
use crate::usb::addr::{UsbAddr, UsbAddrList};
use crate::usb::{discover, hotplug::HotplugWatcher};

/// How the loop decides it is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PnpMode {
    /// Run until interrupted.
    Standalone,
    /// Run until the last device disappears (the udev rule started us
    /// for a specific device).
    Udev,
}

/// Run the PnP loop until shutdown. Returns after every device has been
/// torn down.
pub async fn run(env: DaemonEnv, mode: PnpMode) -> Result<()> {
    let watcher = HotplugWatcher::new(&env.usb)?;
    let mut devices: HashMap<UsbAddr, Device> = HashMap::new();
    let mut known = UsbAddrList::new();
    let mut had_devices = false;

    info!(?mode, "PnP loop started");

    loop {
        let current = enumerate(&env).await?;
        let (added, removed) = known.diff(&current);
        known = current;

        for addr in added.iter() {
            debug!(%addr, "PNP: added");
            match Device::bring_up(&env, addr).await {
                Ok(device) => {
                    devices.insert(addr, device);
                }
                Err(Error::Blacklisted) => {
                    info!(%addr, "PNP: device is blacklisted, ignoring");
                }
                Err(e) => {
                    error!(%addr, error = %e, "PNP: bring-up failed");
                }
            }
        }

        for addr in removed.iter() {
            debug!(%addr, "PNP: removed");
            if let Some(device) = devices.remove(&addr) {
                device.close().await;
            }
        }

        if !devices.is_empty() {
            had_devices = true;
        }
        if mode == PnpMode::Udev && had_devices && devices.is_empty() {
            info!("last device gone, leaving (udev mode)");
            break;
        }

        tokio::select! {
            result = watcher.wait() => {
                if result.is_err() {
                    error!("hotplug watcher gone, shutting down");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
        }
    }

    for (_, device) in devices.drain() {
        device.close().await;
    }
    Ok(())
}

/// Bus enumeration happens on a blocking thread; libusb control
/// transfers have no async form.
async fn enumerate(env: &DaemonEnv) -> Result<UsbAddrList> {
    let usb = env.usb.clone();
    tokio::task::spawn_blocking(move || discover::enumerate(&usb))
        .await
        .map_err(|e| Error::UsbOpen(e.to_string()))?
}
