//! Hot-plug watcher
//!
//! Delivers a token on a bounded channel whenever the bus topology
//! changes. The channel has capacity one, so bursts of events coalesce
//! into a single wakeup; the PnP loop re-enumerates and diffs anyway.
//!
//! libusb only surfaces hotplug callbacks while someone pumps its event
//! loop, so the watcher also owns a small pump thread. On platforms
//! without hotplug support it degrades to periodic polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use tracing::{debug, info, warn};

use crate::err::{Error, Result};

const EVENT_PUMP_TICK: Duration = Duration::from_millis(250);
const POLL_FALLBACK_TICK: Duration = Duration::from_secs(3);

pub struct HotplugWatcher {
    rx: async_channel::Receiver<()>,
    stop: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
    _registration: Option<Registration<Context>>,
}

impl HotplugWatcher {
    pub fn new(context: &Context) -> Result<Self> {
        let (tx, rx) = async_channel::bounded(1);
        let stop = Arc::new(AtomicBool::new(false));

        let registration = if rusb::has_hotplug() {
            let callback = BusChange { tx: tx.clone() };
            Some(
                HotplugBuilder::new()
                    .enumerate(false)
                    .register(context, Box::new(callback))
                    .map_err(Error::Usb)?,
            )
        } else {
            warn!("hotplug not supported by this libusb, falling back to polling");
            None
        };

        let pump = {
            let context = context.clone();
            let stop = Arc::clone(&stop);
            let polling = registration.is_none();
            std::thread::Builder::new()
                .name("usb-events".to_string())
                .spawn(move || pump_loop(context, stop, tx, polling))?
        };

        info!("hotplug watcher started");
        Ok(Self {
            rx,
            stop,
            pump: Some(pump),
            _registration: registration,
        })
    }

    /// Wait for the next bus-topology change.
    pub async fn wait(&self) -> Result<()> {
        self.rx.recv().await.map_err(|_| Error::Shutdown)?;
        Ok(())
    }
}

impl Drop for HotplugWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

fn pump_loop(
    context: Context,
    stop: Arc<AtomicBool>,
    tx: async_channel::Sender<()>,
    polling: bool,
) {
    let tick = if polling {
        POLL_FALLBACK_TICK
    } else {
        EVENT_PUMP_TICK
    };

    while !stop.load(Ordering::Relaxed) {
        if polling {
            std::thread::sleep(tick);
            // No callbacks: wake the PnP loop unconditionally and let
            // the diff decide whether anything changed.
            let _ = tx.try_send(());
        } else if let Err(e) = context.handle_events(Some(tick)) {
            if e != rusb::Error::Interrupted {
                warn!(error = %e, "USB event handling failed");
                std::thread::sleep(tick);
            }
        }
    }
    debug!("USB event pump stopped");
}

/// Callback: any arrival or departure is the same signal to us.
struct BusChange {
    tx: async_channel::Sender<()>,
}

impl<T: UsbContext> Hotplug<T> for BusChange {
    fn device_arrived(&mut self, device: Device<T>) {
        debug!(
            bus = device.bus_number(),
            device = device.address(),
            "hotplug: device arrived"
        );
        let _ = self.tx.try_send(());
    }

    fn device_left(&mut self, device: Device<T>) {
        debug!(
            bus = device.bus_number(),
            device = device.address(),
            "hotplug: device left"
        );
        let _ = self.tx.try_send(());
    }
}
