//! Device object
//!
//! Brings all parts together, one instance per physical device: the USB
//! transport, the HTTP proxy in front of it, the persistent state handle
//! and the DNS-SD publisher. Bring-up follows a fixed order and unwinds
//! whatever was already built when a later step fails.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::config::{Config, Interface};
use crate::dnssd::{DnsSdPublisher, MdnsBackend};
use crate::err::{Error, Result};
use crate::escl;
use crate::http::proxy::{HttpProxy, SessionCounter};
use crate::ipp;
use crate::paths::Paths;
use crate::quirks::QuirksDb;
use crate::state::DevState;
use crate::usb::addr::UsbAddr;
use crate::usb::discover;
use crate::usb::transport::UsbTransport;

/// Everything bring-up needs from the daemon, bundled so the PnP loop
/// can hand it around.
pub struct DaemonEnv {
    pub config: Config,
    pub paths: Paths,
    pub quirks: QuirksDb,
    pub sessions: SessionCounter,
    pub usb: rusb::Context,
}

pub struct Device {
    pub addr: UsbAddr,
    state: DevState,
    transport: Arc<UsbTransport>,
    proxy: HttpProxy,
    publisher: Option<DnsSdPublisher<MdnsBackend>>,
}

impl Device {
    /// Bring a freshly arrived device into service: transport, state,
    /// listener, probes, DNS-SD.
    pub async fn bring_up(env: &DaemonEnv, addr: UsbAddr) -> Result<Device> {
        // Identity first: a blacklisted device must not even be claimed.
        let info = {
            let usb = env.usb.clone();
            tokio::task::spawn_blocking(move || discover::read_device_info(&usb, addr))
                .await
                .map_err(|e| Error::UsbOpen(e.to_string()))??
        };

        let model = info.mfg_and_product();
        let quirks = env.quirks.lookup(&model);
        if quirks.is_blacklisted() {
            return Err(Error::Blacklisted);
        }

        let opened = {
            let usb = env.usb.clone();
            tokio::task::spawn_blocking(move || discover::open(&usb, addr))
                .await
                .map_err(|e| Error::UsbOpen(e.to_string()))??
        };

        let transport = Arc::new(UsbTransport::new(opened, quirks));

        let mut state = match Self::setup_state(env, &transport) {
            Ok(state) => state,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };

        let listeners = match state.listen(&env.config.network) {
            Ok(listeners) => listeners,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };

        let mut proxy =
            match HttpProxy::spawn(Arc::clone(&transport), listeners, env.sessions.clone()) {
                Ok(proxy) => proxy,
                Err(e) => {
                    transport.close().await;
                    return Err(e);
                }
            };

        match Self::probe_and_publish(env, &transport, &mut state).await {
            Ok(publisher) => {
                info!(
                    %addr,
                    port = state.http_port,
                    name = %state.dns_sd_name,
                    "device in service"
                );
                Ok(Device {
                    addr,
                    state,
                    transport,
                    proxy,
                    publisher,
                })
            }
            Err(e) => {
                proxy.close().await;
                transport.close().await;
                Err(e)
            }
        }
    }

    fn setup_state(env: &DaemonEnv, transport: &UsbTransport) -> Result<DevState> {
        let info = transport.usb_info();
        let mut state =
            DevState::load_or_create(&env.paths.dev_state_dir, &info.ident(), &env.config.network)?;
        state.set_comment(&info.comment())?;
        Ok(state)
    }

    /// Probe IPP (required) and eSCL (optional), then publish the service
    /// set under the persisted name, falling back to the probed one.
    async fn probe_and_publish(
        env: &DaemonEnv,
        transport: &Arc<UsbTransport>,
        state: &mut DevState,
    ) -> Result<Option<DnsSdPublisher<MdnsBackend>>> {
        let info = transport.usb_info().clone();
        let port = state.http_port;

        let (ippinfo, mut services) = ipp::ipp_service(transport.as_ref(), port, &info).await?;

        match escl::escl_service(transport.as_ref(), port, &info).await {
            Ok(svc) => services.push(svc),
            Err(e) => error!(error = %e, "eSCL probe failed, not advertising a scanner"),
        }

        for svc in &services {
            debug!(svc_type = %svc.svc_type, port = svc.port, "service ready");
            for (key, value) in svc.txt.iter() {
                debug!("  {key}={value}");
            }
        }

        if !env.config.network.dns_sd {
            debug!("DNS-SD disabled by configuration");
            return Ok(None);
        }

        let loopback = env.config.network.interface == Interface::Loopback;
        let mut publisher = DnsSdPublisher::new(MdnsBackend::new(loopback)?);

        let preferred = if state.dns_sd_name.is_empty() {
            ippinfo.dns_sd_name.clone()
        } else {
            state.dns_sd_name.clone()
        };
        let chosen = publisher.publish(&preferred, &services)?;
        state.set_dns_sd_name(&chosen)?;

        Ok(Some(publisher))
    }

    pub fn port(&self) -> u16 {
        self.state.http_port
    }

    /// Tear everything down in reverse bring-up order.
    pub async fn close(mut self) {
        if let Some(publisher) = self.publisher.as_mut() {
            if let Err(e) = publisher.unpublish() {
                error!(addr = %self.addr, error = %e, "unpublish failed");
            }
        }
        self.proxy.close().await;
        self.transport.close().await;
        info!(addr = %self.addr, "device closed");
    }
}
