//! DNS-SD service model and publisher
//!
//! The probes build `DnsSdSvcInfo` values; the publisher claims an
//! instance name for the whole service set, renaming with an ` (N)`
//! suffix when the name is taken, and reports the name it settled on so
//! the device state can persist it. The actual mDNS announcing sits
//! behind a small backend trait with an mdns-sd implementation, which
//! also lets tests drive the rename loop with a scripted backend.

use std::sync::Mutex;

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::{debug, info, warn};

use crate::err::{Error, Result};

/// TXT record: ordered key/value list with unique keys. The first value
/// added for a key wins, matching the duplicate policy of the decoders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxtRecord {
    items: Vec<(String, String)>,
}

impl TxtRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: &str, value: &str) {
        if !self.contains(key) {
            self.items.push((key.to_string(), value.to_string()));
        }
    }

    /// Add only when the value is non-empty. Returns whether it was added.
    pub fn if_not_empty(&mut self, key: &str, value: &str) -> bool {
        if value.is_empty() || self.contains(key) {
            return false;
        }
        self.items.push((key.to_string(), value.to_string()));
        true
    }

    /// Add only when the value looks like an HTTP(S) URL.
    pub fn url_if_not_empty(&mut self, key: &str, value: &str) {
        if value.starts_with("http://") || value.starts_with("https://") {
            self.add(key, value);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.iter().any(|(k, _)| k == key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// One advertisable service of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsSdSvcInfo {
    /// Service type, e.g. `_ipp._tcp`.
    pub svc_type: String,
    /// Sub-types, e.g. `_universal._sub._ipp._tcp`.
    pub sub_types: Vec<String>,
    pub port: u16,
    pub txt: TxtRecord,
}

impl DnsSdSvcInfo {
    pub fn new(svc_type: &str, port: u16) -> Self {
        Self {
            svc_type: svc_type.to_string(),
            sub_types: Vec::new(),
            port,
            txt: TxtRecord::new(),
        }
    }
}

/// Outcome of one publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// The instance name is already taken on this host.
    NameCollision,
}

/// The service-browser collaborator: announces a service set under an
/// instance name, or reports that the name is taken.
pub trait DnsSdBackend: Send + Sync {
    fn publish(&self, instance_name: &str, services: &[DnsSdSvcInfo]) -> Result<PublishOutcome>;
    fn unpublish(&self) -> Result<()>;
}

/// Publisher adapter: owns the rename-until-unique loop.
pub struct DnsSdPublisher<B: DnsSdBackend> {
    backend: B,
    published_name: Option<String>,
}

impl<B: DnsSdBackend> DnsSdPublisher<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            published_name: None,
        }
    }

    /// Publish the whole service set, renaming on collision. Returns the
    /// name that finally stuck.
    pub fn publish(&mut self, preferred_name: &str, services: &[DnsSdSvcInfo]) -> Result<String> {
        let (base, mut counter) = split_rename_suffix(preferred_name);
        let mut name = preferred_name.to_string();

        loop {
            match self.backend.publish(&name, services)? {
                PublishOutcome::Published => {
                    if name != preferred_name {
                        info!(from = preferred_name, to = %name, "DNS-SD name collision resolved");
                    }
                    for svc in services {
                        debug!(name = %name, svc_type = %svc.svc_type, port = svc.port, "service published");
                    }
                    self.published_name = Some(name.clone());
                    return Ok(name);
                }
                PublishOutcome::NameCollision => {
                    counter += 1;
                    name = format!("{base} ({counter})");
                    debug!(retry = %name, "DNS-SD name collision, renaming");
                }
            }
        }
    }

    pub fn unpublish(&mut self) -> Result<()> {
        if self.published_name.take().is_some() {
            self.backend.unpublish()?;
        }
        Ok(())
    }
}

/// Split a trailing ` (N)` rename suffix so that repeated collisions
/// keep counting instead of stacking suffixes.
fn split_rename_suffix(name: &str) -> (&str, u32) {
    if let Some(open) = name.rfind(" (") {
        if let Some(inner) = name[open + 2..].strip_suffix(')') {
            if let Ok(n) = inner.parse::<u32>() {
                return (&name[..open], n);
            }
        }
    }
    (name, 1)
}

// ---------------------------------------------------------------------------
// mdns-sd backend
// ---------------------------------------------------------------------------

pub struct MdnsBackend {
    daemon: ServiceDaemon,
    hostname: String,
    /// Loopback-only operation advertises 127.0.0.1; otherwise addresses
    /// are auto-detected.
    loopback: bool,
    registered: Mutex<Vec<String>>,
}

impl MdnsBackend {
    pub fn new(loopback: bool) -> Result<Self> {
        let daemon =
            ServiceDaemon::new().map_err(|e| Error::DnsSd(format!("mDNS daemon: {e}")))?;
        let hostname = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "ipp-usb".to_string());
        Ok(Self {
            daemon,
            hostname,
            loopback,
            registered: Mutex::new(Vec::new()),
        })
    }
}

impl DnsSdBackend for MdnsBackend {
    fn publish(&self, instance_name: &str, services: &[DnsSdSvcInfo]) -> Result<PublishOutcome> {
        let mut registered = self.registered.lock().unwrap();

        for svc in services {
            // mdns-sd takes sub-types as a comma-separated tail on the
            // service type.
            let mut ty_domain = format!("{}.local.", svc.svc_type);
            for sub in &svc.sub_types {
                ty_domain.push_str(&format!(",{sub}.local."));
            }

            let properties: Vec<(&str, &str)> = svc.txt.iter().collect();
            let host = format!("{}.local.", self.hostname);
            let ip = if self.loopback { "127.0.0.1" } else { "" };

            let info = ServiceInfo::new(
                &ty_domain,
                instance_name,
                &host,
                ip,
                svc.port,
                &properties[..],
            )
            .map_err(|e| Error::DnsSd(format!("{}: {e}", svc.svc_type)))?;
            let info = if self.loopback {
                info
            } else {
                info.enable_addr_auto()
            };

            let fullname = info.get_fullname().to_string();
            self.daemon
                .register(info)
                .map_err(|e| Error::DnsSd(format!("register {}: {e}", svc.svc_type)))?;
            registered.push(fullname);
        }

        Ok(PublishOutcome::Published)
    }

    fn unpublish(&self) -> Result<()> {
        let mut registered = self.registered.lock().unwrap();
        for fullname in registered.drain(..) {
            if let Err(e) = self.daemon.unregister(&fullname) {
                warn!(service = %fullname, error = %e, "unregister failed");
            }
        }
        Ok(())
    }
}
