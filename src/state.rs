//! Persistent device state
//!
//! One TOML file per device identity under the state directory. The file
//! pins the device's HTTP port and its canonical DNS-SD name across
//! restarts; writes are whole-file replaces through a temp file so a crash
//! never leaves a half-written state behind.

use std::collections::HashSet;
use std::fs;
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{Interface, NetworkConfig};
use crate::err::{Error, Result};

/// On-disk representation.
#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    #[serde(rename = "http-port")]
    http_port: u16,
    #[serde(rename = "dns-sd-name", default)]
    dns_sd_name: String,
    #[serde(default)]
    comment: String,
}

/// Persistent state of one device, keyed by its canonical identity.
#[derive(Debug)]
pub struct DevState {
    pub ident: String,
    pub http_port: u16,
    pub dns_sd_name: String,
    pub comment: String,
    path: PathBuf,
}

impl DevState {
    /// Load the device's state file, or create fresh state with a newly
    /// allocated port. A device that reappears while its state file exists
    /// is guaranteed its old port.
    pub fn load_or_create(dir: &Path, ident: &str, network: &NetworkConfig) -> Result<DevState> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{ident}.state"));

        if let Ok(text) = fs::read_to_string(&path) {
            match toml::from_str::<StateFile>(&text) {
                Ok(file) => {
                    debug!(ident, port = file.http_port, "loaded device state");
                    return Ok(DevState {
                        ident: ident.to_string(),
                        http_port: file.http_port,
                        dns_sd_name: file.dns_sd_name,
                        comment: file.comment,
                        path,
                    });
                }
                Err(e) => {
                    warn!(ident, error = %e, "corrupt state file, reallocating");
                }
            }
        }

        let http_port = allocate_port(dir, ident, network)?;
        let state = DevState {
            ident: ident.to_string(),
            http_port,
            dns_sd_name: String::new(),
            comment: String::new(),
            path,
        };
        state.save()?;
        debug!(ident, port = http_port, "created device state");
        Ok(state)
    }

    /// Write the state file atomically (temp file + rename).
    pub fn save(&self) -> Result<()> {
        let file = StateFile {
            http_port: self.http_port,
            dns_sd_name: self.dns_sd_name.clone(),
            comment: self.comment.clone(),
        };
        let text = toml::to_string_pretty(&file)
            .map_err(|e| Error::Config(format!("state serialization: {e}")))?;

        let dir = self
            .path
            .parent()
            .ok_or_else(|| Error::Config("state path has no parent".into()))?;
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        fs::write(tmp.path(), text)?;
        tmp.persist(&self.path)
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Record a possibly renamed DNS-SD name. Saves only on change.
    pub fn set_dns_sd_name(&mut self, name: &str) -> Result<()> {
        if self.dns_sd_name != name {
            self.dns_sd_name = name.to_string();
            self.save()?;
        }
        Ok(())
    }

    /// Record the user-facing device comment. Saves only on change.
    pub fn set_comment(&mut self, comment: &str) -> Result<()> {
        if self.comment != comment {
            self.comment = comment.to_string();
            self.save()?;
        }
    Ok(())
    }

    /// Bind listeners for this device's port on the configured interfaces.
    /// A successful bind is the proof that nobody else owns the port.
    pub fn listen(&self, network: &NetworkConfig) -> Result<Vec<TcpListener>> {
        let mut listeners = Vec::new();

        let v4: SocketAddr = match network.interface {
            Interface::Loopback => ([127, 0, 0, 1], self.http_port).into(),
            Interface::All => ([0, 0, 0, 0], self.http_port).into(),
        };
        listeners.push(TcpListener::bind(v4)?);

        if network.ipv6 {
            let v6: SocketAddr = match network.interface {
                Interface::Loopback => (std::net::Ipv6Addr::LOCALHOST, self.http_port).into(),
                Interface::All => (std::net::Ipv6Addr::UNSPECIFIED, self.http_port).into(),
            };
            match TcpListener::bind(v6) {
                Ok(l) => listeners.push(l),
                // Hosts without IPv6 are not an error.
                Err(e) => debug!(port = self.http_port, error = %e, "no IPv6 listener"),
            }
        }

        Ok(listeners)
    }
}

/// Lowest port in the configured range that is neither recorded in any
/// other device's state file nor currently bindable-by-someone-else.
fn allocate_port(dir: &Path, ident: &str, network: &NetworkConfig) -> Result<u16> {
    let reserved = ports_in_state_files(dir, ident);

    for port in network.http_min_port..=network.http_max_port {
        if reserved.contains(&port) {
            continue;
        }
        // A live device holds its port bound, so a probe bind filters
        // those out as well.
        let addr: SocketAddr = match network.interface {
            Interface::Loopback => ([127, 0, 0, 1], port).into(),
            Interface::All => ([0, 0, 0, 0], port).into(),
        };
        if TcpListener::bind(addr).is_ok() {
            return Ok(port);
        }
    }

    Err(Error::PortRangeExhausted)
}

/// Ports recorded in state files other than our own.
fn ports_in_state_files(dir: &Path, ident: &str) -> HashSet<u16> {
    let own = format!("{ident}.state");
    let mut ports = HashSet::new();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return ports,
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "state") {
            continue;
        }
        if path.file_name().is_some_and(|n| n == own.as_str()) {
            continue;
        }
        if let Ok(text) = fs::read_to_string(&path) {
            if let Ok(file) = toml::from_str::<StateFile>(&text) {
                ports.insert(file.http_port);
            }
        }
    }

    ports
}
