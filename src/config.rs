//! Daemon configuration
//!
//! Loads `ipp-usb.conf`, searched at `/etc/ipp-usb/ipp-usb.conf` and then
//! next to the executable. A missing file means defaults; a malformed file
//! aborts startup.

use std::env;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::err::{Error, Result};
use crate::inifile::{self, IniSection};

/// Which interfaces the per-device HTTP listeners bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interface {
    Loopback,
    All,
}

/// A set of log levels, as listed in `device-log`/`main-log`/`console-log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLevels {
    pub error: bool,
    pub info: bool,
    pub debug: bool,
    pub trace_ipp: bool,
    pub trace_escl: bool,
    pub trace_http: bool,
}

impl LogLevels {
    pub const NONE: LogLevels = LogLevels {
        error: false,
        info: false,
        debug: false,
        trace_ipp: false,
        trace_escl: false,
        trace_http: false,
    };

    /// `all`: every ordinary level, no protocol traces.
    pub const ALL: LogLevels = LogLevels {
        error: true,
        info: true,
        debug: true,
        trace_ipp: false,
        trace_escl: false,
        trace_http: false,
    };

    /// `trace-all`: everything.
    pub const TRACE_ALL: LogLevels = LogLevels {
        error: true,
        info: true,
        debug: true,
        trace_ipp: true,
        trace_escl: true,
        trace_http: true,
    };

    /// Parse a comma-separated level list.
    pub fn parse(s: &str) -> Result<LogLevels> {
        let mut levels = LogLevels::NONE;
        for item in s.split(',') {
            let item = item.trim();
            match item {
                "" => continue,
                "error" => levels.error = true,
                "info" => levels.info = true,
                "debug" => levels.debug = true,
                "trace-ipp" => levels.trace_ipp = true,
                "trace-escl" => levels.trace_escl = true,
                "trace-http" => levels.trace_http = true,
                "all" => levels = levels.union(LogLevels::ALL),
                "trace-all" => levels = levels.union(LogLevels::TRACE_ALL),
                _ => {
                    return Err(Error::Config(format!("unknown log level `{item}`")));
                }
            }
        }
        Ok(levels)
    }

    fn union(self, other: LogLevels) -> LogLevels {
        LogLevels {
            error: self.error || other.error,
            info: self.info || other.info,
            debug: self.debug || other.debug,
            trace_ipp: self.trace_ipp || other.trace_ipp,
            trace_escl: self.trace_escl || other.trace_escl,
            trace_http: self.trace_http || other.trace_http,
        }
    }
}

/// `[network]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub http_min_port: u16,
    pub http_max_port: u16,
    pub dns_sd: bool,
    pub interface: Interface,
    pub ipv6: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            http_min_port: 60000,
            http_max_port: 65535,
            dns_sd: true,
            interface: Interface::Loopback,
            ipv6: true,
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub device_log: LogLevels,
    pub main_log: LogLevels,
    pub console_log: LogLevels,
    /// Bytes; `max-file-size` with `K`/`M` suffix.
    pub max_file_size: u64,
    pub max_backup_files: u32,
    pub console_color: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            device_log: LogLevels::ALL,
            main_log: LogLevels::ALL,
            console_log: LogLevels::ALL,
            max_file_size: 256 * 1024,
            max_backup_files: 5,
            console_color: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the standard locations.
    pub fn load(conf_file: &Path) -> Result<Config> {
        for candidate in Self::candidates(conf_file) {
            if candidate.exists() {
                debug!(path = %candidate.display(), "loading configuration");
                let sections = inifile::parse_file(&candidate)?;
                return Self::from_sections(&sections);
            }
        }
        debug!("no configuration file found, using defaults");
        Ok(Config::default())
    }

    fn candidates(conf_file: &Path) -> Vec<PathBuf> {
        let mut list = vec![conf_file.to_path_buf()];
        if let Ok(exe) = env::current_exe() {
            if let Some(dir) = exe.parent() {
                list.push(dir.join("ipp-usb.conf"));
            }
        }
        list
    }

    /// Parse configuration text. Exposed for tests.
    pub fn from_text(text: &str) -> Result<Config> {
        let sections = inifile::parse(text, "ipp-usb.conf")?;
        Self::from_sections(&sections)
    }

    fn from_sections(sections: &[IniSection]) -> Result<Config> {
        let mut config = Config::default();

        for section in sections {
            match section.name.as_str() {
                "network" => {
                    for item in &section.items {
                        match item.key.as_str() {
                            "http-min-port" => {
                                config.network.http_min_port = parse_port(&item.value)?;
                            }
                            "http-max-port" => {
                                config.network.http_max_port = parse_port(&item.value)?;
                            }
                            "dns-sd" => config.network.dns_sd = parse_enable(&item.value)?,
                            "interface" => {
                                config.network.interface = match item.value.as_str() {
                                    "loopback" => Interface::Loopback,
                                    "all" => Interface::All,
                                    other => {
                                        return Err(Error::Config(format!(
                                            "interface must be `loopback` or `all`, not `{other}`"
                                        )))
                                    }
                                };
                            }
                            "ipv6" => config.network.ipv6 = parse_enable(&item.value)?,
                            other => debug!(key = other, "ignoring unknown [network] key"),
                        }
                    }
                }
                "logging" => {
                    for item in &section.items {
                        match item.key.as_str() {
                            "device-log" => {
                                config.logging.device_log = LogLevels::parse(&item.value)?;
                            }
                            "main-log" => {
                                config.logging.main_log = LogLevels::parse(&item.value)?;
                            }
                            "console-log" => {
                                config.logging.console_log = LogLevels::parse(&item.value)?;
                            }
                            "max-file-size" => {
                                config.logging.max_file_size = parse_size(&item.value)?;
                            }
                            "max-backup-files" => {
                                config.logging.max_backup_files =
                                    item.value.parse().map_err(|_| {
                                        Error::Config(format!(
                                            "bad max-backup-files `{}`",
                                            item.value
                                        ))
                                    })?;
                            }
                            "console-color" => {
                                config.logging.console_color = parse_enable(&item.value)?;
                            }
                            other => debug!(key = other, "ignoring unknown [logging] key"),
                        }
                    }
                }
                other => debug!(section = other, "ignoring unknown configuration section"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.network.http_min_port > self.network.http_max_port {
            return Err(Error::Config(format!(
                "http-min-port ({}) exceeds http-max-port ({})",
                self.network.http_min_port, self.network.http_max_port
            )));
        }
        Ok(())
    }
}

fn parse_port(s: &str) -> Result<u16> {
    let port: u32 = s
        .parse()
        .map_err(|_| Error::Config(format!("bad port `{s}`")))?;
    if port == 0 || port > 65535 {
        return Err(Error::Config(format!("port {port} out of range")));
    }
    Ok(port as u16)
}

fn parse_enable(s: &str) -> Result<bool> {
    match s {
        "enable" => Ok(true),
        "disable" => Ok(false),
        other => Err(Error::Config(format!(
            "expected `enable` or `disable`, got `{other}`"
        ))),
    }
}

/// Parse a size with an optional `K` or `M` suffix.
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (digits, mult) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1024),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s, 1),
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("bad size `{s}`")))?;
    Ok(n * mult)
}
