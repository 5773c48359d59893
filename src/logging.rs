//! Logging setup
//!
//! Wires the `[logging]` configuration into tracing-subscriber: one console
//! layer and, outside of debug mode, one layer appending to `main.log`.
//! Protocol traces (`trace-ipp`, `trace-escl`, `trace-http`) map to
//! per-target trace directives.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{LogLevels, LoggingConfig};
use crate::err::Result;

/// Initialize the global tracing subscriber.
///
/// With `console_only` (debug run-mode) nothing is written to the log
/// directory.
pub fn init(config: &LoggingConfig, log_dir: &Path, console_only: bool) -> Result<()> {
    let console_layer = fmt::layer()
        .with_ansi(config.console_color)
        .with_filter(console_filter(config.console_log));

    if console_only {
        tracing_subscriber::registry().with(console_layer).init();
        return Ok(());
    }

    fs::create_dir_all(log_dir)?;
    let main_log = log_dir.join("main.log");
    rotate_if_oversize(&main_log, config.max_file_size, config.max_backup_files)?;

    let file = OpenOptions::new().create(true).append(true).open(&main_log)?;
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(Arc::new(file))
        .with_filter(EnvFilter::new(directives(config.main_log)));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(())
}

/// `RUST_LOG` overrides the configured console levels when set.
fn console_filter(levels: LogLevels) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives(levels)))
}

/// Translate a level set into an EnvFilter directive string.
fn directives(levels: LogLevels) -> String {
    let base = if levels.debug {
        "debug"
    } else if levels.info {
        "info"
    } else if levels.error {
        "error"
    } else {
        "off"
    };

    let mut out = base.to_string();
    if levels.trace_ipp {
        out.push_str(",ipp_usb::ipp=trace");
    }
    if levels.trace_escl {
        out.push_str(",ipp_usb::escl=trace");
    }
    if levels.trace_http {
        out.push_str(",ipp_usb::http=trace");
    }
    out
}

/// Shift `main.log` into numbered backups once it outgrows the limit.
fn rotate_if_oversize(path: &Path, max_size: u64, max_backups: u32) -> Result<()> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(()),
    };
    if max_size == 0 || size < max_size {
        return Ok(());
    }

    if max_backups == 0 {
        fs::remove_file(path)?;
        return Ok(());
    }

    for n in (1..max_backups).rev() {
        let from = backup_name(path, n);
        if from.exists() {
            fs::rename(&from, backup_name(path, n + 1))?;
        }
    }
    fs::rename(path, backup_name(path, 1))?;
    Ok(())
}

fn backup_name(path: &Path, n: u32) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{n}"));
    name.into()
}
