//! ipp-usb daemon entry point
//!
//! `ipp-usb <mode> [-bg]` with modes `standalone`, `udev`, `debug` and
//! `check`. Requires root (raw USB access and privileged mDNS).

use std::os::fd::AsRawFd;
use std::process::ExitCode;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};

use ipp_usb::config::Config;
use ipp_usb::device::DaemonEnv;
use ipp_usb::err::Error;
use ipp_usb::paths::Paths;
use ipp_usb::pnp::{self, PnpMode};
use ipp_usb::quirks::QuirksDb;
use ipp_usb::usb::discover;
use ipp_usb::{lock, logging};

#[derive(Parser, Debug)]
#[command(name = "ipp-usb", version)]
#[command(about = "Daemon for IPP over USB printer support")]
struct Args {
    /// Run mode
    #[arg(value_enum)]
    mode: Mode,

    /// Detach from the terminal and run in the background
    /// (ignored in debug mode)
    #[arg(long = "bg")]
    bg: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Run as a standalone daemon
    Standalone,
    /// Started by udev for a specific device; exit when it is gone
    Udev,
    /// Run in the foreground with console logging only
    Debug,
    /// Check configuration, quirks and attached devices, then exit
    Check,
}

fn main() -> ExitCode {
    // The classic single-dash spelling of the background flag.
    let argv = std::env::args().map(|a| {
        if a == "-bg" {
            "--bg".to_string()
        } else {
            a
        }
    });
    let args = Args::parse_from(argv);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ipp-usb: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        return Err(Error::Permission.into());
    }

    let paths = Paths::default();
    let config = Config::load(&paths.conf_file).context("cannot load configuration")?;

    let console_only = matches!(args.mode, Mode::Debug | Mode::Check);
    if args.bg && !console_only {
        daemonize().context("cannot detach")?;
    }
    logging::init(&config.logging, &paths.log_dir, console_only)
        .context("cannot set up logging")?;

    if args.mode == Mode::Check {
        return check(&config, &paths);
    }

    // One instance at a time.
    let _lock = lock::acquire(&paths.lock_file)?;

    let quirks = QuirksDb::load(&paths.quirks_dir).context("cannot load quirks")?;
    let usb = rusb::Context::new().context("cannot initialize libusb")?;
    let env = DaemonEnv {
        config,
        paths,
        quirks,
        sessions: Arc::new(AtomicU64::new(0)),
        usb,
    };

    let mode = match args.mode {
        Mode::Udev => PnpMode::Udev,
        _ => PnpMode::Standalone,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("cannot start async runtime")?;
    runtime.block_on(pnp::run(env, mode))?;
    Ok(())
}

/// `check` mode: validate configuration and quirks, list attached
/// IPP-over-USB devices.
fn check(config: &Config, paths: &Paths) -> anyhow::Result<()> {
    let quirks = QuirksDb::load(&paths.quirks_dir).context("quirks")?;
    println!(
        "configuration OK: HTTP ports {}-{}, dns-sd {}",
        config.network.http_min_port,
        config.network.http_max_port,
        if config.network.dns_sd {
            "enabled"
        } else {
            "disabled"
        },
    );

    let usb = rusb::Context::new().context("cannot initialize libusb")?;
    let list = discover::enumerate(&usb)?;
    if list.is_empty() {
        println!("no IPP-over-USB devices found");
        return Ok(());
    }

    for addr in list.iter() {
        match discover::read_device_info(&usb, addr) {
            Ok(info) => {
                let model = info.mfg_and_product();
                let note = if quirks.lookup(&model).is_blacklisted() {
                    " (blacklisted)"
                } else {
                    ""
                };
                println!(
                    "{addr}: {:04x}:{:04x} {model}{note}",
                    info.vendor, info.product
                );
            }
            Err(e) => println!("{addr}: {e}"),
        }
    }
    Ok(())
}

/// Double-detach: fork, new session, stdio onto /dev/null.
fn daemonize() -> anyhow::Result<()> {
    use nix::unistd::{dup2, fork, setsid, ForkResult};

    match unsafe { fork() }.context("fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().context("setsid")?;

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("/dev/null")?;
    for target in 0..=2 {
        dup2(devnull.as_raw_fd(), target).context("dup2")?;
    }
    Ok(())
}
