// src/main.rs

//! Entry point of the standalone `lspd` process.
//!
//! The binder side of the daemon lives inside the platform runtime, which
//! embeds the library and builds a [`lspd::daemon::Core`] from its own
//! registry and activity manager. This binary has neither and never builds
//! one. It runs the part that only needs the kernel: the descriptor broker
//! serving the compiler wrapper.
//!
//! Modes of operation, chosen by the first argument:
//! - No arguments: reads the broker directory, starts one worker per
//!   supported bitness and keeps them running.
//! - `version`: prints the daemon version.
//! - `dex2oat-check <32|64>`: asks a running broker for the stock compiler
//!   and checks the descriptor against the binary on disk.

use anyhow::{Context, Result, bail};
use log::{error, info, warn};
use lspd::constants::{self, DEV_PATH_FILE, SUPERVISE_INTERVAL, VERSION_CODE, VERSION_NAME};
use lspd::dex2oat::{self, Bitness, BrokerConfig, Dex2OatService};
use rustix::fs::{Stat, fstat, stat};
use std::thread;

/// Initializes the Android logger with a specific tag.
fn init_android_logger(tag: &str) {
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(constants::MAX_LOG_LEVEL)
            .with_tag(tag),
    );
}

/// Parses command-line arguments and dispatches to the correct logic.
fn start() {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("version") => {
            println!("LSPosed daemon {} ({})", VERSION_NAME, VERSION_CODE);
        }
        Some("dex2oat-check") => match args.get(2).map(|b| b.parse::<u8>()) {
            Some(Ok(bits)) => {
                if let Err(e) = check_broker(bits) {
                    error!("Broker check failed: {:?}", e);
                    eprintln!("{e:#}");
                    std::process::exit(1);
                }
            }
            Some(Err(_)) => error!("Check: invalid bitness argument."),
            None => error!("Check: missing bitness argument."),
        },
        _ => {
            if let Err(e) = broker_entry() {
                error!("Broker failed: {:?}", e);
            }
        }
    }
}

/// Starts the broker and restarts workers that die.
fn broker_entry() -> Result<()> {
    let config = BrokerConfig::from_dev_path_file(DEV_PATH_FILE)?;
    let service = Dex2OatService::new(config);
    service.start()?;
    info!("Broker running, supervising every {:?}", SUPERVISE_INTERVAL);
    loop {
        thread::sleep(SUPERVISE_INTERVAL);
        if service.is_alive() {
            continue;
        }
        match service.restart_dead() {
            Ok(restarted) => warn!("Restarted {} broker worker(s)", restarted),
            Err(e) => error!("Failed to restart broker workers: {:?}", e),
        }
    }
}

fn same_file(a: &Stat, b: &Stat) -> bool {
    a.st_dev == b.st_dev && a.st_ino == b.st_ino
}

fn check_broker(bits: u8) -> Result<()> {
    let bitness = Bitness::try_from(bits)?;
    let config = BrokerConfig::from_dev_path_file(DEV_PATH_FILE)?;
    let fd = dex2oat::request_compiler_fd(&config, bitness)?;
    let received = fstat(&fd).context("fstat on received descriptor")?;
    let expected_path = config.stock_binary(bitness);
    let expected = stat(&expected_path)
        .with_context(|| format!("stat {}", expected_path.display()))?;
    println!(
        "dex2oat{}: received dev={} ino={}, {} dev={} ino={}",
        bitness.suffix(),
        received.st_dev,
        received.st_ino,
        expected_path.display(),
        expected.st_dev,
        expected.st_ino
    );
    if !same_file(&received, &expected) {
        bail!("descriptor does not refer to {}", expected_path.display());
    }
    Ok(())
}

fn main() {
    // Use the binary name as the log tag.
    let arg0 = std::env::args().next().unwrap_or_default();
    let process_name = arg0.split('/').next_back().unwrap_or("lspd");
    init_android_logger(process_name);

    start();
}
