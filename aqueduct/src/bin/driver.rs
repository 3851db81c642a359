//! The media driver daemon.
//!
//! Launches with no arguments; configuration comes from environment
//! properties (`aeron.dir`, buffer sizes, the event log selector — see
//! the config module for the full list). Exits 0 on clean shutdown and
//! non-zero on fatal initialization: directory creation, file mapping,
//! or socket setup.
//!
//! # Signals
//!
//! `SIGTERM` / `SIGINT`: graceful shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use aqueduct::config::DriverConfig;
use aqueduct::driver::MediaDriver;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

fn main() {
    aqueduct::init_tracing();

    if let Err(e) = run() {
        eprintln!("aqueduct-driver: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = DriverConfig::from_env()?;

    eprintln!(
        "aqueduct-driver: starting in {} (term {} bytes, mtu {})",
        config.dir.display(),
        config.term_length,
        config.mtu_length,
    );

    let driver = MediaDriver::launch(config)?;
    eprintln!("aqueduct-driver: ready");

    install_signal_handlers();
    while !SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    eprintln!("aqueduct-driver: shutting down...");
    driver.shutdown();
    eprintln!("aqueduct-driver: stopped");
    Ok(())
}

#[cfg(unix)]
fn install_signal_handlers() {
    // SAFETY: the handler only performs an atomic store, which is
    // async-signal-safe.
    unsafe {
        libc_signal(SIGINT, handle_signal as usize);
        libc_signal(SIGTERM, handle_signal as usize);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

#[cfg(unix)]
extern "C" fn handle_signal(_signum: i32) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

#[cfg(unix)]
const SIGINT: i32 = 2;
#[cfg(unix)]
const SIGTERM: i32 = 15;

#[cfg(unix)]
unsafe fn libc_signal(signum: i32, handler: usize) {
    unsafe extern "C" {
        fn signal(signum: i32, handler: usize) -> usize;
    }
    unsafe {
        signal(signum, handler);
    }
}
