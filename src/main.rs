//! # bctor
//! A multi-container pod runtime for Linux. One supervisor process owns
//! every pod: it forks intermediate init processes that build or join
//! namespaces, shares namespace descriptors between pod members over
//! SCM_RIGHTS, wires pods into a bridged NAT network and multiplexes the
//! controlling terminal across their pseudo-terminals.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Clap;

use bctor::console::RawModeGuard;
use bctor::logger;
use bctor::network::Subnet;
use bctor::supervisor::Supervisor;

/// Supervisor options. Everything container-level lives in the specs the
/// interactive commands build.
#[derive(Clap, Debug)]
#[clap(version = "0.1.0", about = "multi-container pod runtime")]
struct Opts {
    /// Directory used as the flat container rootfs
    #[clap(long, default_value = "/dev/shm/bctor-root/")]
    rootfs: PathBuf,
    /// Name of the pod bridge
    #[clap(long, default_value = "bctor0")]
    bridge: String,
    /// Pod subnet in CIDR form
    #[clap(long, default_value = "10.0.0.0/24")]
    subnet: Subnet,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let log_rx = logger::init()?;

    let (sup, events_rx) =
        Supervisor::setup(&opts.bridge, opts.subnet, opts.rootfs).context("startup failed")?;

    // raw mode is restored by the guard on every exit path out of main
    let _raw = RawModeGuard::new().context("stdin is not a terminal")?;

    // log lines print above the prompt from their own drain thread
    let drain_mux = Arc::clone(&sup.mux);
    let drain_rx = log_rx.clone();
    thread::Builder::new()
        .name("log-drain".to_string())
        .spawn(move || {
            for line in drain_rx.iter() {
                drain_mux.println_above_prompt(&line);
                drain_mux.refresh_prompt();
            }
        })?;

    let stdin_mux = Arc::clone(&sup.mux);
    thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || stdin_mux.run_stdin_loop())?;

    log::info!("bctor ready, type 'help' for commands");
    sup.run(&events_rx);

    // flush whatever the drain thread has not picked up yet
    while let Ok(line) = log_rx.try_recv() {
        sup.mux.println_above_prompt(&line);
    }
    Ok(())
}
