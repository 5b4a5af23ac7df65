// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::net::TcpListener;
use std::os::fd::AsFd;
use std::os::fd::IntoRawFd;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::thread;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use log::error;
use log::info;
use nix::sys::signal::sigaction;
use nix::sys::signal::SaFlags;
use nix::sys::signal::SigAction;
use nix::sys::signal::SigHandler;
use nix::sys::signal::SigSet;
use nix::sys::signal::Signal;

use camera_daemon::broker::serve;
use camera_daemon::Broker;
use camera_daemon::Config;

// Set once SIGTERM or SIGINT arrives.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static SHUTDOWN_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_signal(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
    let fd = SHUTDOWN_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = [0u8; 1];
        // Safe because write(2) is async-signal-safe and the pipe fd lives
        // for the rest of the process.
        unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
    }
}

/// The only command-line argument is a `port=<n>` override for the control
/// port, matching the scenario file's `camera_manager.port` key.
fn parse_port_arg(args: &[String]) -> Result<Option<u16>> {
    let Some(arg) = args.get(1) else {
        return Ok(None);
    };
    let value = arg
        .strip_prefix("port=")
        .ok_or_else(|| anyhow!("unrecognized argument {:?}, expected port=<n>", arg))?;
    let port = value
        .parse::<u16>()
        .with_context(|| format!("bad port number {:?}", value))?;
    Ok(Some(port))
}

fn run() -> Result<()> {
    stderrlog::new()
        .verbosity(2)
        .timestamp(stderrlog::Timestamp::Millisecond)
        .init()
        .context("Failed to initialize logging")?;

    let args: Vec<String> = std::env::args().collect();
    let port_override = parse_port_arg(&args)?;

    let config = Config::load(Path::new(camera_daemon::config::DEFAULT_CONFIG_PATH))
        .context("Failed to load scenario configuration")?;
    let address = config.address.clone();
    let port = port_override.unwrap_or(config.port);

    // A vanished client must not kill the daemon on write.
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // Safe because ignoring SIGPIPE does not affect any other state.
    unsafe { sigaction(Signal::SIGPIPE, &ignore) }.context("Failed to ignore SIGPIPE")?;

    let (pipe_read, pipe_write) = nix::unistd::pipe().context("Failed to create shutdown pipe")?;
    SHUTDOWN_FD.store(pipe_write.into_raw_fd(), Ordering::Relaxed);
    let terminate = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // Safe because the handler only touches atomics and write(2).
    unsafe { sigaction(Signal::SIGTERM, &terminate) }.context("Failed to install SIGTERM")?;
    unsafe { sigaction(Signal::SIGINT, &terminate) }.context("Failed to install SIGINT")?;

    let listener = TcpListener::bind((address.as_str(), port))
        .with_context(|| format!("Failed to bind {}:{}", address, port))?;
    info!("Listening on {}:{}", address, port);

    let broker = Broker::new(config);
    let handle = broker.handle();
    let supervisor = thread::Builder::new()
        .name("supervisor".to_string())
        .spawn(move || broker.run())
        .context("Failed to start supervisor")?;

    serve(&listener, &handle, pipe_read.as_fd());
    if SHUTDOWN.load(Ordering::Relaxed) {
        info!("Termination signal received");
    }

    handle.shutdown();
    match supervisor.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Supervisor failed: {:#}", e),
        Err(_) => error!("Supervisor panicked"),
    }
    Ok(())
}

fn main() {
    // Print errors through Display instead of returning a Result from main.
    if let Err(e) = run() {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
