// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Meta service daemon. Loads and validates the TOML config, takes the
// advisory process lock, serves until SIGINT/SIGTERM, exits 0 on a
// graceful stop and non-zero on any startup failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use log::info;

use mmcache::config::{log_level_of, MetaServiceConfig};
use mmcache::service::MetaService;

const LOCK_FILE: &str = "/tmp/mmc_meta_service.lock";

#[derive(Parser)]
#[command(name = "mmc_meta_service", about = "memory fabric cache meta service")]
struct Args {
    /// Path to the service configuration file.
    #[arg(long)]
    config: PathBuf,
}

static EXIT_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(signal: libc::c_int) {
    let _ = signal;
    EXIT_REQUESTED.store(true, Ordering::SeqCst);
}

/// Advisory lock so two meta services never share a host. The fd leaks
/// on purpose: the lock must outlive this scope.
fn acquire_process_lock() -> Result<(), String> {
    unsafe {
        let path = std::ffi::CString::new(LOCK_FILE).unwrap();
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CREAT, 0o600);
        if fd < 0 {
            return Err(format!("cannot open {LOCK_FILE}"));
        }
        let mut lock: libc::flock = std::mem::zeroed();
        lock.l_type = libc::F_WRLCK as libc::c_short;
        lock.l_whence = libc::SEEK_SET as libc::c_short;
        if libc::fcntl(fd, libc::F_SETLK, &lock) < 0 {
            libc::close(fd);
            return Err("meta service is already running on this host".into());
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let cfg = match MetaServiceConfig::load_from_file(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let errors = cfg.validate();
    if !errors.is_empty() {
        eprintln!("wrong configuration in {}:", args.config.display());
        for item in &errors {
            eprintln!("  {item}");
        }
        return ExitCode::FAILURE;
    }

    env_logger::Builder::new()
        .filter_level(log_level_of(&cfg.log_level).unwrap_or(log::LevelFilter::Info))
        .init();

    if let Err(e) = acquire_process_lock() {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    unsafe {
        let handler = on_signal as extern "C" fn(libc::c_int);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }

    let service = match MetaService::start("meta_service", &cfg) {
        Ok(service) => service,
        Err(e) => {
            eprintln!("error: failed to start meta service: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("meta service launched");

    while !EXIT_REQUESTED.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }
    info!("exit signal received");
    service.stop();
    ExitCode::SUCCESS
}
