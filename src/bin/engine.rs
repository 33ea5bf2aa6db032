//! CLI entry point: loads a configuration file, builds the engine, and
//! runs until a termination signal arrives.

#[macro_use]
extern crate log;
extern crate libc;

use std::env;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

use latypus::config::Config;
use latypus::engine::Engine;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }
}

fn main() {
    env_logger::init();

    let mut args = env::args().skip(1);
    let config_path = match args.next() {
        Some(path) => path,
        None => {
            eprintln!("usage: engine <config-file>");
            process::exit(2);
        }
    };

    let config = match Config::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load {}: {}", config_path, e);
            process::exit(1);
        }
    };

    let engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("failed to initialize engine: {}", e);
            process::exit(1);
        }
    };

    install_signal_handlers();

    // The watcher thread only needs the engine-scoped state (to flip
    // the running flag and wake every worker); `Engine::run` below
    // consumes the `Engine` value itself to block on `JoinHandle::join`.
    let shared = engine.shared();
    std::thread::spawn(move || loop {
        std::thread::sleep(std::time::Duration::from_millis(200));
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            info!("shutdown requested, stopping worker threads");
            shared.shutdown();
            break;
        }
    });

    if let Err(e) = engine.run() {
        eprintln!("engine exited with error: {}", e);
        process::exit(1);
    }
}
