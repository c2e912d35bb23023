// Copyright 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0
#![deny(warnings)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, Naming};
use mio::{Events, Poll, Token, Waker};
use nix::sys::signal::{self, SigAction, SigHandler, SigSet, SaFlags};

use snapshotter::{Snapshotter, SnapshotterConfig, SystemController};

lazy_static! {
    static ref SERVICE_CONTROLLER: ServiceController = ServiceController::new();
}

/// Keeps the process alive until a termination signal arrives.
struct ServiceController {
    active: AtomicBool,
    waker: Arc<Waker>,
    poller: Mutex<Poll>,
}

impl ServiceController {
    fn new() -> Self {
        let poller = Poll::new().expect("Failed to create poller for ServiceController");
        let waker = Waker::new(poller.registry(), Token(1))
            .expect("Failed to create waker for ServiceController");
        Self {
            active: AtomicBool::new(true),
            waker: Arc::new(waker),
            poller: Mutex::new(poller),
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        self.active.store(false, Ordering::Release);
        let _ = self.waker.wake();
    }

    fn run_loop(&self) {
        let mut events = Events::with_capacity(8);
        loop {
            match self.poller.lock().unwrap().poll(&mut events, None) {
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => error!("failed to receive notification from waker: {}", e),
                Ok(_) => {}
            }
            for event in events.iter() {
                if event.is_readable()
                    && event.token() == Token(1)
                    && !self.active.load(Ordering::Acquire)
                {
                    return;
                }
            }
        }
    }
}

extern "C" fn sig_exit(_sig: std::os::raw::c_int) {
    SERVICE_CONTROLLER.shutdown();
}

fn register_signal_handler(sig: signal::Signal, handler: extern "C" fn(libc::c_int)) {
    let action = SigAction::new(
        SigHandler::Handler(handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // Safe because we install a handler for a standard termination signal.
    unsafe {
        signal::sigaction(sig, &action).expect("Failed to register signal handler");
    }
}

fn prepare_commandline_options() -> Command {
    Command::new("nydus-snapshotter")
        .about("Remote snapshotter serving container images from Nydus (RAFS) layers")
        .arg(
            Arg::new("config")
                .long("config")
                .short('C')
                .help("Path to the snapshotter configuration file")
                .required(true),
        )
        .arg(
            Arg::new("root")
                .long("root")
                .help("Override the snapshotter root directory from the configuration file")
                .required(false),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .short('l')
                .help("Log level:")
                .default_value("info")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .required(false),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .short('L')
                .help("Log messages to the file instead of stderr")
                .required(false),
        )
        .arg(
            Arg::new("log-rotation-size")
                .long("log-rotation-size")
                .help("Specify log rotation size(MB), 0 to disable")
                .default_value("0")
                .required(false),
        )
}

fn setup_logging(level: &str, file: Option<PathBuf>, rotation_mb: u64) -> Result<()> {
    let logger = Logger::try_with_str(level).context("invalid log level")?;
    match file {
        Some(path) => {
            let spec = FileSpec::try_from(path).context("invalid log file path")?;
            let mut logger = logger.log_to_file(spec).append();
            if rotation_mb > 0 {
                logger = logger.rotate(
                    Criterion::Size(rotation_mb * 1024 * 1024),
                    Naming::Numbers,
                    Cleanup::KeepCompressedFiles(10),
                );
            }
            logger.start().context("start logger")?;
        }
        None => {
            logger.start().context("start logger")?;
        }
    }
    log_panics::init();
    Ok(())
}

fn load_config(args: &ArgMatches) -> Result<SnapshotterConfig> {
    // Safe to unwrap because the option is required.
    let path = args.get_one::<String>("config").unwrap();
    let mut config = SnapshotterConfig::from_file(path)
        .with_context(|| format!("load configuration {}", path))?;
    if let Some(root) = args.get_one::<String>("root") {
        config.root = PathBuf::from(root);
        config.validate().context("validate overridden root")?;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let cmd_options = prepare_commandline_options().version(clap::crate_version!());
    let args = cmd_options.get_matches();
    // Safe to unwrap because the option has a default value.
    let level = args.get_one::<String>("log-level").unwrap();
    let log_file = args.get_one::<String>("log-file").map(PathBuf::from);
    let rotation_mb = args
        .get_one::<String>("log-rotation-size")
        .unwrap()
        .parse::<u64>()
        .context("invalid log rotation size")?;
    setup_logging(level, log_file, rotation_mb)?;

    register_signal_handler(signal::SIGINT, sig_exit);
    register_signal_handler(signal::SIGTERM, sig_exit);

    let config = load_config(&args)?;
    let system_config = config.system.clone();
    let system_socket = config.system_socket();

    let snapshotter = Arc::new(Snapshotter::new(config).context("construct snapshotter")?);
    snapshotter.run();

    let system_controller = if system_config.enabled {
        let controller = SystemController::new(snapshotter.clone(), system_socket);
        controller.start().context("start system controller")?;
        Some(controller)
    } else {
        None
    };

    info!("nydus-snapshotter started");
    if SERVICE_CONTROLLER.is_active() {
        SERVICE_CONTROLLER.run_loop();
    }

    info!("nydus-snapshotter shutting down");
    if let Some(controller) = system_controller {
        controller.stop();
    }
    snapshotter.close().context("close snapshotter")?;
    Ok(())
}
