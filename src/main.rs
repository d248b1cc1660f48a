use std::process::ExitCode;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::error;

use argus_node::cancel::CancelToken;
use argus_node::clock::SystemClock;
use argus_node::config::{resolve, Cli, Command, RunArgs};
use argus_node::error::ArgusError;
use argus_node::orchestrator::run_capture;
use argus_node::tuner::RtlSdrBackend;

/// Forced-exit bound after a second SIGINT/SIGTERM (§5, §6.4: 1-2s).
const FORCED_EXIT_DELAY: Duration = Duration::from_millis(1500);

fn init_logging(level: &str) {
    let verbosity = match level.to_ascii_lowercase().as_str() {
        "error" => log::Level::Error,
        "warn" => log::Level::Warn,
        "debug" => log::Level::Debug,
        "trace" => log::Level::Trace,
        _ => log::Level::Info,
    };
    stderrlog::new().verbosity(verbosity).init().ok();
}

/// Installs T-sig (§5): first SIGINT/SIGTERM cancels cooperatively, a
/// second forces exit within [`FORCED_EXIT_DELAY`] regardless of what the
/// rest of the process is doing (§8 property 13).
fn install_signal_handler(cancel: CancelToken) {
    let signal_count = Arc::new(AtomicU8::new(0));
    ctrlc::set_handler(move || {
        let n = signal_count.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 1 {
            eprintln!("received interrupt, shutting down...");
            cancel.cancel("signal");
        } else {
            eprintln!("received second interrupt, forcing exit");
            std::thread::spawn(|| {
                std::thread::sleep(FORCED_EXIT_DELAY);
                std::process::exit(130);
            });
        }
    })
    .expect("failed to install signal handler");
}

fn run(args: &RunArgs) -> Result<(), ArgusError> {
    let config = resolve(args)?;
    init_logging(&config.logging.level);

    let cancel = CancelToken::new();
    install_signal_handler(cancel.clone());

    run_capture(&config, cancel, &SystemClock)?;
    Ok(())
}

fn devices() -> Result<(), ArgusError> {
    let devices = RtlSdrBackend::list_devices()?;
    if devices.is_empty() {
        println!("no devices found");
        return Ok(());
    }
    for d in &devices {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            d.index,
            d.name,
            d.vendor,
            d.product,
            d.serial.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match &cli.command {
        Command::Run(args) => run(args),
        Command::Devices => devices(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
