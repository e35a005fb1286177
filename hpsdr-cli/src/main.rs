//! Process driver for the OpenHPSDR radio emulator: argument parsing, logging
//! initialization, radio construction, and graceful shutdown on SIGINT/SIGTERM.

mod logging;

use std::cell::RefCell;
use std::rc::Rc;

use clap::Parser;
use color_eyre::eyre::{bail, Result, WrapErr};

use hpsdr_core::{EchoBuffer, HardwareProfile, RadioState, SignalGenerator};

/// Emulate an OpenHPSDR radio peripheral over UDP, speaking either the legacy
/// single-port protocol (1) or the modern multi-port protocol (2).
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Protocol dialect to speak: 1 (legacy, single UDP port) or 2 (modern, multi-port)
    #[arg(long)]
    protocol: u8,

    /// Emulated hardware profile
    #[arg(long, default_value = "hermeslite")]
    radio: String,

    /// MAC address to present at discovery (random locally-administered address if omitted)
    #[arg(long)]
    mac: Option<String>,

    /// Test-tone offset in Hz for the synthetic signal generator
    #[arg(long, default_value_t = 1000.0)]
    freq: f64,

    /// Standard-deviation of the additive white noise mixed into the test signal
    #[arg(long, default_value_t = 3e-6)]
    noise: f64,

    /// Enable the TX-echo loopback subsystem (records TX I/Q, replays it as RX)
    #[arg(long)]
    echo: bool,

    /// Raise log verbosity to debug
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if cli.protocol != 1 && cli.protocol != 2 {
        bail!("--protocol must be 1 or 2, got {}", cli.protocol);
    }

    let hw = HardwareProfile::by_name(&cli.radio.to_lowercase())
        .wrap_err_with(|| format!("unknown --radio {:?}", cli.radio))?;
    let mac = match &cli.mac {
        Some(text) => RadioState::parse_mac(text).wrap_err_with(|| format!("invalid --mac {text:?}"))?,
        None => RadioState::random_mac(),
    };
    let sample_rate: u32 = if cli.protocol == 1 { 48_000 } else { 192_000 };
    let nddc = hw.max_ddcs;

    log::info!(
        "hpsdr-emu starting: protocol={} radio={} nddc={} sample_rate={}Hz echo={}",
        cli.protocol,
        hw.name,
        nddc,
        sample_rate,
        cli.echo
    );

    let state = Rc::new(RefCell::new(RadioState::new(hw, mac, sample_rate, nddc)));
    let siggen = Rc::new(RefCell::new(SignalGenerator::new(
        sample_rate,
        cli.freq,
        cli.noise,
    )));
    let echo = if cli.echo {
        Some(Rc::new(RefCell::new(EchoBuffer::new(sample_rate))))
    } else {
        None
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .wrap_err("failed to build the Tokio runtime")?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move { run(cli.protocol, state, siggen, echo).await })
}

/// Bind the requested protocol engine and drive it until SIGINT/SIGTERM.
async fn run(
    protocol: u8,
    state: Rc<RefCell<RadioState>>,
    siggen: Rc<RefCell<SignalGenerator>>,
    echo: Option<Rc<RefCell<EchoBuffer>>>,
) -> Result<()> {
    match protocol {
        1 => {
            let engine = hpsdr_core::protocol1::Protocol1::bind(state, siggen, echo)
                .await
                .wrap_err("failed to bind Protocol 1 UDP port")?;
            run_until_shutdown(engine.run()).await
        }
        2 => {
            let engine = hpsdr_core::protocol2::Protocol2::bind(state, siggen, echo)
                .await
                .wrap_err("failed to bind Protocol 2 UDP ports")?;
            run_until_shutdown(engine.run()).await
        }
        _ => unreachable!("validated in main"),
    }
}

/// Race a protocol engine's `run()` future against the shutdown signal.
/// On SIGINT/SIGTERM the engine future is dropped, cancelling every in-flight
/// sleep and closing every socket it owns; dropping a sleeping task is not an
/// error, so a ctrl-c race always exits cleanly.
async fn run_until_shutdown<F>(engine: F) -> Result<()>
where
    F: std::future::Future<Output = std::result::Result<(), hpsdr_core::RadioError>>,
{
    tokio::select! {
        result = engine => {
            result.wrap_err("protocol engine exited unexpectedly")?;
            Ok(())
        }
        _ = shutdown_signal() => {
            log::info!("shutdown signal received, closing sockets and exiting");
            Ok(())
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
