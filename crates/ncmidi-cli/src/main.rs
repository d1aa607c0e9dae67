use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use ncmidi_bridge::bridge::{MidiBuffer, ProcessBlock};
use ncmidi_bridge::config::BridgeConfig;
use ncmidi_bridge::discovery::DiscoveryOutcome;
use ncmidi_bridge::session::BridgeSession;
use ncmidi_bridge::settings::TomlSettings;
use ncmidi_protocol::midi::MidiEvent;

/// UI poll rate of the message log
const UI_TICK: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(name = "ncmidi", about = "MIDI over UDP bridge for a handheld controller")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "config/ncmidi.toml", global = true)]
    config: PathBuf,

    /// Path to persisted settings (peer address, logging switch)
    #[arg(short, long, default_value = "config/settings.toml", global = true)]
    settings: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bridge with a simulated audio callback until Ctrl-C
    Run {
        /// Block period in milliseconds
        #[arg(long, default_value_t = 10)]
        block_ms: u64,
        /// Samples per block
        #[arg(long, default_value_t = 256)]
        block_size: usize,
    },
    /// Wait for one hello broadcast from the device and adopt it as peer
    Discover,
    /// Show or set the peer address
    Peer {
        /// New peer IPv4 address
        ip: Option<String>,
    },
    /// Send one raw MIDI message to the peer, e.g. `send 90 3C 7F`
    Send {
        /// Message bytes in hex
        #[arg(required = true)]
        bytes: Vec<String>,
    },
    /// Turn the message log on or off
    Logging {
        state: Switch,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Switch {
    On,
    Off,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = BridgeConfig::load(&args.config)?;
    let settings = TomlSettings::open(&args.settings)
        .with_context(|| format!("Failed to open settings {}", args.settings.display()))?;
    let session = BridgeSession::open(config, Arc::new(settings))?;

    match args.command {
        Commands::Run { block_ms, block_size } => run(&session, block_ms, block_size),
        Commands::Discover => discover(&session),
        Commands::Peer { ip: Some(ip) } => {
            let endpoint = session.set_peer_ip(&ip)?;
            println!("Peer set to {}", endpoint);
            Ok(())
        }
        Commands::Peer { ip: None } => {
            println!("{}", session.peer());
            Ok(())
        }
        Commands::Send { bytes } => send(&session, &bytes),
        Commands::Logging { state } => {
            let enabled = matches!(state, Switch::On);
            session.set_logging_enabled(enabled);
            println!("Message log {}", if enabled { "on" } else { "off" });
            Ok(())
        }
    }
}

fn run(session: &BridgeSession, block_ms: u64, block_size: usize) -> anyhow::Result<()> {
    let mut bridge = session.processor();
    let stats = bridge.stats();
    let running = Arc::new(AtomicBool::new(true));

    info!(peer = %session.peer(), block_ms, block_size, "Bridge running, Ctrl-C to stop");

    let audio = {
        let running = Arc::clone(&running);
        std::thread::Builder::new()
            .name("ncmidi-audio".into())
            .spawn(move || {
                let period = Duration::from_millis(block_ms.max(1));
                let mut left = vec![0.0f32; block_size];
                let mut right = vec![0.0f32; block_size];
                let mut midi = MidiBuffer::new();
                while running.load(Ordering::Relaxed) {
                    midi.clear();
                    let mut channels = [left.as_mut_slice(), right.as_mut_slice()];
                    bridge.process(&mut channels, &mut midi);
                    std::thread::sleep(period);
                }
            })
            .context("Failed to spawn audio thread")?
    };

    let mut view = session.log_view();
    session.block_on(async {
        let mut ticker = tokio::time::interval(UI_TICK);
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = ticker.tick() => {
                    for line in view.tick(session.log()) {
                        println!("{}", line);
                    }
                }
            }
        }
    });

    running.store(false, Ordering::Relaxed);
    if audio.join().is_err() {
        bail!("Audio thread panicked");
    }

    let s = stats.snapshot();
    info!(
        sent = s.sent,
        send_errors = s.send_errors,
        received = s.received,
        injected = s.injected,
        malformed = s.malformed,
        "Shutting down..."
    );
    Ok(())
}

fn discover(session: &BridgeSession) -> anyhow::Result<()> {
    let Some(mut handle) = session.start_discovery() else {
        bail!("Discovery already in progress");
    };

    let outcome = session.block_on(async {
        if let Some(addr) = handle.listening_addr().await {
            println!("Waiting for device hello on {}", addr);
        }
        let wait = handle.wait();
        tokio::pin!(wait);
        tokio::select! {
            outcome = &mut wait => outcome,
            _ = tokio::signal::ctrl_c() => {
                session.cancel_discovery();
                wait.await
            }
        }
    });

    for line in session.log().drain() {
        println!("{}", line);
    }

    match outcome {
        DiscoveryOutcome::Completed(ip) => {
            println!("Peer is now {}", session.peer());
            info!(%ip, "Discovery complete");
            Ok(())
        }
        DiscoveryOutcome::Mismatch => bail!("Received a datagram without the hello marker"),
        DiscoveryOutcome::TimedOut => bail!("No broadcast received"),
        DiscoveryOutcome::Cancelled => {
            println!("Discovery cancelled");
            Ok(())
        }
        DiscoveryOutcome::BindFailed => bail!("Could not bind the discovery port"),
        DiscoveryOutcome::ReceiveFailed => bail!("Discovery socket error"),
        DiscoveryOutcome::TaskFailed => bail!("Discovery task crashed"),
    }
}

fn send(session: &BridgeSession, bytes: &[String]) -> anyhow::Result<()> {
    let raw = parse_hex_bytes(bytes)?;
    let event = MidiEvent::new(0, &raw).context("First byte must be a MIDI status byte")?;

    session.send_once(&event)?;
    println!("Sent {} to {}", event, session.peer());
    Ok(())
}

fn parse_hex_bytes(args: &[String]) -> anyhow::Result<Vec<u8>> {
    args.iter()
        .flat_map(|arg| arg.split_whitespace())
        .map(|tok| {
            let digits = tok.trim_start_matches("0x").trim_start_matches("0X");
            u8::from_str_radix(digits, 16).with_context(|| format!("Invalid hex byte '{}'", tok))
        })
        .collect()
}
