//! Aecsync - echo cancellation alignment loop
//!
//! Entry point for the loopback simulation and the real-device loop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use aecsync::config::AppConfig;
use aecsync::simulate::{self, EchoSubtractor};
use aecsync::PassthroughEngine;

/// Engine driven by the processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineKind {
    Subtract,
    Passthrough,
    #[cfg(feature = "webrtc")]
    Webrtc,
}

impl EngineKind {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "subtract" => Some(EngineKind::Subtract),
            "passthrough" => Some(EngineKind::Passthrough),
            #[cfg(feature = "webrtc")]
            "webrtc" => Some(EngineKind::Webrtc),
            _ => None,
        }
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("aecsync=info".parse()?)
                .add_directive("aecsync_core=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut write_config = false;
    let mut use_devices = false;
    let mut engine = EngineKind::Subtract;
    let mut duration: Option<u64> = None;
    let mut rate: Option<u32> = None;
    let mut channels: Option<u16> = None;
    let mut echo_delay: Option<u32> = None;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--version" | "-v" => {
                println!("aecsync {} ({})", aecsync::VERSION, aecsync::BUILD_DATE);
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--write-config" => {
                write_config = true;
            }
            "--devices" => {
                use_devices = true;
            }
            "--config" | "-c" => {
                let Some(value) = args.get(i + 1) else {
                    eprintln!("Error: --config requires a path");
                    return Ok(());
                };
                config_path = Some(PathBuf::from(value));
                i += 1;
            }
            "--engine" | "-e" => {
                let Some(kind) = args.get(i + 1).and_then(|v| EngineKind::parse(v)) else {
                    eprintln!("Error: --engine requires one of: {}", engine_names());
                    return Ok(());
                };
                engine = kind;
                i += 1;
            }
            "--duration" | "-d" => {
                duration = parse_value(&args, i, "--duration");
                if duration.is_none() {
                    return Ok(());
                }
                i += 1;
            }
            "--rate" | "-r" => {
                rate = parse_value(&args, i, "--rate");
                if rate.is_none() {
                    return Ok(());
                }
                i += 1;
            }
            "--channels" => {
                channels = parse_value(&args, i, "--channels");
                if channels.is_none() {
                    return Ok(());
                }
                i += 1;
            }
            "--echo-delay-ms" => {
                echo_delay = parse_value(&args, i, "--echo-delay-ms");
                if echo_delay.is_none() {
                    return Ok(());
                }
                i += 1;
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                return Ok(());
            }
        }
        i += 1;
    }

    let path = config_path.unwrap_or_else(AppConfig::path);
    let mut config = AppConfig::load_from(&path);
    if let Some(value) = duration {
        config.simulation.duration_secs = value;
    }
    if let Some(value) = rate {
        config.simulation.rate = value;
    }
    if let Some(value) = channels {
        config.simulation.channels = value;
    }
    if let Some(value) = echo_delay {
        config.simulation.echo_delay_ms = value;
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        eprintln!("Error: {:#}", e);
        return Ok(());
    }

    if write_config {
        config.save(&path)?;
        println!("Config written to {}", path.display());
        return Ok(());
    }

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .ok();

    if use_devices {
        return run_devices(&config, engine, running);
    }

    println!(
        "Simulating {} Hz x{} with {} ms echo ({})",
        config.simulation.rate,
        config.simulation.channels,
        config.simulation.echo_delay_ms,
        if config.simulation.duration_secs == 0 {
            "Ctrl+C to stop".to_string()
        } else {
            format!("{} s", config.simulation.duration_secs)
        }
    );

    let report = match engine {
        EngineKind::Subtract => simulate::run(&config, EchoSubtractor::new(config.simulation.echo_gain), running)?,
        EngineKind::Passthrough => simulate::run(&config, PassthroughEngine::new(), running)?,
        #[cfg(feature = "webrtc")]
        EngineKind::Webrtc => simulate::run(&config, aecsync::processor::engine::webrtc::WebrtcEngine::new()?, running)?,
    };

    info!(
        attenuation_db = report.attenuation_db(),
        coverage = report.stats.reference_coverage(),
        "Simulation report"
    );
    println!();
    println!("Periods:          {}", report.stats.periods_processed);
    println!("Reference reads:  {}", report.stats.reference_reads);
    println!("Reference misses: {}", report.stats.reference_misses);
    println!("Mic RMS:          {:.1}", report.mic_rms);
    println!("Residual RMS:     {:.1}", report.residual_rms);
    println!("Attenuation:      {:.1} dB", report.attenuation_db());
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

#[cfg(feature = "devices")]
fn run_devices(config: &AppConfig, engine: EngineKind, running: Arc<AtomicBool>) -> Result<()> {
    println!("Running on default devices. Press Ctrl+C to stop.");
    let stats = match engine {
        EngineKind::Subtract => aecsync::devices::run(config, EchoSubtractor::new(config.simulation.echo_gain), running)?,
        EngineKind::Passthrough => aecsync::devices::run(config, PassthroughEngine::new(), running)?,
        #[cfg(feature = "webrtc")]
        EngineKind::Webrtc => {
            aecsync::devices::run(config, aecsync::processor::engine::webrtc::WebrtcEngine::new()?, running)?
        }
    };
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

#[cfg(not(feature = "devices"))]
fn run_devices(_config: &AppConfig, _engine: EngineKind, _running: Arc<AtomicBool>) -> Result<()> {
    eprintln!("Error: built without the 'devices' feature");
    Ok(())
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> Option<T> {
    let Some(value) = args.get(i + 1) else {
        eprintln!("Error: {} requires a value", flag);
        return None;
    };
    let parsed = value.parse().ok();
    if parsed.is_none() {
        eprintln!("Error: Invalid value for {}: {}", flag, value);
    }
    parsed
}

fn engine_names() -> &'static str {
    if cfg!(feature = "webrtc") {
        "subtract, passthrough, webrtc"
    } else {
        "subtract, passthrough"
    }
}

fn print_help() {
    println!("Usage: aecsync [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -c, --config PATH       Config file (default: {})", AppConfig::path().display());
    println!("      --write-config      Write the effective config and exit");
    println!("  -e, --engine NAME       Engine: {} (default: subtract)", engine_names());
    println!("  -d, --duration SECS     Stop after SECS seconds (0 = until Ctrl+C)");
    println!("  -r, --rate HZ           Sample rate: 8000, 16000, 32000 or 48000");
    println!("      --channels N        Channel count");
    println!("      --echo-delay-ms MS  Simulated loudspeaker-to-microphone delay");
    println!("      --devices           Use the default audio devices instead of the simulation");
    println!("  -v, --version           Show version");
    println!("  -h, --help              Show this help");
    println!();
    println!("Examples:");
    println!("  aecsync -d 5 --echo-delay-ms 120");
    println!("  aecsync -e passthrough -r 48000 --channels 2");
}
