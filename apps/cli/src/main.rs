use std::path::PathBuf;
use std::time::Duration;

use amptek_core::protocol::DEFAULT_BAUD_RATE;
use amptek_core::{
    AcquisitionPreset, ApplyOptions, BatchPolicy, Configuration, DeviceHandle, DeviceModel,
    HvTarget, ManagerConfig, MultiAmptekMca, Outcomes, PresetStore, SerialPortConfig,
};
use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Amptek DPP/MCA control tool", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serial port to probe in addition to USB, as PATH or PATH@BAUD
    #[arg(long = "serial", value_name = "PATH[@BAUD]", global = true)]
    serial: Vec<String>,

    /// Only address devices of this model
    #[arg(long, global = true)]
    model: Option<DeviceModel>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List attached devices
    List,
    /// Print the status block of every device
    Status,
    /// Write parameters, e.g. `configure MCAC=2048 TPEA=4.0`
    Configure {
        #[arg(required = true, value_name = "CODE=VALUE")]
        assignments: Vec<String>,
        /// Persist in flash
        #[arg(long)]
        save: bool,
        /// Send parameters one by one and report every failure
        #[arg(long)]
        best_effort: bool,
        /// Ignore HVSE entries
        #[arg(long)]
        skip_hvse: bool,
    },
    /// Read parameters back
    Readback {
        #[arg(required = true, value_name = "CODE")]
        codes: Vec<String>,
    },
    /// List bundled default configurations
    Presets,
    /// Apply a bundled default configuration for each device's model
    ApplyPreset {
        name: String,
        #[arg(long)]
        save: bool,
        #[arg(long)]
        skip_hvse: bool,
    },
    /// Ramp the high voltage to a setpoint in volts, or OFF
    Hv {
        #[arg(allow_hyphen_values = true)]
        target: HvTarget,
        #[arg(long)]
        save: bool,
    },
    /// Acquire one spectrum per device
    Acquire {
        /// Acquisition time in seconds
        #[arg(long, default_value_t = 10.0)]
        seconds: f64,
        /// Use a live-time preset instead of real time
        #[arg(long)]
        live: bool,
        /// Print every channel count
        #[arg(long)]
        counts: bool,
    },
}

fn parse_serial(spec: &str) -> anyhow::Result<SerialPortConfig> {
    let (path, baud_rate) = match spec.rsplit_once('@') {
        Some((path, baud)) => (
            path,
            baud.parse()
                .with_context(|| format!("invalid baud rate in '{}'", spec))?,
        ),
        None => (spec, DEFAULT_BAUD_RATE),
    };
    Ok(SerialPortConfig {
        path: path.to_string(),
        baud_rate,
    })
}

/// Print failures and return how many there were.
fn report<T>(outcomes: Outcomes<T>, mut on_ok: impl FnMut(DeviceHandle, T)) -> usize {
    let mut failed = 0;
    for (handle, result) in outcomes {
        match result {
            Ok(value) => on_ok(handle, value),
            Err(e) => {
                error!(device = %handle, "{}", e);
                failed += 1;
            }
        }
    }
    failed
}

fn run(args: Args) -> anyhow::Result<()> {
    if let Commands::Presets = args.command {
        for (model, names) in PresetStore::bundled().all_names() {
            if args.model.is_some_and(|m| m != model) {
                continue;
            }
            for name in names {
                println!("{:<9} {}", model, name);
            }
        }
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => ManagerConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ManagerConfig::default(),
    };
    for spec in &args.serial {
        config.serial_ports.push(parse_serial(spec)?);
    }

    let mut manager = MultiAmptekMca::new(config);
    let found = manager.discover_default();
    if found.is_empty() {
        bail!("No Amptek devices found");
    }
    info!(count = found.len(), "Devices found");

    let model = args.model;
    let mut failed = report(manager.connect(model), |_, _| {});

    match args.command {
        Commands::Presets => {}
        Commands::List => {
            for handle in manager.handles() {
                let identity = manager.identity(handle)?;
                let model = identity.model.map(|m| m.to_string()).unwrap_or_else(|| "?".into());
                let serial = identity
                    .serial_number
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".into());
                println!("{:<4} {:<9} sn={:<8} {}", handle, model, serial, identity.transport);
            }
        }
        Commands::Status => {
            failed += report(manager.get_status(model), |handle, s| {
                println!("{} {} sn={}", handle, s.model, s.serial_number);
                println!(
                    "    firmware {}  fpga {}  bootloader {}",
                    s.firmware_version, s.fpga_version, s.bootloader
                );
                println!(
                    "    fast {}  slow {}  acq {:.1}s  real {:.1}s",
                    s.fast_count,
                    s.slow_count,
                    s.acquisition_time.as_secs_f64(),
                    s.real_time.as_secs_f64()
                );
                println!(
                    "    HV {:.1} V  detector {:.1} K  board {} C  mca {}",
                    s.hv_volts,
                    s.detector_temp_k,
                    s.board_temp_c,
                    if s.flags.mca_enabled { "enabled" } else { "disabled" }
                );
            });
        }
        Commands::Configure {
            assignments,
            save,
            best_effort,
            skip_hvse,
        } => {
            let parsed = Configuration::parse_text(&assignments.join(";"))?;
            let options = ApplyOptions {
                save_to_flash: save,
                skip_hvse,
                policy: best_effort.then_some(BatchPolicy::BestEffort),
            };
            failed += report(manager.send_configuration(&parsed, options, model), |handle, _| {
                println!("{} configured", handle);
            });
        }
        Commands::Readback { codes } => {
            let codes: Vec<&str> = codes.iter().map(String::as_str).collect();
            for handle in manager.handles() {
                let session = manager.get_device(handle)?;
                if model.is_some() && session.model() != model {
                    continue;
                }
                match session.read_configuration(&codes) {
                    Ok(values) => {
                        let text: Vec<String> =
                            values.iter().map(|(c, v)| format!("{}={}", c, v)).collect();
                        println!("{} {}", handle, text.join(";"));
                    }
                    Err(e) => {
                        error!(device = %handle, "{}", e);
                        failed += 1;
                    }
                }
            }
        }
        Commands::ApplyPreset {
            name,
            save,
            skip_hvse,
        } => {
            let options = ApplyOptions {
                save_to_flash: save,
                skip_hvse,
                policy: None,
            };
            failed += report(
                manager.apply_default_configuration(&name, options, model),
                |handle, _| println!("{} applied '{}'", handle, name),
            );
        }
        Commands::Hv { target, save } => {
            failed += report(manager.set_hvse(target, save, model), |handle, volts| {
                println!("{} HV at {:.1} V ({})", handle, volts, target);
            });
        }
        Commands::Acquire {
            seconds,
            live,
            counts,
        } => {
            if !(seconds.is_finite() && seconds > 0.0) {
                bail!("acquisition time must be positive");
            }
            let duration = Duration::from_secs_f64(seconds);
            let preset = if live {
                AcquisitionPreset::LiveTime(duration)
            } else {
                AcquisitionPreset::RealTime(duration)
            };
            failed += report(manager.acquire_spectrum(preset, model), |handle, spectrum| {
                println!(
                    "{} {} channels, {} counts",
                    handle,
                    spectrum.channels(),
                    spectrum.total_counts()
                );
                if counts {
                    for (channel, count) in spectrum.counts.iter().enumerate() {
                        println!("{}\t{}", channel, count);
                    }
                }
            });
        }
    }

    manager.disconnect_all();
    if failed > 0 {
        bail!("{} device operation(s) failed", failed);
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
