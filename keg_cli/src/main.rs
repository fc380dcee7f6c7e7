use clap::{Parser, Subcommand};
use keg_core::journal::Journal;
use keg_core::line::PulseNotify;
use keg_core::*;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "kegflow")]
#[command(about = "Keg flow metering and volume tracking", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: $XDG_CONFIG_HOME/kegflow/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor every configured tap and record pours against tapped kegs
    Monitor {
        /// Stop after this many seconds instead of waiting for Enter
        #[arg(long)]
        duration_secs: Option<u64>,

        /// Print per-tap readings this often
        #[arg(long, default_value_t = 5)]
        status_every_secs: u64,
    },

    /// Sample every tap's meter once and print its readings
    Status {
        #[arg(long, default_value_t = 2)]
        sample_secs: u64,
    },

    /// Calibrate a tap's meter against a measured volume
    Calibrate {
        #[arg(long)]
        tap: u32,

        /// Reference volume actually dispensed, in millilitres
        #[arg(long)]
        volume_ml: f64,

        /// Count for this many seconds instead of waiting for Enter
        #[arg(long)]
        wait_secs: Option<u64>,
    },

    /// List stored calibration profiles
    Calibration,

    /// Count raw pulses on a line to check wiring
    TestLine {
        /// Configured tap whose line to test
        #[arg(long, conflicts_with = "line")]
        tap: Option<u32>,

        /// Line identifier, e.g. gpio:4
        #[arg(long)]
        line: Option<String>,

        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },

    /// Manage kegs
    Keg {
        #[command(subcommand)]
        command: KegCommands,
    },

    /// Record a manual pour against a keg
    Pour {
        #[arg(long)]
        keg: u32,

        #[arg(long)]
        volume_ml: f64,
    },

    /// Show pour history, newest first
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Export pour history and kegs as CSV
    Export {
        /// Directory for pours.csv and kegs.csv (default: data directory)
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// List pours that could not be delivered to the ledger
    Undelivered,

    /// Write a default config file to --config or the standard path
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum KegCommands {
    /// Add a new untapped keg
    Add {
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "")]
        style: String,

        #[arg(long, default_value_t = 0.0)]
        abv: f64,

        /// Starting volume in litres
        #[arg(long, default_value_t = 19.0)]
        volume_l: f64,
    },

    /// Put a keg on a tap
    Tap {
        #[arg(long)]
        id: u32,

        #[arg(long)]
        tap: u32,
    },

    /// Take a keg off its tap
    Off {
        #[arg(long)]
        id: u32,
    },

    /// List kegs
    List,
}

fn main() -> Result<()> {
    keg_core::logging::init();

    let cli = Cli::parse();
    if let Commands::InitConfig { force } = cli.command {
        return cmd_init_config(cli.config.as_deref(), cli.data_dir, force);
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(data_dir) = cli.data_dir {
        config.data.data_dir = data_dir;
    }
    config.validate()?;
    let paths = config.paths();
    tracing::debug!("Using data directory {:?}", paths.root);

    match cli.command {
        Commands::Monitor {
            duration_secs,
            status_every_secs,
        } => cmd_monitor(&config, &paths, duration_secs, status_every_secs),
        Commands::Status { sample_secs } => cmd_status(&config, &paths, sample_secs),
        Commands::Calibrate {
            tap,
            volume_ml,
            wait_secs,
        } => cmd_calibrate(&config, &paths, tap, volume_ml, wait_secs),
        Commands::Calibration => cmd_calibration(&paths),
        Commands::TestLine { tap, line, seconds } => {
            cmd_test_line(&config, &paths, tap, line, seconds)
        }
        Commands::Keg { command } => cmd_keg(&paths, command),
        Commands::Pour { keg, volume_ml } => {
            let receipt = paths.ledger().record_manual_pour(keg, volume_ml / 1000.0)?;
            println!(
                "✓ Poured {:.0}ml from keg {} ({:.2}L left)",
                volume_ml, receipt.keg_id, receipt.volume_remaining
            );
            Ok(())
        }
        Commands::History { limit } => cmd_history(&paths, limit),
        Commands::Export { out_dir } => cmd_export(&paths, out_dir),
        Commands::Undelivered => cmd_undelivered(&paths),
        Commands::InitConfig { .. } => Ok(()),
    }
}

fn cmd_init_config(path: Option<&Path>, data_dir: Option<PathBuf>, force: bool) -> Result<()> {
    let mut config = Config::default();
    if let Some(data_dir) = data_dir {
        config.data.data_dir = data_dir;
    }
    let target = path.map_or_else(Config::default_config_path, Path::to_path_buf);
    if target.exists() && !force {
        return Err(Error::Config(format!(
            "{} already exists, pass --force to overwrite",
            target.display()
        )));
    }
    match path {
        Some(path) => config.save_to(path)?,
        None => config.save()?,
    }
    println!("✓ Wrote default config to {}", target.display());
    Ok(())
}

fn line_provider(config: &Config) -> DefaultLineProvider {
    DefaultLineProvider::new(config.hardware.gpio_root.clone(), config.sample_interval())
}

fn cmd_monitor(
    config: &Config,
    paths: &DataPaths,
    duration_secs: Option<u64>,
    status_every_secs: u64,
) -> Result<()> {
    let store = paths.calibration_store();
    let ledger: Arc<dyn PourLedger> = Arc::new(paths.ledger());
    let mut system = MultiTapFlowSystem::new(
        &config.taps,
        Some(&store),
        &line_provider(config),
        ledger,
        config.system_settings()?,
    )?
    .with_undelivered_journal(paths.undelivered_journal());

    // A deadline, Enter on stdin, SIGINT or SIGTERM ends the run
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let signal_tx = stop_tx.clone();
    ctrlc::set_handler(move || {
        let _ = signal_tx.send(());
    })
    .map_err(|e| Error::Other(format!("failed to install signal handler: {}", e)))?;

    system.start_all()?;
    for excluded in system.excluded_taps() {
        println!(
            "⚠ Tap {} excluded (line {}): {}",
            excluded.tap, excluded.line, excluded.reason
        );
    }
    println!("Monitoring taps {:?}", system.taps());

    let deadline = duration_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
    if deadline.is_none() {
        println!("Press Enter to stop");
        let stdin_tx = stop_tx.clone();
        thread::spawn(move || {
            let mut input = String::new();
            let _ = io::stdin().read_line(&mut input);
            let _ = stdin_tx.send(());
        });
    }

    let status_every = Duration::from_secs(status_every_secs.max(1));
    let mut next_status = Instant::now() + status_every;
    loop {
        let now = Instant::now();
        if deadline.is_some_and(|d| now >= d) {
            break;
        }
        let mut wait = next_status.saturating_duration_since(now);
        if let Some(d) = deadline {
            wait = wait.min(d.saturating_duration_since(now));
        }
        // stop_tx stays alive here, so the channel never disconnects
        if stop_rx.recv_timeout(wait).is_ok() {
            tracing::info!("Stop requested");
            break;
        }
        if Instant::now() >= next_status {
            print_status(&system.status());
            next_status += status_every;
        }
    }
    drop(stop_tx);

    let reports = system.stop_all();
    for report in &reports {
        println!(
            "Final pour on tap {}: {:.1}ml",
            report.tap,
            report.volume * 1000.0
        );
    }
    let stats = system.delivery_stats();
    println!(
        "✓ Stopped. {} pours recorded, {} retries, {} undelivered",
        stats.delivered, stats.retries, stats.dropped
    );
    if stats.dropped > 0 {
        println!(
            "  See `kegflow undelivered` ({})",
            paths.undelivered_path().display()
        );
    }
    Ok(())
}

fn print_status(status: &[TapStatus]) {
    println!("{:<5} {:<12} {:>9} {:>10} {:>10}  State", "Tap", "Line", "Pulses", "Litres", "L/min");
    for tap in status {
        let state = if !tap.monitoring {
            "stopped"
        } else if tap.pouring {
            "pouring"
        } else {
            "idle"
        };
        println!(
            "{:<5} {:<12} {:>9} {:>10.3} {:>10.2}  {}",
            tap.tap, tap.line, tap.pulse_count, tap.volume, tap.flow_rate, state
        );
    }
}

fn cmd_status(config: &Config, paths: &DataPaths, sample_secs: u64) -> Result<()> {
    let store = paths.calibration_store();
    let provider = line_provider(config);
    let settings = config.meter_settings()?;

    let mut meters = Vec::new();
    for tap in &config.taps {
        let pulses_per_unit = match tap.pulses_per_unit {
            Some(ppu) => Some(ppu),
            None => store.load(tap.id)?.map(|p| p.pulses_per_unit),
        };
        let Some(pulses_per_unit) = pulses_per_unit else {
            println!("Tap {}: not calibrated", tap.id);
            continue;
        };
        match provider.open(tap.id, &tap.line) {
            Ok(line) => {
                let mut meter = FlowMeter::new(tap.id, line, pulses_per_unit, settings)?;
                match meter.start_monitoring() {
                    Ok(()) => meters.push(meter),
                    Err(e) => println!("Tap {}: {}", tap.id, e),
                }
            }
            Err(e) if e.is_hardware_unavailable() => println!("Tap {}: {}", tap.id, e),
            Err(e) => return Err(e),
        }
    }

    thread::sleep(Duration::from_secs(sample_secs));

    let now = Instant::now();
    let status: Vec<TapStatus> = meters
        .iter()
        .map(|meter| {
            let reading = meter.reading_at(now);
            TapStatus {
                tap: reading.tap,
                line: meter.line_id().to_string(),
                pulses_per_unit: meter.pulses_per_unit(),
                pulse_count: reading.pulse_count,
                volume: reading.volume,
                flow_rate: reading.flow_rate,
                pouring: reading.flow_rate > config.monitor.rate_threshold,
                monitoring: reading.monitoring,
            }
        })
        .collect();
    print_status(&status);

    for mut meter in meters {
        meter.cleanup();
    }
    Ok(())
}

fn cmd_calibrate(
    config: &Config,
    paths: &DataPaths,
    tap: u32,
    volume_ml: f64,
    wait_secs: Option<u64>,
) -> Result<()> {
    let tap_config = config.tap(tap)?;
    let tool = CalibrationTool::new(paths.calibration_store());

    // Provisional constant, only used for the live readout
    let provisional = match tap_config.pulses_per_unit {
        Some(ppu) => ppu,
        None => tool
            .store()
            .load(tap)
            .ok()
            .flatten()
            .map_or(1.0, |p| p.pulses_per_unit),
    };

    let line = line_provider(config).open(tap, &tap_config.line)?;
    let mut meter = FlowMeter::new(tap, line, provisional, config.meter_settings()?)?;
    let session = tool.begin(&mut meter)?;

    match wait_secs {
        Some(secs) => {
            println!("Counting pulses on tap {} for {}s...", tap, secs);
            thread::sleep(Duration::from_secs(secs));
        }
        None => {
            println!("Pour exactly {:.0}ml from tap {}, then press Enter", volume_ml, tap);
            print!("> ");
            io::stdout().flush()?;
            let mut input = String::new();
            io::stdin().read_line(&mut input)?;
        }
    }

    println!("Counted {} pulses", session.pulses());
    let profile = session.finish(volume_ml / 1000.0)?;
    println!(
        "✓ Tap {} calibrated: {:.2} pulses/L (version {})",
        profile.tap, profile.pulses_per_unit, profile.version
    );
    if tap_config.pulses_per_unit.is_some() {
        println!("  Note: tap {} has pulses_per_unit set in the config, which takes precedence", tap);
    }
    Ok(())
}

fn cmd_calibration(paths: &DataPaths) -> Result<()> {
    let profiles = paths.calibration_store().list()?;
    if profiles.is_empty() {
        println!("No calibration profiles stored.");
        return Ok(());
    }
    for profile in profiles {
        println!(
            "Tap {}: {:.2} pulses/L (v{}, {} pulses for {:.3}L, {})",
            profile.tap,
            profile.pulses_per_unit,
            profile.version,
            profile.pulses_counted,
            profile.reference_volume,
            profile.captured_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn cmd_test_line(
    config: &Config,
    paths: &DataPaths,
    tap: Option<u32>,
    line: Option<String>,
    seconds: u64,
) -> Result<()> {
    let (tap_id, line_id, pulses_per_unit) = match (tap, line) {
        (Some(tap), _) => {
            let tap_config = config.tap(tap)?;
            let ppu = match tap_config.pulses_per_unit {
                Some(ppu) => Some(ppu),
                None => paths.calibration_store().load(tap)?.map(|p| p.pulses_per_unit),
            };
            (tap, tap_config.line.clone(), ppu)
        }
        (None, Some(line)) => (0, line, None),
        (None, None) => {
            return Err(Error::Config("pass --tap or --line".into()));
        }
    };

    let mut line = line_provider(config).open(tap_id, &line_id)?;
    let counter = Arc::new(PulseCounter::new(config.debounce()?, Duration::from_secs(1)));
    let notify: PulseNotify = {
        let counter = counter.clone();
        Arc::new(move |at| {
            counter.on_transition_at(at);
        })
    };

    println!("Counting pulses on {} for {}s...", line_id, seconds);
    line.bind(notify)?;
    thread::sleep(Duration::from_secs(seconds));
    line.release();

    let pulses = counter.count();
    println!("✓ {} pulses ({:.1} Hz average)", pulses, pulses as f64 / seconds.max(1) as f64);
    match pulses_per_unit {
        Some(ppu) => println!("  ≈ {:.1}ml at {:.2} pulses/L", pulses as f64 / ppu * 1000.0, ppu),
        None if pulses == 0 => println!("  No pulses: check wiring and that liquid is flowing"),
        None => {}
    }
    Ok(())
}

fn cmd_keg(paths: &DataPaths, command: KegCommands) -> Result<()> {
    let ledger = paths.ledger();
    match command {
        KegCommands::Add {
            name,
            style,
            abv,
            volume_l,
        } => {
            let keg = ledger.add_keg(NewKeg {
                name,
                style,
                abv,
                volume: volume_l,
            })?;
            println!("✓ Added keg {} ({}, {:.1}L)", keg.id, keg.name, keg.volume_remaining);
        }
        KegCommands::Tap { id, tap } => {
            let keg = ledger.tap_keg(id, tap)?;
            println!("✓ Keg {} ({}) is on tap {}", keg.id, keg.name, tap);
        }
        KegCommands::Off { id } => {
            let keg = ledger.take_off_tap(id)?;
            println!("✓ Keg {} ({}) taken off tap", keg.id, keg.name);
        }
        KegCommands::List => {
            let kegs = ledger.kegs()?;
            if kegs.is_empty() {
                println!("No kegs.");
            }
            for keg in kegs {
                let tap = keg
                    .tap_position
                    .map_or_else(|| "-".to_string(), |t| t.to_string());
                println!(
                    "{:>3}  {:<20} {:<12} tap {:<2} {:>6.2}L / {:.1}L  {}{}",
                    keg.id,
                    keg.name,
                    keg.status.as_str(),
                    tap,
                    keg.volume_remaining,
                    keg.original_volume,
                    keg.style,
                    if keg.is_low() { "  (low)" } else { "" }
                );
            }
        }
    }
    Ok(())
}

fn cmd_history(paths: &DataPaths, limit: usize) -> Result<()> {
    let events = paths.ledger().pour_history(Some(limit))?;
    if events.is_empty() {
        println!("No pours recorded.");
        return Ok(());
    }
    for event in events {
        let source = match event.source {
            PourSource::FlowMeter => format!("tap {}", event.tap.unwrap_or_default()),
            PourSource::Manual => "manual".to_string(),
        };
        println!(
            "{}  keg {:<3} {:>7.1}ml ({:.1}oz)  {}",
            event.poured_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
            event.keg_id,
            event.volume * 1000.0,
            litres_to_ounces(event.volume),
            source
        );
    }
    Ok(())
}

fn cmd_export(paths: &DataPaths, out_dir: Option<PathBuf>) -> Result<()> {
    let out_dir = out_dir.unwrap_or_else(|| paths.root.clone());
    let ledger = paths.ledger();

    let pours_path = out_dir.join("pours.csv");
    let kegs_path = out_dir.join("kegs.csv");
    let pours = keg_core::export::export_pours(&ledger.pour_history(None)?, &pours_path)?;
    let kegs = keg_core::export::export_kegs(&ledger.kegs()?, &kegs_path)?;

    println!("✓ Exported {} pours to {}", pours, pours_path.display());
    println!("✓ Exported {} kegs to {}", kegs, kegs_path.display());
    Ok(())
}

fn cmd_undelivered(paths: &DataPaths) -> Result<()> {
    let journal = Journal::new(paths.undelivered_path());
    let entries: Vec<UndeliveredPour> = journal.read_all()?;
    if entries.is_empty() {
        println!("No undelivered pours.");
        return Ok(());
    }

    let mut total = 0.0;
    for entry in &entries {
        total += entry.report.volume;
        println!(
            "{}  tap {}  {:.1}ml  after {} attempts: {}",
            entry.dropped_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
            entry.report.tap,
            entry.report.volume * 1000.0,
            entry.attempts,
            entry.last_error
        );
    }
    println!(
        "{} undelivered pours, {:.1}ml total. Reconcile with `kegflow pour`.",
        entries.len(),
        total * 1000.0
    );
    Ok(())
}
