//! MCL: Monte Carlo localization of a planar robot against a known static map.
//!
//! The tool replays recorded scans through the localizer offline. Three commands are provided:
//!
//! - `run`: localize a recorded run (scan CSV) against an ASCII occupancy map.
//! - `simulate`: generate a synthetic run in a built-in room, localize it, and report the error against
//!   ground truth.
//! - `config`: write the default localizer configuration to a file.
//!
//! Localizer parameters are read from a configuration file (TOML/JSON/YAML) given with `--config`; every
//! parameter not named in the file keeps its default.
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::error::Error;
use std::path::{Path, PathBuf};

use mcl::map::{DistanceGrid, FileMapServer, OccupancyGrid};
use mcl::messages::{RecordingPublisher, build_event_stream, run_event_stream};
use mcl::sim::{
    ErrorSummary, LocalizationResult, OdometryNoise, ScanRecord, ScenarioConfig, demo_room,
    demo_trajectory, generate_scenario, position_errors,
};
use mcl::transform::TransformBuffer;
use mcl::{Localizer, LocalizerConfig, Pose2D};

/// Command line arguments
#[derive(Parser)]
#[command(
    author,
    version,
    about = "Monte Carlo localization of a planar robot against a known static map."
)]
struct Cli {
    /// Localizer configuration file (TOML/JSON/YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(
        name = "run",
        about = "Localize a recorded run against an occupancy map",
        long_about = "Replay a scan CSV through the localizer. Each row carries the scan time, the odometry pose at that time, and the 360 one-degree range readings joined by ';'. Broadcast ticks are interleaved at the configured rate and every handled scan produces one output row."
    )]
    Run(RunArgs),
    #[command(
        name = "simulate",
        about = "Localize a synthetic run in a built-in room",
        long_about = "Drive a simulated robot around an ellipse in a 10 m x 8 m room with noisy odometry, cast ideal scans from the true poses, localize the run, and report the position error against ground truth."
    )]
    Simulate(SimulateArgs),
    #[command(name = "config", about = "Write the default configuration to a file")]
    CreateConfig(CreateConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// ASCII occupancy map ('#' occupied, '.' free, '?' unknown; top line is the highest row)
    #[arg(short, long, value_parser)]
    map: PathBuf,
    /// Map resolution in meters per cell
    #[arg(long, default_value_t = 0.05)]
    resolution: f64,
    /// Map-frame x of the lower-left corner of the map
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    origin_x: f64,
    /// Map-frame y of the lower-left corner of the map
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    origin_y: f64,
    /// Input scan CSV
    #[arg(short, long, value_parser)]
    scans: PathBuf,
    /// Output CSV of localization results
    #[arg(short, long, value_parser)]
    output: PathBuf,
    /// Frame of the recorded scans; mounted at the robot origin
    #[arg(long, default_value = "laser")]
    laser_frame: String,
    #[command(flatten)]
    initial: InitialPoseArgs,
}

/// Optional pose override delivered before the first scan
#[derive(Args, Clone, Debug)]
struct InitialPoseArgs {
    #[arg(long, requires_all = ["initial_y", "initial_theta"], allow_negative_numbers = true)]
    initial_x: Option<f64>,
    #[arg(long, requires_all = ["initial_x", "initial_theta"], allow_negative_numbers = true)]
    initial_y: Option<f64>,
    /// Heading in radians
    #[arg(long, requires_all = ["initial_x", "initial_y"], allow_negative_numbers = true)]
    initial_theta: Option<f64>,
}
impl InitialPoseArgs {
    fn pose(&self) -> Option<Pose2D> {
        Some(Pose2D::new(self.initial_x?, self.initial_y?, self.initial_theta?))
    }
}

#[derive(Args, Clone, Debug)]
struct SimulateArgs {
    /// Output CSV of localization results
    #[arg(short, long, value_parser)]
    output: PathBuf,
    /// Also write the generated scans (with ground truth) to this CSV
    #[arg(long)]
    scans_output: Option<PathBuf>,
    /// Also write the room map as ASCII to this file
    #[arg(long)]
    map_output: Option<PathBuf>,
    /// Number of scans around the loop
    #[arg(long, default_value_t = 200)]
    steps: usize,
    /// Time between scans in seconds
    #[arg(long, default_value_t = 0.1)]
    interval: f64,
    /// Seed for the scenario's odometry noise
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Standard deviation of the per-step odometry translation error in meters
    #[arg(long, default_value_t = 0.01)]
    translation_noise: f64,
    /// Standard deviation of the per-step odometry rotation error in radians
    #[arg(long, default_value_t = 0.005)]
    rotation_noise: f64,
}

#[derive(Args, Clone, Debug)]
struct CreateConfigArgs {
    /// Output path; the format follows the extension (.toml/.json/.yaml/.yml)
    #[arg(short, long, value_parser, default_value = "mcl.toml")]
    output: PathBuf,
}

/// Set up env_logger with the given level, writing to `log_file` when provided.
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<LocalizerConfig, Box<dyn Error>> {
    match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Ok(LocalizerConfig::from_file(path)?)
        }
        None => Ok(LocalizerConfig::default()),
    }
}

/// Transform tree for offline replay: the laser sits at the robot origin.
fn replay_buffer(config: &LocalizerConfig, laser_frame: &str) -> TransformBuffer {
    let mut buffer = TransformBuffer::new();
    buffer.set_static_transform(&config.frames.base_frame, laser_frame, Pose2D::identity());
    buffer
}

fn replay(
    mut localizer: Localizer<DistanceGrid>,
    records: &[ScanRecord],
    laser_frame: &str,
    initial_pose: Option<Pose2D>,
    output: &Path,
) -> Result<Vec<LocalizationResult>, Box<dyn Error>> {
    let mut buffer = replay_buffer(localizer.config(), laser_frame);
    let stream = build_event_stream(
        records,
        laser_frame,
        localizer.config().broadcast_rate_hz,
        initial_pose,
    );
    info!(
        "Replaying {} events from {}",
        stream.events.len(),
        stream.start_time
    );
    let mut publisher = RecordingPublisher::default();
    let results = run_event_stream(&mut localizer, &mut buffer, stream, &mut publisher)?;
    let diagnostics = localizer.diagnostics();
    info!(
        "Handled {} of {} scans: {} updates, {} held, {} transforms broadcast",
        results.len(),
        diagnostics.scans_received,
        diagnostics.cycles_run,
        diagnostics.cycles_held,
        publisher.transforms.len()
    );
    LocalizationResult::to_csv(&results, output)?;
    info!("Results written to {}", output.display());
    Ok(results)
}

fn run_recorded(args: &RunArgs, config: LocalizerConfig) -> Result<(), Box<dyn Error>> {
    let server = FileMapServer::new(&args.map, args.resolution, (args.origin_x, args.origin_y));
    let localizer = Localizer::bootstrap(config, &server)?;
    let records = ScanRecord::from_csv(&args.scans)?;
    info!("Read {} scans from {}", records.len(), args.scans.display());
    if records.is_empty() {
        warn!("No scans to localize");
    }
    let results = replay(
        localizer,
        &records,
        &args.laser_frame,
        args.initial.pose(),
        &args.output,
    )?;
    let errors = position_errors(&results, &records);
    if let Some(summary) = ErrorSummary::from_errors(&errors) {
        report(&summary);
    }
    Ok(())
}

fn run_simulation(args: &SimulateArgs, config: LocalizerConfig) -> Result<(), Box<dyn Error>> {
    let grid: OccupancyGrid = demo_room()?;
    if let Some(path) = &args.map_output {
        std::fs::write(path, grid.to_ascii())?;
        info!("Map written to {}", path.display());
    }
    let trajectory = demo_trajectory(args.steps);
    let scenario = ScenarioConfig {
        start_time: chrono::Utc::now(),
        interval_s: args.interval,
        max_range: 12.0,
        odometry_noise: OdometryNoise {
            translation_std: args.translation_noise,
            rotation_std: args.rotation_noise,
        },
    };
    let mut rng = StdRng::seed_from_u64(args.seed);
    let records = generate_scenario(&grid, &trajectory, &scenario, &mut rng)?;
    info!("Generated {} scans", records.len());
    if let Some(path) = &args.scans_output {
        ScanRecord::to_csv(&records, path)?;
        info!("Scans written to {}", path.display());
    }

    let field = DistanceGrid::from_occupancy(&grid)?;
    let localizer = Localizer::new(config, field)?;
    let initial_pose = trajectory.first().copied();
    let results = replay(localizer, &records, "laser", initial_pose, &args.output)?;
    let errors = position_errors(&results, &records);
    match ErrorSummary::from_errors(&errors) {
        Some(summary) => report(&summary),
        None => warn!("No localization results to compare against ground truth"),
    }
    Ok(())
}

fn report(summary: &ErrorSummary) {
    println!(
        "Position error: mean {:.3} m, max {:.3} m, final {:.3} m",
        summary.mean, summary.max, summary.last
    );
}

fn create_config_file(args: &CreateConfigArgs) -> Result<(), Box<dyn Error>> {
    LocalizerConfig::default().to_file(&args.output)?;
    println!("Default configuration written to {}", args.output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    match &cli.command {
        Command::Run(args) => {
            let config = load_config(cli.config.as_ref())?;
            run_recorded(args, config)
        }
        Command::Simulate(args) => {
            let config = load_config(cli.config.as_ref())?;
            run_simulation(args, config)
        }
        Command::CreateConfig(args) => create_config_file(args),
    }
}
