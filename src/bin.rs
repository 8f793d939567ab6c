use clap::Parser;
use pretty_duration::pretty_duration;
use std::{path::PathBuf, process, time::Instant};
use survey2gpkg::{
    survey::{self, SurveyConfig, TrackAttributes},
    SurveyError,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Extract survey track lines and points from sonar and seismic files into a GeoPackage.
///
/// Reads GSF, Kongsberg raw, JSF, 7k, SEG-Y and SBD files anywhere below the input folder.
#[derive(Parser, Debug)]
#[command(name = "survey2gpkg-cli", version, long_about = None)]
struct Cli {
    /// The survey folder to scan.
    #[arg(short, long)]
    input: PathBuf,

    /// Output GeoPackage. Defaults to <input>/GIS/<folder name>_SSDM.gpkg.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Minimum seconds between track points.
    #[arg(short, long, default_value_t = 1.0)]
    step: f64,

    /// Worker threads, 0 uses every core.
    #[arg(long, default_value_t = 0)]
    cpu: usize,

    /// Ignore cached navigation and decode every file again.
    #[arg(short, long)]
    reprocess: bool,

    /// Coordinate system of the output tables.
    #[arg(long, default_value_t = 4326)]
    epsg: i32,

    /// JSON file with values for the track line attribute columns.
    #[arg(long)]
    attributes: Option<PathBuf>,

    /// Log level, unless RUST_LOG says otherwise.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn run(cli: Cli) -> Result<survey::SurveySummary, SurveyError> {
    let attributes = match &cli.attributes {
        Some(path) => TrackAttributes::from_json_file(path)?,
        None => TrackAttributes::default(),
    };
    let config = SurveyConfig {
        output: cli.output,
        step: cli.step,
        cpu: cli.cpu,
        reprocess: cli.reprocess,
        epsg: cli.epsg,
        attributes,
        ..SurveyConfig::new(cli.input)
    };
    survey::run(&config)
}

pub fn main() {
    let cli = Cli::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let start = Instant::now();
    match run(cli) {
        Ok(summary) => {
            for path in &summary.partial {
                println!("Partially read (file ended early): {}", path.display());
            }
            for (path, reason) in summary.skipped.iter().chain(&summary.tracks.failures) {
                eprintln!("Skipped {}: {reason}", path.display());
            }
            println!(
                "Completed {} files into {} ({} track lines, {} track points) in {}",
                summary.files,
                summary.output.display(),
                summary.tracks.lines,
                summary.tracks.points,
                pretty_duration(&start.elapsed(), None)
            );
        }
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
