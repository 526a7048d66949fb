use clap::{Parser, ValueEnum};
use rawload::orchestrator::LoadGenerator;
use rawload::settings::{self, RawSettings};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

/// Values are taken as text; anything unparsable falls back to its default.
#[derive(Parser)]
#[command(name = "rawload", about = "Raw-socket HTTP load generator")]
struct Args {
    /// Number of worker threads, one connection each (default 4)
    #[arg(short = 't', long)]
    threads: Option<String>,

    /// How long to run, in seconds (default 30)
    #[arg(short = 'd', long)]
    duration: Option<String>,

    /// Target URI (default http://localhost:5000/json)
    #[arg(short = 'u', long)]
    uri: Option<String>,

    /// Number of workers whose latencies are recorded (default 32, at most --threads)
    #[arg(short = 'm', long)]
    measured: Option<String>,

    /// Initial capacity of each measured worker's sample storage (default 300000)
    #[arg(short = 'c', long)]
    capacity: Option<String>,

    /// Report format
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_target(true).with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.log_json);

    let config = settings::resolve(&RawSettings {
        threads: args.threads,
        duration: args.duration,
        uri: args.uri,
        measured: args.measured,
        capacity: args.capacity,
    });

    println!("{:<20}{}", "Thread count: ", config.thread_count);
    println!("{:<20}{:.1} s", "Duration: ", config.duration.as_secs_f64());
    println!("{:<20}{}", "Uri: ", config.target);
    println!();

    let outcome = LoadGenerator::new(config).run();

    match args.format {
        Format::Text => println!("{}", outcome.report),
        Format::Json => println!("{}", outcome.report.to_json()?),
    }
    Ok(())
}
