use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cohortnet_engine::SubmitOutcome;
use cohortnet_node::{
    config::{load_config, Config, ConfigFormat, LogFormat},
    service::{NodeService, ObserverView},
};
use cohortnet_telemetry::TelemetryHandle;
use color_eyre::{eyre::eyre, Result};
use tracing_subscriber::EnvFilter;

#[cfg(any(
    all(feature = "dev", feature = "test"),
    all(feature = "dev", feature = "prod"),
    all(feature = "test", feature = "prod")
))]
compile_error!(
    "Only one of the `dev`, `test`, or `prod` features may be enabled for cohortnet-node."
);

#[derive(Debug, Parser)]
#[command(
    name = "cohortnet-node",
    version,
    about = "Reference node that buffers symptom reports into privacy-preserving cohorts"
)]
struct Cli {
    /// Path to configuration file (TOML or YAML). Built-in defaults apply when absent.
    #[arg(long, env = "COHORTNET_CONFIG")]
    config: Option<PathBuf>,
    /// Explicit configuration format override.
    #[arg(long, value_enum, default_value_t = ConfigFormat::Auto)]
    config_format: ConfigFormat,
    /// Override the data directory defined in the config file.
    #[arg(long, env = "COHORTNET_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Override the cohort threshold defined in the config file.
    #[arg(long)]
    threshold: Option<usize>,
    /// Override the privacy budget defined in the config file.
    #[arg(long)]
    epsilon: Option<f64>,
    /// Log output format.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Contribute one symptom selection.
    Submit {
        /// Comma separated categories, e.g. `respiratory,systemic`. Empty reports none.
        #[arg(long, value_delimiter = ',')]
        symptoms: Vec<String>,
        /// Raw geohash; only the configured prefix is kept.
        #[arg(long)]
        location: Option<String>,
    },
    /// Feed synthetic contributors through the engine.
    Simulate {
        #[arg(long, default_value_t = 25)]
        count: usize,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Print the latest cohort and the intensity timeline.
    Observe {
        #[arg(long)]
        json: bool,
    },
    /// Recompute the integrity token of every stored snapshot.
    Verify,
    /// Retry unstored snapshots and print the telemetry snapshot.
    Flush,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => load_config(path, cli.config_format)?,
        None => Config::sample(),
    };
    if let Some(dir) = cli.data_dir.clone() {
        config.node.data_dir = dir;
    }
    if let Some(threshold) = cli.threshold {
        config.engine.cohort.cohort_threshold = threshold;
    }
    if let Some(epsilon) = cli.epsilon {
        config.engine.cohort.epsilon = epsilon;
    }
    if let Some(format) = cli.log_format {
        config.node.log_format = format;
    }
    config.validate()?;
    init_tracing(config.node.log_format);

    let telemetry = TelemetryHandle::from_config(config.telemetry.clone());
    let service = NodeService::open(&config, telemetry.clone())?;
    let outcome = run(&service, cli.command);
    let shutdown = service.shutdown();
    outcome?;

    let shutdown = shutdown?;
    println!(
        "checkpointed {} pending contributor(s), {} snapshot(s) left unstored",
        shutdown.checkpointed, shutdown.unstored
    );
    println!("telemetry {}", telemetry.flush().to_json()?);
    Ok(())
}

fn run(service: &NodeService, command: Command) -> Result<()> {
    match command {
        Command::Submit { symptoms, location } => {
            match service.submit(&symptoms, location.as_deref())? {
                SubmitOutcome::Buffered { pending, threshold } => {
                    println!("buffered: {pending}/{threshold} contributors in the open cohort");
                }
                SubmitOutcome::Sealed(id) => println!("sealed cohort {id}"),
            }
        }
        Command::Simulate { count, seed } => {
            let report = service.simulate(count, seed)?;
            println!(
                "submitted={} sealed={} pending={}",
                report.submitted,
                report.sealed.len(),
                report.pending
            );
            for id in &report.sealed {
                println!("  {id}");
            }
        }
        Command::Observe { json } => {
            let view = service.observe()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_view(&view);
            }
        }
        Command::Verify => {
            let report = service.verify()?;
            println!(
                "verified={} failed={}",
                report.verified,
                report.failures.len()
            );
            for failure in &report.failures {
                println!("  {failure}");
            }
            if !report.is_clean() {
                return Err(eyre!("{} snapshot(s) failed verification", report.failures.len()));
            }
        }
        Command::Flush => {
            let stored = service.flush();
            println!("stored {stored} queued snapshot(s)");
        }
    }
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn print_view(view: &ObserverView) {
    println!("cohorts={} pending={}", view.cohorts, view.pending);
    match &view.latest {
        Some(latest) => {
            println!(
                "latest {} size={} eps={} noise_scale={:.4} anonymity_set={}",
                latest.id,
                latest.size,
                latest.metrics.epsilon,
                latest.metrics.noise_scale,
                latest.metrics.anonymity_set
            );
            for (category, score) in &latest.scores {
                println!("  {category:<16} {score:.3}");
            }
            println!("  token {}", latest.integrity_token);
        }
        None => println!("no cohort sealed yet"),
    }
    for row in &view.timeline {
        println!("{}  {:.3}  {}", row.sealed_at, row.intensity, row.id);
    }
}
