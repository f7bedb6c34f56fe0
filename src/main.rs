use anyhow::Result;
use chunkpress::config::{Config, DatasetConfig, StoreConfig};
use chunkpress::{build_runtime, run_pipeline, RunState};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chunkpress")]
#[command(about = "Compress dataset chunks through a staged object-store pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline
    Run {
        /// Path to the configuration file (YAML or JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Override the configured chunk count
        #[arg(long)]
        num_chunks: Option<u64>,

        /// Save the per-chunk timing log to this path after the run
        #[arg(long)]
        timings_output: Option<String>,
    },
    /// Validate a configuration file without running
    Validate {
        /// Path to the configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Write a sample configuration file
    GenerateConfig {
        /// Output path for the sample configuration
        #[arg(short, long, default_value = "chunkpress.yaml")]
        output: PathBuf,
    },
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn sample_config() -> Config {
    Config {
        dataset: DatasetConfig {
            prefix: "sample.txt".to_string(),
            num_chunks: 1166,
            key_suffix: String::new(),
        },
        store: StoreConfig {
            bucket: Some("succinct-datasets".to_string()),
            region: Some("us-east-2".to_string()),
            endpoint_url: None,
            anonymous: false,
            local_path: None,
        },
        codec: Default::default(),
        pipeline: Default::default(),
    }
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            num_chunks,
            timings_output,
        } => {
            let mut config = Config::from_file(&config)?;
            if let Some(n) = num_chunks {
                config.dataset.num_chunks = n;
            }
            if let Some(path) = timings_output {
                config.pipeline.timings_output_path = Some(path);
            }
            config.validate()?;

            let runtime = build_runtime(config.pipeline.worker_threads)?;
            let report = runtime.block_on(run_pipeline(config))?;
            if report.state == RunState::Failed {
                match &report.failure {
                    Some(failure) => anyhow::bail!(
                        "pipeline failed in {} stage at chunk {}: {}",
                        failure.stage,
                        failure.chunk,
                        failure.message
                    ),
                    None => anyhow::bail!("pipeline failed"),
                }
            }
            Ok(())
        }
        Commands::Validate { config } => {
            let parsed = Config::from_file(&config)?;
            parsed.validate()?;
            println!("Configuration is valid");
            println!(
                "  dataset: {} ({} chunks)",
                parsed.dataset.prefix, parsed.dataset.num_chunks
            );
            println!("  store:   {}", parsed.store.location_display());
            Ok(())
        }
        Commands::GenerateConfig { output } => {
            let yaml = sample_config().to_yaml()?;
            std::fs::write(&output, yaml)?;
            println!("Sample configuration written to {}", output.display());
            Ok(())
        }
    }
}
