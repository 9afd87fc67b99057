//! Uplink CLI: sensor agent, pipeline server, and queue tooling.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use uplink::config::{SensorConfig, ServerConfig};
use uplink::error::Error;
use uplink::{sensor, server};

/// Sensor-to-server measurement delivery pipeline
#[derive(Parser)]
#[command(name = "uplink")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sensor agent
    Sensor {
        /// Path to the sensor config YAML
        #[arg(long)]
        config: PathBuf,
    },

    /// Run the pipeline server (control + ingest + stream)
    Server {
        /// Path to the server config YAML
        #[arg(long)]
        config: PathBuf,
    },

    /// Chunk a payload file and append it to the sensor queue
    Enqueue {
        /// Path to the sensor config YAML
        #[arg(long)]
        config: PathBuf,

        /// Payload file to enqueue
        #[arg(long)]
        file: PathBuf,

        /// Chunk attributes as key=value pairs
        #[arg(long = "attr", value_parser = parse_attr)]
        attrs: Vec<(String, String)>,
    },

    /// Show sensor queue depth, oldest age, and last sequence
    Status {
        /// Path to the sensor config YAML
        #[arg(long)]
        config: PathBuf,
    },
}

fn parse_attr(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw}"))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sensor { config } => {
            let config = SensorConfig::load(&config)?;
            sensor::run(config).await?;
        }
        Commands::Server { config } => {
            let config = ServerConfig::load(&config)?;
            server::run(config).await?;
        }
        Commands::Enqueue { config, file, attrs } => {
            let config = SensorConfig::load(&config)?;
            let attributes: HashMap<String, String> = attrs.into_iter().collect();
            let sequences = sensor::enqueue_payload(&config, &file, attributes)?;
            println!(
                "enqueued {} chunk(s), sequences {:?}",
                sequences.len(),
                sequences
            );
        }
        Commands::Status { config } => {
            let config = SensorConfig::load(&config)?;
            let status = sensor::queue_status(&config)?;
            println!("queue depth:    {}", status.depth);
            println!("oldest age:     {:.1}s", status.oldest_age_seconds);
            println!("last sequence:  {}", status.last_sequence);
        }
    }

    Ok(())
}
