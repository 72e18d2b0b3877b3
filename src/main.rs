//! # AnomalyX CLI (`anomalyx`)
//!
//! Runs the anomaly detection pipeline, TF-IDF retrieval, and InfluxDB
//! ingestion from the command line, and starts the three HTTP services.
//!
//! ## Usage
//!
//! ```bash
//! anomalyx --config ./config/anomalyx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `anomalyx preprocess <csv>` | Resample a flow CSV, print its range and head |
//! | `anomalyx detect <csv>` | Detect anomalies and print the analysis |
//! | `anomalyx retrieve <csv> "<question>"` | Show the rows a question retrieves |
//! | `anomalyx ingest <csv>` | Write a feature CSV to InfluxDB |
//! | `anomalyx serve anomaly\|ask\|assistant` | Start an HTTP service |
//!
//! Secrets come from the environment (a `.env` file is loaded if present):
//! `NIXTLA_API_KEY`, `GEMINI_API_KEY`, `INFLUXDB_TOKEN`. Log verbosity is
//! controlled by `RUST_LOG`.

use anomalyx::{ask, config, detector, influx, nixtla, server};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// AnomalyX — network traffic anomaly detection and dataset chat.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means built-in defaults.
#[derive(Parser)]
#[command(
    name = "anomalyx",
    about = "AnomalyX — network traffic anomaly detection and dataset chat",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/anomalyx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Column, frequency, and level overrides shared by `detect` and
/// `preprocess`.
#[derive(clap::Args)]
struct SeriesArgs {
    /// Column holding Unix-second timestamps (default from `[preprocess]`).
    #[arg(long)]
    timestamp_col: Option<String>,

    /// Column holding the traffic value (default from `[preprocess]`).
    #[arg(long)]
    value_col: Option<String>,

    /// Resampling frequency, e.g. `1min`, `30s`, `1h`.
    #[arg(long)]
    freq: Option<String>,

    /// Prediction interval level in [1, 99] (default from `[anomaly]`).
    #[arg(long)]
    level: Option<u8>,
}

impl SeriesArgs {
    fn params(self, cfg: &config::Config) -> anyhow::Result<detector::PipelineParams> {
        detector::PipelineParams::from_config(
            cfg,
            self.timestamp_col,
            self.value_col,
            self.freq,
            self.level,
        )
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Resample a flow CSV and print the resulting time range.
    Preprocess {
        /// Path to the CSV file.
        path: PathBuf,

        #[command(flatten)]
        series: SeriesArgs,
    },

    /// Detect anomalies in a flow CSV.
    ///
    /// Requires `NIXTLA_API_KEY`.
    Detect {
        /// Path to the CSV file.
        path: PathBuf,

        #[command(flatten)]
        series: SeriesArgs,

        /// Write the anomalous points to this CSV file.
        #[arg(long)]
        export: Option<PathBuf>,

        /// Write the anomaly chart (SVG) to this file.
        #[arg(long)]
        plot: Option<PathBuf>,
    },

    /// Show the rows TF-IDF retrieval selects for a question.
    Retrieve {
        /// Path to the CSV file.
        path: PathBuf,

        /// The question to match rows against.
        question: String,

        /// Number of rows to retrieve (default `[chat].top_n`).
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Write a feature CSV to InfluxDB.
    ///
    /// Requires `[influxdb].url`, `[influxdb].org`, and `INFLUXDB_TOKEN`
    /// unless `--dry-run` is given.
    Ingest {
        /// Path to the CSV file.
        path: PathBuf,

        /// Build the points and print a sample without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Start an HTTP service.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },
}

#[derive(Subcommand)]
enum ServeService {
    /// Anomaly detection service (`[server].anomaly_bind`).
    Anomaly,
    /// Question answering with the hosted model (`[server].ask_bind`).
    Ask,
    /// Security assistant with the local model (`[server].assistant_bind`).
    Assistant,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "anomalyx=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Preprocess { path, series } => {
            let params = series.params(&cfg)?;
            detector::run_preprocess(&path, &params)?;
        }
        Commands::Detect {
            path,
            series,
            export,
            plot,
        } => {
            let params = series.params(&cfg)?;
            let client = nixtla::NixtlaClient::new(&cfg.anomaly)?;
            detector::run_detect(&client, &path, &params, export.as_deref(), plot.as_deref())
                .await?;
        }
        Commands::Retrieve {
            path,
            question,
            top_k,
        } => {
            let top_n = top_k.unwrap_or(cfg.chat.top_n);
            ask::run_retrieve(&path, &question, top_n, cfg.chat.max_rows)?;
        }
        Commands::Ingest { path, dry_run } => {
            influx::run_ingest(&cfg, &path, dry_run).await?;
        }
        Commands::Serve { service } => {
            let service = match service {
                ServeService::Anomaly => server::Service::Anomaly,
                ServeService::Ask => server::Service::Ask,
                ServeService::Assistant => server::Service::Assistant,
            };
            server::run_server(&cfg, service).await?;
        }
    }

    Ok(())
}
