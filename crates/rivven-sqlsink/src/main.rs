//! rivven-sqlsink - write newline-delimited JSON records to a SQL database
//!
//! # Usage
//!
//! ```bash
//! # Read records from stdin until EOF or Ctrl+C
//! producer | rivven-sqlsink -c sqlsink.yaml
//!
//! # Read records from a file
//! rivven-sqlsink -c sqlsink.yaml run --input events.ndjson
//!
//! # Validate configuration
//! rivven-sqlsink -c sqlsink.yaml validate
//!
//! # Print the configuration schema
//! rivven-sqlsink schema --format yaml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::Stream;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rivven_sqlsink::config::SqlSinkConfig;
use rivven_sqlsink::types::Record;
use rivven_sqlsink::SqlSink;

#[derive(Parser)]
#[command(name = "rivven-sqlsink")]
#[command(version, about = "Resilient batch writer for SQL databases")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "sqlsink.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write records until the input ends (default)
    Run {
        /// Newline-delimited JSON file to read instead of stdin
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate,
    /// Show the configuration schema
    Schema {
        /// Output format (json, yaml)
        #[arg(long, default_value = "json")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(Commands::Schema { format }) = &cli.command {
        return show_schema(format);
    }

    let config = SqlSinkConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run { input: None }) {
        Commands::Run { input } => run(config, input.as_deref()).await,
        Commands::Validate => validate_config(&config),
        Commands::Schema { .. } => unreachable!(), // handled above
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout may carry the final stats, logs go to stderr
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

async fn run(config: SqlSinkConfig, input: Option<&Path>) -> Result<()> {
    config.check().context("Invalid configuration")?;
    let sink = SqlSink::from_config(&config).context("Failed to start SQL sink")?;

    let stop = sink.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal (Ctrl+C)");
            stop.cancel();
        }
    });

    let stats = match input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            sink.run(records(BufReader::new(file))).await
        }
        None => sink.run(records(BufReader::new(tokio::io::stdin()))).await,
    };

    sink.close().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Parse one record per non-blank line. Lines that are not JSON objects are skipped.
fn records<R>(reader: R) -> impl Stream<Item = Record> + Send
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    futures::stream::unfold((reader.lines(), 0u64), |(mut lines, mut line_no)| async move {
        loop {
            line_no += 1;
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match Record::from_json_str(&line) {
                    Ok(record) => return Some((record, (lines, line_no))),
                    Err(e) => warn!(line = line_no, error = %e, "Skipping unreadable record"),
                },
                Ok(None) => return None,
                Err(e) => {
                    warn!(line = line_no, error = %e, "Failed to read input, stopping");
                    return None;
                }
            }
        }
    })
}

fn validate_config(config: &SqlSinkConfig) -> Result<()> {
    config.check().context("Invalid configuration")?;
    let template = config.template()?;
    let policy = config.retry_policy()?;

    println!("Configuration is valid");
    println!("  driver:           {}", config.driver()?);
    println!("  statement:        {}", template.sql());
    println!("  parameters:       {}", template.fields().join(", "));
    println!("  unsafe statement: {}", config.unsafe_statement);
    println!("  flush size:       {}", config.flush_size);
    println!("  max pool size:    {}", config.max_pool_size);
    println!(
        "  retry:            {:?} .. {:?}, max flush exceptions {}",
        policy.initial_interval, policy.max_interval, policy.max_flush_exceptions
    );
    Ok(())
}

fn show_schema(format: &str) -> Result<()> {
    let schema = SqlSinkConfig::json_schema();
    match format {
        "yaml" => println!("{}", serde_yaml::to_string(&schema)?),
        _ => println!("{}", serde_json::to_string_pretty(&schema)?),
    }
    Ok(())
}
