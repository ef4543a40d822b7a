use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use errwatch::config::Config;
use errwatch::error::ConfigError;
use errwatch::events::Event;
use errwatch::Watchdog;
use log::{error, info, warn};
use serde_json::json;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

/// Command-line arguments for errwatch
#[derive(Parser)]
#[command(
    name = "errwatch",
    about = "Error aggregation and notification engine",
    long_about = "Groups application errors and log events by fingerprint, keeps rolling \
                  occurrence statistics and decides when a group deserves a notification."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        global = true,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        global = true,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read JSON-lines events from stdin and track them
    Ingest,
    /// Print aggregate statistics as JSON
    Stats,
    /// Print trending error groups as JSON
    Trending,
    /// Print one group with its analysis summary
    Summary {
        fingerprint: String,
        /// Also list up to this many similar groups
        #[arg(long, default_value_t = 5)]
        similar: usize,
    },
    /// Mark a group as resolved
    Resolve { fingerprint: String },
    /// Delete resolved groups older than the retention period
    Cleanup {
        /// Days to keep; defaults to retention.resolved_days
        #[arg(long)]
        days: Option<u32>,
    },
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// # Returns
    ///
    /// `Ok(())` if all arguments are valid, `Err(String)` with error message otherwise
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            // Missing files fall back to defaults in load_config
            if config_path.exists() {
                if !config_path.is_file() {
                    return Err(format!(
                        "Configuration path is not a file: {}",
                        config_path.display()
                    ));
                }

                if let Some(extension) = config_path.extension() {
                    if extension != "toml" {
                        warn!(
                            "Configuration file does not have .toml extension: {}",
                            config_path.display()
                        );
                    }
                }
            }
        }

        match &self.command {
            Command::Cleanup { days: Some(0) } => Err("--days must be at least 1".to_string()),
            Command::Summary { fingerprint, .. } | Command::Resolve { fingerprint }
                if fingerprint.trim().is_empty() =>
            {
                Err("fingerprint must not be empty".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Load configuration, falling back to defaults on any problem
fn load_config(config_path: Option<&PathBuf>) -> Config {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            match Config::from_file(path) {
                Ok(config) => config,
                Err(ConfigError::ReadError(_)) => {
                    warn!(
                        "Configuration file '{}' not found or unreadable, using defaults",
                        path.display()
                    );
                    Config::default()
                }
                Err(e) => {
                    error!("Configuration error in '{}': {}", path.display(), e);
                    warn!("Using default configuration due to invalid config file");
                    Config::default()
                }
            }
        }
        None => {
            info!("Using default configuration");
            Config::default()
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Stream events from stdin until EOF or Ctrl+C
async fn ingest(watchdog: &Watchdog) -> Result<()> {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        info!("Received interrupt signal (SIGINT), shutting down gracefully...");
        let _ = stop_tx.send(true);
    })
    .context("failed to install SIGINT handler")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0u64;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = stop_rx.changed() => break,
        };
        let Some(line) = line else { break };
        line_no += 1;

        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(&line) {
            Ok(event) => watchdog.ingest(event).await,
            Err(e) => warn!("Skipping line {}: invalid event: {}", line_no, e),
        }
    }

    let stats = watchdog.shutdown().await;
    print_json(&stats)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    if let Err(e) = cli.validate() {
        bail!("Invalid arguments: {}", e);
    }

    let mut config = load_config(cli.config.as_ref());
    if !matches!(cli.command, Command::Ingest) {
        // Query commands never enqueue events
        config.performance.async_enabled = false;
        if config.store.path.is_none() {
            warn!("No store.path configured; querying an empty in-memory store");
        }
    }

    let watchdog = Watchdog::from_config(config).context("failed to open the error store")?;

    match cli.command {
        Command::Ingest => ingest(&watchdog).await?,
        Command::Stats => print_json(&watchdog.statistics().await?)?,
        Command::Trending => print_json(&watchdog.trending().await?)?,
        Command::Summary {
            fingerprint,
            similar,
        } => match watchdog.summary(&fingerprint).await? {
            Some((group, summary)) => {
                let similar = watchdog.similar(&fingerprint, similar).await?;
                print_json(&json!({
                    "group": group,
                    "summary": summary,
                    "similar": similar,
                }))?;
            }
            None => bail!("No error group with fingerprint {}", fingerprint),
        },
        Command::Resolve { fingerprint } => {
            if watchdog.resolve(&fingerprint).await? {
                info!("Resolved {}", fingerprint);
            } else {
                bail!("No error group with fingerprint {}", fingerprint);
            }
        }
        Command::Cleanup { days } => {
            let deleted = watchdog.cleanup(days).await?;
            print_json(&json!({ "deleted": deleted }))?;
        }
    }

    if !watchdog.is_enabled() {
        info!("Tracking is disabled in the configuration");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(config: Option<PathBuf>, command: Command) -> Cli {
        Cli {
            config,
            verbose: false,
            command,
        }
    }

    #[test]
    fn test_cli_validation_with_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errwatch.toml");
        std::fs::write(&path, "enabled = true\n").unwrap();

        assert!(cli(Some(path), Command::Stats).validate().is_ok());
    }

    #[test]
    fn test_cli_validation_with_missing_file() {
        let cli = cli(Some(PathBuf::from("/nonexistent/config.toml")), Command::Stats);
        // Missing files fall back to defaults
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_cli_validation_with_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cli = cli(Some(dir.path().to_path_buf()), Command::Stats);
        assert!(cli.validate().unwrap_err().contains("not a file"));
    }

    #[test]
    fn test_cli_validation_of_arguments() {
        assert!(cli(None, Command::Cleanup { days: Some(0) }).validate().is_err());
        assert!(cli(None, Command::Cleanup { days: None }).validate().is_ok());
        assert!(cli(
            None,
            Command::Resolve {
                fingerprint: " ".to_string()
            }
        )
        .validate()
        .is_err());
    }

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["errwatch", "-v", "cleanup", "--days", "7"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Cleanup { days: Some(7) }));

        let cli = Cli::try_parse_from(["errwatch", "summary", "abc", "--config", "x.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert!(matches!(cli.command, Command::Summary { similar: 5, .. }));
    }

    #[test]
    fn test_load_config_fallbacks() {
        assert_eq!(load_config(None), Config::default());
        assert_eq!(
            load_config(Some(&PathBuf::from("/nonexistent/errwatch.toml"))),
            Config::default()
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[notification]\nmin_severity = 42\n").unwrap();
        assert_eq!(load_config(Some(&path)), Config::default());

        let path = dir.path().join("good.toml");
        std::fs::write(&path, "environment = \"staging\"\n").unwrap();
        assert_eq!(load_config(Some(&path)).environment, "staging");
    }
}
