use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use swipe_sync::{LoopOptions, RunMode, TransferMode};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "swipe-cli")]
#[command(about = "Move submitted mapping results from the realtime store into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Keep transferring until stopped or a fatal error occurs.
    #[arg(long = "loop", requires = "sleep_time")]
    run_loop: bool,

    /// Seconds to wait between iterations in loop mode.
    #[arg(long = "sleep_time", value_name = "SECONDS")]
    sleep_time: Option<u64>,

    /// Stop after this many iterations in loop mode.
    #[arg(long = "max_iterations", value_name = "N")]
    max_iterations: Option<u64>,

    /// `transaction` (default) or `per-record`; overrides TRANSFER_MODE.
    #[arg(long)]
    mode: Option<TransferMode>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Transfer pending results (default).
    Transfer,
    /// Apply database migrations.
    Migrate,
}

impl Cli {
    fn run_mode(&self) -> RunMode {
        if self.run_loop {
            RunMode::Continuous(LoopOptions {
                sleep: Duration::from_secs(self.sleep_time.unwrap_or_default()),
                max_iterations: self.max_iterations,
            })
        } else {
            RunMode::Once
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.as_ref().unwrap_or(&Commands::Transfer) {
        Commands::Transfer => {
            let report = swipe_sync::run_transfer_from_env(cli.mode, cli.run_mode()).await?;
            info!(
                iterations = report.iterations,
                failures = report.failures,
                inserted = report.rows_inserted,
                "transfer finished"
            );
            println!(
                "transfer complete: iterations={} failures={} inserted={}",
                report.iterations, report.failures, report.rows_inserted
            );
        }
        Commands::Migrate => {
            swipe_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn loop_requires_sleep_time() {
        let err = Cli::try_parse_from(["swipe-cli", "--loop"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn loop_flags_build_continuous_mode() {
        let cli = Cli::try_parse_from([
            "swipe-cli",
            "--loop",
            "--sleep_time",
            "30",
            "--max_iterations",
            "4",
            "--mode",
            "per-record",
        ])
        .unwrap();
        assert_eq!(cli.mode, Some(TransferMode::PerRecord));
        match cli.run_mode() {
            RunMode::Continuous(options) => {
                assert_eq!(options.sleep, Duration::from_secs(30));
                assert_eq!(options.max_iterations, Some(4));
            }
            RunMode::Once => panic!("expected loop mode"),
        }
    }

    #[test]
    fn defaults_to_a_single_transfer() {
        let cli = Cli::try_parse_from(["swipe-cli"]).unwrap();
        assert!(cli.command.is_none());
        assert!(matches!(cli.run_mode(), RunMode::Once));

        let cli = Cli::try_parse_from(["swipe-cli", "migrate"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Migrate)));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(Cli::try_parse_from(["swipe-cli", "--mode", "bulk"]).is_err());
    }
}
