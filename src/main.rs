//! `labelsync` command line.
//!
//! ```bash
//! labelsync [--config-dir <dir>] run [--env <name>]
//! labelsync schema create [--env <name>]
//! labelsync schema drop --yes [--env <name>]
//! ```
//!
//! Settings are read from `<config-dir>/<env>.yml`. `RUST_LOG` overrides the
//! log level configured there.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use labelsync::{init_tracing, Database, Runner, Settings};

/// Sync DLP policy matches into file classification labels
#[derive(Parser)]
#[command(name = "labelsync")]
#[command(version)]
struct Cli {
    /// Directory holding `<env>.yml` settings files
    #[arg(long, global = true, env = "LABELSYNC_CONFIG_DIR", default_value = "configuration")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sync loop until interrupted
    Run(EnvArgs),
    /// Manage the sync database schema
    #[command(subcommand)]
    Schema(SchemaCommand),
}

#[derive(Subcommand)]
enum SchemaCommand {
    /// Create the tables if they do not exist
    Create(EnvArgs),
    /// Drop every table, losing all sync state
    Drop {
        #[command(flatten)]
        env: EnvArgs,
        /// Confirm the drop
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Args)]
struct EnvArgs {
    /// Settings environment name
    #[arg(long, default_value = "dev_local")]
    env: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => {
            let settings = load_settings(&cli.config_dir, &args.env)?;
            let config = settings.to_config()?;
            tracing::info!(env = %args.env, mappings = config.mappings().len(), "starting labelsync");

            let mut runner = Runner::connect(config).await?;
            runner.run_until_ctrl_c().await
        }
        Command::Schema(SchemaCommand::Create(args)) => {
            let settings = load_settings(&cli.config_dir, &args.env)?;
            let url = settings.database_url()?;
            let database = Database::connect(&url)
                .await
                .with_context(|| format!("failed to open sync database {url}"))?;
            database.close().await;
            tracing::info!(env = %args.env, "sync schema created");
            Ok(())
        }
        Command::Schema(SchemaCommand::Drop { env, yes }) => {
            if !yes {
                bail!("refusing to drop the sync schema without --yes");
            }
            let settings = load_settings(&cli.config_dir, &env.env)?;
            let url = settings.database_url()?;
            let database = Database::connect(&url)
                .await
                .with_context(|| format!("failed to open sync database {url}"))?;
            database.drop_schema().await?;
            database.close().await;
            tracing::warn!(env = %env.env, "sync schema dropped");
            Ok(())
        }
    }
}

fn load_settings(config_dir: &std::path::Path, env: &str) -> Result<Settings> {
    let settings = Settings::load(config_dir, env)?;
    init_tracing(settings.log_directive());
    Ok(settings)
}
