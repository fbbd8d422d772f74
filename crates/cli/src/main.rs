//! toolgate CLI: operator entry point.
//!
//! Commands:
//! - `check`   : dry-run a command line, path or URL against the policy
//! - `exec`    : run one operation through the gateway
//! - `audit`   : search or summarize the audit trail
//! - `config`  : show, validate or locate the configuration
//! - `env`     : show what a child process would inherit

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "toolgate",
    about = "toolgate: policy-enforcement gateway for agent tool calls",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to $TOOLGATE_CONFIG or ~/.toolgate/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a target against the policy without executing anything
    Check {
        #[command(subcommand)]
        target: commands::check::CheckTarget,
    },

    /// Execute one operation through the gateway
    Exec(commands::exec::ExecArgs),

    /// Inspect the audit trail
    Audit {
        #[command(subcommand)]
        action: commands::audit::AuditAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show the filtered environment passed to child processes
    Env {
        /// Also list the names of dropped variables
        #[arg(long)]
        dropped: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the configuration
    Validate,
    /// Print the default config file path
    Path,
    /// Print the default configuration
    Default,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output.
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Check { target } => commands::check::run(config_path, target).await?,
        Commands::Exec(args) => commands::exec::run(config_path, args).await?,
        Commands::Audit { action } => commands::audit::run(config_path, action)?,
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(config_path)?,
            ConfigAction::Validate => commands::config_cmd::validate(config_path)?,
            ConfigAction::Path => commands::config_cmd::path(),
            ConfigAction::Default => commands::config_cmd::print_default(),
        },
        Commands::Env { dropped } => commands::env::run(config_path, dropped)?,
    }

    Ok(())
}
