//! `toolgate check`: evaluate a target against the policy. Nothing is
//! executed, written or fetched.

use std::path::Path;

use clap::Subcommand;

use toolgate_security::{CommandValidator, PathAccess, PathGuard, UrlGuard};

#[derive(Subcommand)]
pub enum CheckTarget {
    /// Validate a command line against the allowlist
    Command {
        /// The full command line, quoted
        line: String,
    },
    /// Resolve a path and check it against the allowed roots
    Path {
        path: String,
        /// Check for writing (the target may not exist yet)
        #[arg(long)]
        write: bool,
    },
    /// Check a URL against the endpoint policy
    Url { url: String },
}

/// Print the verdict; exits with status 1 on denial.
pub async fn run(config_path: Option<&Path>, target: CheckTarget) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;

    let verdict: Result<String, String> = match target {
        CheckTarget::Command { line } => CommandValidator::new(&config.commands.allowed)
            .validate(&line)
            .map(|cmd| format!("{} {:?}", cmd.verb, cmd.args))
            .map_err(|e| e.to_string()),
        CheckTarget::Path { path, write } => {
            let access = if write { PathAccess::Write } else { PathAccess::Read };
            PathGuard::new(&config.paths.allowed_roots, &config.paths.forbidden_paths)
                .validate(&path, access)
                .map(|resolved| resolved.display().to_string())
                .map_err(|e| e.to_string())
        }
        CheckTarget::Url { url } => UrlGuard::new(
            config.fetch.allowed_endpoints.clone(),
            config.fetch.blocked_hosts.clone(),
            config.fetch.resolve_dns,
        )
        .validate_resolved(&url)
        .await
        .map(|parsed| parsed.to_string())
        .map_err(|e| e.to_string()),
    };

    match verdict {
        Ok(resolved) => {
            println!("✅ allowed: {resolved}");
            Ok(())
        }
        Err(reason) => {
            println!("⛔ denied: {reason}");
            std::process::exit(1);
        }
    }
}
