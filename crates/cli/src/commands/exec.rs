//! `toolgate exec`: run one operation through the gateway and print the
//! response as JSON.

use std::path::Path;
use std::time::Duration;

use clap::Args;
use serde_json::Value;

use toolgate_core::{OperationKind, OperationRequest};
use toolgate_gateway::Gateway;

#[derive(Args)]
pub struct ExecArgs {
    /// Operation kind: command, file_read, file_write or fetch
    pub kind: OperationKind,

    /// Command line, path or URL
    pub target: String,

    /// Extra argument as KEY=VALUE; VALUE is parsed as JSON when it can be
    #[arg(short = 'a', long = "arg", value_name = "KEY=VALUE", value_parser = parse_arg)]
    pub args: Vec<(String, Value)>,

    /// Timeout in seconds (0 = configured default)
    #[arg(short, long, default_value_t = 0)]
    pub timeout: u64,

    /// Caller identity recorded in the audit trail
    #[arg(short, long)]
    pub user: Option<String>,
}

fn parse_arg(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Prints the response; exits with status 1 unless the operation completed.
pub async fn run(config_path: Option<&Path>, args: ExecArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;
    let gateway = Gateway::new(config)?;

    let mut request = OperationRequest::new(args.kind, args.target)
        .with_args(args.args.into_iter().collect())
        .with_timeout(Duration::from_secs(args.timeout));
    if let Some(user) = args.user {
        request = request.with_user(user);
    }

    let response = gateway.submit(request).await;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if !response.outcome.is_completed() {
        std::process::exit(1);
    }
    Ok(())
}
