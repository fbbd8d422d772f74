//! `toolgate audit`: search and summarize the audit trail.

use std::path::Path;

use chrono::{DateTime, Utc};
use clap::Subcommand;

use toolgate_security::{AuditCategory, AuditLog, AuditQuery, AuditResult, Severity};

#[derive(Subcommand)]
pub enum AuditAction {
    /// Print matching events as JSON lines, oldest first
    Search {
        #[arg(long)]
        category: Option<AuditCategory>,
        #[arg(long)]
        user: Option<String>,
        /// Substring of the resource
        #[arg(long)]
        resource: Option<String>,
        #[arg(long)]
        result: Option<AuditResult>,
        #[arg(long)]
        severity: Option<Severity>,
        /// RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// RFC 3339 timestamp
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },
    /// Aggregate the trailing window
    Summary {
        #[arg(long, default_value_t = 24)]
        hours: i64,
        /// How many recent failures to include
        #[arg(long, default_value_t = 10)]
        failures: usize,
    },
}

pub fn run(config_path: Option<&Path>, action: AuditAction) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;
    let log = AuditLog::open(&config.audit)?;

    match action {
        AuditAction::Search {
            category,
            user,
            resource,
            result,
            severity,
            since,
            until,
            limit,
        } => {
            let query = AuditQuery {
                category,
                user,
                resource_contains: resource,
                result,
                severity,
                since,
                until,
                limit,
            };
            for event in log.search(&query)? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        AuditAction::Summary { hours, failures } => {
            let summary = log.summarize(chrono::Duration::hours(hours), failures)?;
            println!("📋 Audit Summary");
            println!("─────────────────────────────────────");
            println!("  Window:  {} .. {}", summary.window_start.to_rfc3339(), summary.window_end.to_rfc3339());
            println!("  Events:  {}", summary.total);
            print_counts("By category", &summary.by_category);
            print_counts("By result", &summary.by_result);
            print_counts("By severity", &summary.by_severity);
            print_counts("By user", &summary.by_user);

            if !summary.recent_failures.is_empty() {
                println!();
                println!("  Recent failures:");
                for event in &summary.recent_failures {
                    println!(
                        "    {} [{}] {} {} {}",
                        event.timestamp.to_rfc3339(),
                        event.severity.as_str(),
                        event.category,
                        event.action,
                        event.resource
                    );
                }
            }
        }
    }

    Ok(())
}

fn print_counts(title: &str, counts: &std::collections::BTreeMap<String, usize>) {
    if counts.is_empty() {
        return;
    }
    println!();
    println!("  {title}:");
    for (name, count) in counts {
        println!("    {name:<16} {count:>6}");
    }
}
