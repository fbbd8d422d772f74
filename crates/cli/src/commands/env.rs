//! `toolgate env`: show the environment a spawned command would see.

use std::path::Path;

use toolgate_security::EnvFilter;

pub fn run(config_path: Option<&Path>, show_dropped: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;
    let filter = EnvFilter::new(&config.env);

    for (key, value) in filter.filtered() {
        println!("{key}={value}");
    }

    if show_dropped {
        // Names only; dropped values never leave the process.
        let mut dropped: Vec<(String, String)> = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .filter_map(|(k, v)| filter.classify(&k, &v).map(|reason| (k, format!("{reason:?}"))))
            .collect();
        dropped.sort();
        eprintln!();
        eprintln!("Dropped {} variable(s):", dropped.len());
        for (key, reason) in dropped {
            eprintln!("  {key:<32} {reason}");
        }
    }

    Ok(())
}
