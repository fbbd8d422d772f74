//! `toolgate config`: configuration management commands.

use std::path::Path;

use toolgate_config::SecurityConfig;

pub fn validate(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    let config = match super::load_config(path) {
        Ok(config) => config,
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    };
    println!("   ✅ Config parsed and validated");

    let mut warnings = Vec::new();
    if config.paths.allowed_roots.is_empty() {
        warnings.push("No allowed roots: every file operation will be denied".to_string());
    }
    if config.commands.allowed.is_empty() {
        warnings.push("No allowed commands: every command will be denied".to_string());
    }
    if !config.fetch.resolve_dns {
        warnings.push("fetch.resolve_dns is off: hostnames resolving to private addresses are not caught".to_string());
    }
    if config.fetch.allowed_endpoints.is_empty() {
        warnings.push("No endpoint allowlist: any public host may be fetched".to_string());
    }
    if !config.env.redact_high_entropy_values {
        warnings.push("High-entropy environment values are not redacted".to_string());
    }

    if warnings.is_empty() {
        println!("   ✅ All checks passed");
    } else {
        println!();
        for w in &warnings {
            println!("   ⚠️  {w}");
        }
    }

    println!();
    println!("   Commands:   {}", config.commands.allowed.len());
    println!("   Roots:      {}", config.paths.allowed_roots.join(", "));
    println!("   Forbidden:  {}", config.paths.forbidden_paths.len());
    println!("   Endpoints:  {}", config.fetch.allowed_endpoints.len());
    println!(
        "   Rate limit: {} tokens, {}/s refill (default)",
        config.rate_limits.default.capacity, config.rate_limits.default.refill_per_second
    );
    println!("   Cache TTL:  {}s (default)", config.cache.default_ttl_secs);
    println!("   Audit log:  {}", config.audit.dir.join(&config.audit.file_name).display());

    Ok(())
}

pub fn show(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(path).map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub fn path() {
    let config_path = std::env::var("TOOLGATE_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| SecurityConfig::config_dir().join("config.toml"));
    println!("{}", config_path.display());
}

pub fn print_default() {
    println!("{}", SecurityConfig::default_toml());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_is_valid() {
        let path = SecurityConfig::config_dir().join("config.toml");
        assert!(path.to_str().unwrap().contains("config.toml"));
    }

    #[test]
    fn validate_rejects_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.toml");
        std::fs::write(&file, "[cache]\nmax_entries = 0\n").unwrap();
        assert!(validate(Some(&file)).is_err());
    }

    #[test]
    fn show_renders_loaded_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.toml");
        std::fs::write(&file, SecurityConfig::default_toml()).unwrap();
        assert!(show(Some(&file)).is_ok());
    }
}
