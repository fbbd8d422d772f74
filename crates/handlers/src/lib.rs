//! Operation handlers for toolgate.
//!
//! One handler per operation kind. Each runs its guards in `admit` and
//! performs the side effect in `execute`:
//! - **command**: allowlisted verb, spawned without a shell
//! - **file_read** / **file_write**: paths confined by the path guard
//! - **fetch**: outbound HTTP behind the URL guard and a [`Fetcher`]

pub mod command;
pub mod fetch;
pub mod file_read;
pub mod file_write;

use std::sync::Arc;

use toolgate_config::SecurityConfig;
use toolgate_core::HandlerRegistry;
use toolgate_security::PathGuard;

pub use command::CommandHandler;
pub use fetch::{FetchHandler, FetchRequest, FetchResponse, Fetcher, ReqwestFetcher};
pub use file_read::FileReadHandler;
pub use file_write::{FileWriteHandler, WriteMode};

/// Build a registry with all four handlers configured from `config`.
///
/// The path guard is resolved once and shared by the command and file
/// handlers.
pub fn default_registry(config: &SecurityConfig, fetcher: Arc<dyn Fetcher>) -> HandlerRegistry {
    let paths = PathGuard::new(&config.paths.allowed_roots, &config.paths.forbidden_paths);

    let mut registry = HandlerRegistry::new();
    registry.register(Box::new(CommandHandler::new(config, paths.clone())));
    registry.register(Box::new(FileReadHandler::new(
        paths.clone(),
        config.limits.max_file_bytes,
    )));
    registry.register(Box::new(FileWriteHandler::new(
        paths,
        config.limits.max_file_bytes,
    )));
    registry.register(Box::new(FetchHandler::new(config, fetcher)));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolgate_core::OperationKind;

    #[test]
    fn default_registry_serves_every_kind() {
        let config = SecurityConfig::default();
        let fetcher = Arc::new(ReqwestFetcher::new(&config.fetch).unwrap());
        let registry = default_registry(&config, fetcher);
        assert_eq!(registry.kinds(), OperationKind::ALL.to_vec());
    }
}
