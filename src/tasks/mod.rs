//! Built-in task types.

pub mod site_watch;

use crate::config::AppConfig;
use crate::error::RegistryError;
use crate::fetch::RetryingFetcher;
use crate::task::registry::TaskRegistry;

/// Registry with every built-in task type.
pub fn builtin_registry(config: &AppConfig) -> Result<TaskRegistry, RegistryError> {
    let fetcher = RetryingFetcher::with_client(config.fetch.clone());
    Ok(TaskRegistry::builder()
        .register(site_watch::registration(config.watch_urls.clone(), fetcher))?
        .build())
}
