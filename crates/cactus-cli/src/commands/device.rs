//! Device commands - identity and registration via the utility library

use anyhow::{Context, Result};
use cactus_bridge::{LibraryLoader, UtilityApi, UtilityProxy};
use cactus_config::Config;

/// Load the utility library and point it at the configured data directory
fn proxy(config: &Config) -> Result<UtilityProxy> {
    let mut loader = LibraryLoader::with_search_paths(config.search_paths().iter().cloned());
    let api = UtilityApi::load(&mut loader, config.utility_library(), config.release_symbol())
        .with_context(|| {
            format!("Failed to load utility library '{}'", config.utility_library())
        })?;

    let proxy = UtilityProxy::new(api);
    if let Some(dir) = config.data_directory() {
        proxy.set_data_directory(dir)?;
    }
    Ok(proxy)
}

pub fn device_id(config: &Config) -> Result<()> {
    let id = proxy(config)?
        .get_device_id()
        .context("No device id available")?;
    println!("{}", id);
    Ok(())
}

pub fn register(payload: &str, config: &Config) -> Result<()> {
    let result = proxy(config)?
        .register_app(payload)?
        .context("Registration returned no result")?;
    println!("{}", result);
    Ok(())
}
