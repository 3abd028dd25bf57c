use anyhow::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

use crate::config::AppConfig;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the application configuration by merging a TOML file with
    /// `DELTA_BRIDGE_`-prefixed environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &str) -> Result<AppConfig> {
        let config: AppConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("DELTA_BRIDGE_").split("__"))
            .extract()?;

        Ok(config)
    }
}
