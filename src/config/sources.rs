use super::models::Config;
use config::{ConfigError, Environment, File, FileFormat};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

const CONFIG_ENV_VAR: &str = "MEDIAFERRY_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/mediaferry.toml";
const ENV_PREFIX: &str = "MEDIAFERRY";
const ENV_SEPARATOR: &str = "__";

/// Worker settings from, lowest priority first: struct defaults, the TOML
/// file named by `MEDIAFERRY_CONFIG` (or `config/mediaferry.toml`), a `.env`
/// file and the process environment.
pub fn load() -> Result<Config, ConfigError> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();
    load_from_sources(config_path())
}

fn config_path() -> PathBuf {
    env::var_os(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load from `config_path` plus the process environment
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    build(&config_path, None)
}

/// `overrides` replaces the process environment, keyed like
/// `MEDIAFERRY__QUEUE__MAX_RETRIES`
fn build(config_path: &Path, overrides: Option<HashMap<String, String>>) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.is_file() {
        tracing::info!(path = %config_path.display(), "Loading configuration file");
        builder = builder.add_source(File::from(config_path).format(FileFormat::Toml));
    } else {
        tracing::warn!(
            path = %config_path.display(),
            "No configuration file, using defaults and environment"
        );
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .source(overrides),
    );

    builder.build()?.try_deserialize()
}
