//! Process configuration
//!
//! Loaded from an optional file named by `RECOMMENDER_CONFIG_FILE`, then
//! from `RECOMMENDER_*` environment variables. Nested recommender settings
//! use a double underscore, e.g. `RECOMMENDER_RECOMMENDER__GC_INTERVAL_SECS`.

use anyhow::{Context, Result};
use recommender_lib::RecommenderConfig;
use serde::Deserialize;
use std::path::PathBuf;

const ENV_PREFIX: &str = "RECOMMENDER";
const CONFIG_FILE_ENV: &str = "RECOMMENDER_CONFIG_FILE";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Node name from the Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Port for health, metrics and the ingestion API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Directory of checkpoint files. Checkpoints are kept in memory when unset.
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,

    #[serde(default)]
    pub recommender: RecommenderConfig,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            api_port: default_api_port(),
            checkpoint_dir: None,
            recommender: RecommenderConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("recommender.post_processors"),
            )
            .build()
            .context("Failed to read configuration")?;

        let app: AppConfig = config
            .try_deserialize()
            .context("Invalid configuration")?;
        app.recommender.validate()?;
        Ok(app)
    }
}
