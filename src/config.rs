//! Node configuration.
//!
//! Values are layered: built-in defaults, then the TOML file, then
//! `PROTOCHAIN__*` environment variables (`PROTOCHAIN__NODE__DATA_DIR`,
//! `PROTOCHAIN__SCHEDULER__PROPOSE_INTERVAL_MS`, ...).
//!
//! ```toml
//! [node]
//! data_dir = "./data"
//! genesis_path = "./genesis.toml"
//! key_path = "./validator.key"
//!
//! [storage]
//! backend = "sled"
//!
//! [scheduler]
//! propose_interval_ms = 1000
//! network_timeout_ms = 500
//! ```

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use protochain_scheduler::SchedulerSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "PROTOCHAIN";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub storage: StorageSection,
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub data_dir: PathBuf,
    pub genesis_path: PathBuf,
    /// Hex seed of the validator key. Generated on first start when missing.
    pub key_path: Option<PathBuf>,
}

impl Default for NodeSection {
    fn default() -> Self {
        NodeSection {
            data_dir: PathBuf::from("./data"),
            genesis_path: PathBuf::from("./genesis.toml"),
            key_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sled,
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub backend: StorageBackend,
}

impl NodeConfig {
    /// Load the configuration, optionally from a file, with environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path.to_path_buf()).required(true));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble node configuration")?;

        settings
            .try_deserialize()
            .context("Failed to parse node configuration")
    }

    /// Where the sled database lives.
    pub fn database_path(&self) -> PathBuf {
        self.node.data_dir.join("metadata")
    }

    pub fn key_path(&self) -> PathBuf {
        self.node
            .key_path
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("validator.key"))
    }
}
