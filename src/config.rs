// ⚙️ Run configuration
// Paths, bucket/key and timeouts for one run. Credentials never live here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::UpsertMode;
use crate::loader::LoadOptions;

pub const RAW_FILE_NAME: &str = "transactions.csv";
pub const TRANSFORMED_FILE_NAME: &str = "transformed_transactions.csv";

fn default_fetch_timeout_secs() -> u64 {
    60
}

fn default_load_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub bucket: String,
    pub key: String,

    /// Directory standing in for the blob store
    pub blob_root: PathBuf,

    /// Where the raw extract and the aggregates artifact are written
    pub staging_dir: PathBuf,

    pub database_path: PathBuf,

    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,

    #[serde(default)]
    pub upsert_mode: UpsertMode,

    /// Keep staged files after a successful run
    #[serde(default = "default_true")]
    pub keep_artifacts: bool,
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn raw_path(&self) -> PathBuf {
        self.staging_dir.join(RAW_FILE_NAME)
    }

    pub fn transformed_path(&self) -> PathBuf {
        self.staging_dir.join(TRANSFORMED_FILE_NAME)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            timeout: Duration::from_secs(self.load_timeout_secs),
            mode: self.upsert_mode,
        }
    }
}
