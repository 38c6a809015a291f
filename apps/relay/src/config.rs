//! Relay configuration, read from a JSON file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use flowfile_http::{ReceiverConfig, TransactionConfig};
use flowfile_transfer::ReassemblyPolicy;
use serde::{Deserialize, Serialize};

/// What the relay does with each received record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Write records under `output_dir`, reassembling fragments.
    #[default]
    Save,
    /// Send records on to `forward_url`.
    Forward,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub mode: Mode,
    pub output_dir: PathBuf,
    pub forward_url: Option<String>,
    /// Split forwarded records that exceed the downstream partition size.
    pub partition: bool,
    pub receiver: ReceiverConfig,
    pub transaction: TransactionConfig,
    pub reassembly: ReassemblyPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            mode: Mode::default(),
            output_dir: PathBuf::from("received"),
            forward_url: None,
            partition: true,
            receiver: ReceiverConfig::default(),
            transaction: TransactionConfig::default(),
            reassembly: ReassemblyPolicy::default(),
        }
    }
}

impl RelayConfig {
    /// Loads `path`, falling back to defaults when no path is given, the
    /// file is missing, or it does not parse.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse relay config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }
}
