//! Transport configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RdmaError, Result};
use crate::verbs::ConnParams;
use crate::wire::TransferMode;

/// Per-connection transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RdmaConfig {
    /// Bulk buffer and transfer size in bytes.
    pub size: usize,
    /// Locally configured transfer mode.
    pub mode: TransferMode,
    /// Send queue depth; the completion queue holds twice as many entries.
    pub sq_depth: u32,
    /// Receive queue depth.
    pub recv_depth: u32,
    /// Timeout for address and route resolution, in milliseconds.
    pub resolve_timeout_ms: u64,
    /// Listen backlog.
    pub listen_backlog: u32,
    /// Outstanding RDMA reads the peer may issue against us.
    pub responder_resources: u8,
    /// Outstanding RDMA reads we may issue.
    pub initiator_depth: u8,
    /// Transport retry count used by the client on connect.
    pub retry_count: u8,
    /// Print data received by RDMA read to stdout.
    pub verbose: bool,
    /// Append data received by RDMA read to this file.
    pub output_file: Option<PathBuf>,
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self {
            size: 128 * 1024,
            mode: TransferMode::PassiveWrite,
            sq_depth: 16,
            recv_depth: 2,
            resolve_timeout_ms: 2000,
            listen_backlog: 3,
            responder_resources: 1,
            initiator_depth: 1,
            retry_count: 10,
            verbose: false,
            output_file: None,
        }
    }
}

impl RdmaConfig {
    /// Load from a `.toml` or `.json` file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: RdmaConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| RdmaError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| RdmaError::Config(e.to_string()))?
            }
            _ => {
                return Err(RdmaError::Config(format!(
                    "unsupported config file extension: {ext}"
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the transport cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(RdmaError::Config("size must be non-zero".into()));
        }
        if u32::try_from(self.size).is_err() {
            return Err(RdmaError::Config(format!(
                "size {} does not fit the 32-bit descriptor field",
                self.size
            )));
        }
        if self.sq_depth == 0 || self.recv_depth == 0 {
            return Err(RdmaError::Config("queue depths must be non-zero".into()));
        }
        if self.resolve_timeout_ms == 0 {
            return Err(RdmaError::Config("resolve timeout must be non-zero".into()));
        }
        if self.listen_backlog == 0 {
            return Err(RdmaError::Config("listen backlog must be non-zero".into()));
        }
        Ok(())
    }

    /// Address and route resolution timeout.
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    /// Completion queue entries.
    pub fn cq_depth(&self) -> u32 {
        self.sq_depth.saturating_mul(2)
    }

    /// Connect/accept parameters.
    pub fn conn_params(&self) -> ConnParams {
        ConnParams {
            responder_resources: self.responder_resources,
            initiator_depth: self.initiator_depth,
            retry_count: self.retry_count,
        }
    }
}
