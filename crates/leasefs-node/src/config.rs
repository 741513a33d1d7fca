use leasefs_flease::FleaseConfig;
use leasefs_transport::ServerConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Node identity, peers and local files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Lease holder identity of this node.
    pub identity: String,
    /// Address peers reach this node on. Defaults to the bound address.
    pub advertise_addr: Option<SocketAddr>,
    /// Directory for the acceptor's restart lock file.
    pub lock_dir: Option<PathBuf>,
    /// Master epoch file. Epochs are kept in memory when unset.
    pub epoch_file: Option<PathBuf>,
    /// Remote acceptors of every cell.
    pub peers: Vec<SocketAddr>,
    /// Cells opened at start.
    pub cells: Vec<String>,
    /// Ask acceptors for master epochs when acquiring a lease.
    pub request_master_epoch: bool,
    /// Log level used when RUST_LOG is not set.
    pub log_level: String,
    /// Emit logs as JSON lines.
    pub log_json: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            identity: String::from("localhost"),
            advertise_addr: None,
            lock_dir: None,
            epoch_file: None,
            peers: Vec::new(),
            cells: Vec::new(),
            request_master_epoch: true,
            log_level: String::from("info"),
            log_json: false,
        }
    }
}

/// Configuration of an `lfs-node` process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub flease: FleaseConfig,
    pub rpc: ServerConfig,
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: NodeConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: NodeConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Copies the node identity into the flease section and checks the timings.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        if self.node.identity.trim().is_empty() {
            anyhow::bail!("node.identity must not be empty");
        }
        self.flease.identity = self.node.identity.clone();

        let round = self.flease.round_timeout_ms;
        if round <= 0 {
            anyhow::bail!("flease.round_timeout_ms must be positive, got {}", round);
        }
        let lease = self.flease.max_lease_timeout_ms;
        if lease <= 4 * round {
            anyhow::bail!(
                "flease.max_lease_timeout_ms ({}) must exceed 4 * round_timeout_ms ({})",
                lease,
                4 * round
            );
        }
        Ok(())
    }
}
