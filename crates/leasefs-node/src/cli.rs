use crate::config::NodeConfig;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "lfs-node")]
#[command(about = "LeaseFS node: flease lease consensus over RPC", long_about = None)]
pub struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "LFS_NODE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address the RPC server binds to.
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Lease holder identity of this node.
    #[arg(short, long)]
    pub identity: Option<String>,

    /// Remote acceptor address, repeatable.
    #[arg(short, long = "peer")]
    pub peers: Vec<SocketAddr>,

    /// Cell to open at start, repeatable.
    #[arg(long = "cell")]
    pub cells: Vec<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

impl Cli {
    /// Loads the configuration file, or defaults when none is given.
    pub fn load_config(&self) -> anyhow::Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_file(path)?,
            None => NodeConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    /// Overrides file settings with the ones given on the command line.
    pub fn apply(&self, config: &mut NodeConfig) {
        if let Some(listen) = self.listen {
            config.rpc.bind_addr = listen;
        }
        if let Some(identity) = &self.identity {
            config.node.identity = identity.clone();
        }
        if !self.peers.is_empty() {
            config.node.peers = self.peers.clone();
        }
        if !self.cells.is_empty() {
            config.node.cells = self.cells.clone();
        }
        if self.log_json {
            config.node.log_json = true;
        }
    }
}
