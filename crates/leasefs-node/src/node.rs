//! A running LeaseFS node: RPC server, RPC client and flease stage.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use leasefs_flease::epoch::{FileEpochStore, MemoryEpochStore};
use leasefs_flease::{CellId, Flease, FleaseStageHandle, MasterEpochHandler, StageBuilder};
use leasefs_transport::{RpcClient, RpcClientConfig, RpcServer, RpcServerHandle, ServerStats};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::flease_rpc::{FleaseRequestListener, RpcMessageSender};
use crate::leases::{LeaseEvent, LeaseTable};

/// Flease view every cell is opened with.
const INITIAL_VIEW_ID: i32 = 0;

pub struct Node {
    server: RpcServerHandle,
    stage: FleaseStageHandle,
    stage_task: JoinHandle<()>,
    leases: LeaseTable,
    advertise_addr: SocketAddr,
    peers: Vec<SocketAddr>,
    request_master_epoch: bool,
}

impl Node {
    /// Starts the server, then the stage, then opens the configured cells.
    pub async fn start(mut config: NodeConfig) -> Result<Self> {
        config.validate()?;

        let listener = Arc::new(FleaseRequestListener::new());
        let server = RpcServer::new(config.rpc.clone(), listener.clone())
            .start()
            .await
            .with_context(|| format!("failed to start RPC server on {}", config.rpc.bind_addr))?;
        let advertise_addr = advertised(config.node.advertise_addr, server.local_addr());

        let epochs: Box<dyn MasterEpochHandler> = match &config.node.epoch_file {
            Some(path) => Box::new(
                FileEpochStore::open(path)
                    .with_context(|| format!("failed to open epoch file {}", path.display()))?,
            ),
            None => Box::new(MemoryEpochStore::new()),
        };

        let client = Arc::new(RpcClient::new(RpcClientConfig::default()));
        let sender = RpcMessageSender::new(client, advertise_addr, Handle::current());
        let leases = LeaseTable::new();
        let mut builder = StageBuilder::new(
            config.flease.clone(),
            Box::new(sender),
            Box::new(leases.clone()),
        )
        .epoch_handler(epochs);
        if let Some(dir) = &config.node.lock_dir {
            builder = builder.lock_dir(dir);
        }
        let (stage, stage_task) = builder.spawn().context("failed to start flease stage")?;
        listener.attach(stage.clone());

        tracing::info!(
            identity = %config.node.identity,
            listen = %server.local_addr(),
            advertise = %advertise_addr,
            peers = config.node.peers.len(),
            "node started"
        );

        let node = Node {
            server,
            stage,
            stage_task,
            leases,
            advertise_addr,
            peers: config.node.peers,
            request_master_epoch: config.node.request_master_epoch,
        };
        for cell in &config.node.cells {
            node.open_cell(CellId::from(cell.as_str())).await?;
        }
        Ok(node)
    }

    /// Address the RPC server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Address announced to peers as the sender of flease messages.
    pub fn advertise_addr(&self) -> SocketAddr {
        self.advertise_addr
    }

    pub fn stage(&self) -> &FleaseStageHandle {
        &self.stage
    }

    pub fn server_stats(&self) -> ServerStats {
        self.server.stats()
    }

    /// Latest known lease of a cell.
    pub fn lease(&self, cell_id: &CellId) -> Option<Flease> {
        self.leases.get(cell_id)
    }

    /// Latest known lease of every cell.
    pub fn leases(&self) -> Vec<Flease> {
        self.leases.all()
    }

    /// Receives lease changes and acquisition failures.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<LeaseEvent> {
        self.leases.subscribe()
    }

    /// Opens a cell with the configured peers as remote acceptors.
    pub async fn open_cell(&self, cell_id: CellId) -> Result<()> {
        tracing::debug!(cell = %cell_id, "opening cell");
        self.stage
            .open_cell(
                cell_id.clone(),
                self.peers.clone(),
                self.request_master_epoch,
                INITIAL_VIEW_ID,
            )
            .await
            .with_context(|| format!("failed to open cell {}", cell_id))
    }

    /// Stops the stage, then the server.
    pub async fn shutdown(self) -> Result<()> {
        self.stage.shutdown();
        if let Err(e) = self.stage_task.await {
            tracing::error!(error = %e, "flease stage task failed");
        }
        self.server.stop().await.context("failed to stop RPC server")?;
        tracing::info!("node stopped");
        Ok(())
    }
}

/// Address peers should use. A wildcard bind is announced as loopback.
fn advertised(configured: Option<SocketAddr>, bound: SocketAddr) -> SocketAddr {
    if let Some(addr) = configured {
        return addr;
    }
    if bound.ip().is_unspecified() {
        let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port());
        tracing::warn!(
            bound = %bound,
            advertise = %loopback,
            "bound to a wildcard address without node.advertise_addr, remote peers cannot reply"
        );
        return loopback;
    }
    bound
}
