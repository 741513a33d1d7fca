//! Deterministic in-process network for driving several stage cores.
#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use leasefs_flease::comm::Resumption;
use leasefs_flease::epoch::MemoryEpochStore;
use leasefs_flease::{
    CellId, Clock, Flease, FleaseConfig, FleaseError, FleaseMessage, FleaseMessageSender,
    FleaseStatusListener, ManualClock, MessageKind, ProposalNumber, StageBuilder, StageCore,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

/// Start of simulated time.
pub const START_MS: i64 = 1_700_000_000_000;

/// Simulated time per step.
pub const STEP_MS: i64 = 10;

/// A message in flight.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub message: FleaseMessage,
}

/// A lease change observed by one node.
#[derive(Debug, Clone)]
pub struct Observation {
    pub node: usize,
    pub at_ms: i64,
    pub lease: Flease,
}

type Wire = Arc<Mutex<Vec<Envelope>>>;

struct SimSender {
    from: SocketAddr,
    wire: Wire,
}

impl FleaseMessageSender for SimSender {
    fn send_message(&mut self, message: FleaseMessage, receiver: SocketAddr) {
        self.wire.lock().unwrap().push(Envelope {
            from: self.from,
            to: receiver,
            message,
        });
    }
}

struct SimListener {
    node: usize,
    clock: Arc<ManualClock>,
    observations: Arc<Mutex<Vec<Observation>>>,
    failures: Arc<Mutex<Vec<(usize, CellId)>>>,
}

impl FleaseStatusListener for SimListener {
    fn status_changed(&mut self, _cell_id: &CellId, lease: &Flease) {
        self.observations.lock().unwrap().push(Observation {
            node: self.node,
            at_ms: self.clock.now_ms(),
            lease: lease.clone(),
        });
    }

    fn lease_failed(&mut self, cell_id: &CellId, _error: &FleaseError) {
        self.failures
            .lock()
            .unwrap()
            .push((self.node, cell_id.clone()));
    }
}

/// Network faults applied to every delivery.
#[derive(Debug, Clone, Copy, Default)]
pub struct Faults {
    pub loss: f64,
    pub duplicate: f64,
    pub reorder: bool,
}

struct SimNode {
    addr: SocketAddr,
    core: StageCore,
    resumptions: mpsc::UnboundedReceiver<Resumption>,
}

/// N nodes sharing one clock and one lossy wire.
pub struct Simulation {
    clock: Arc<ManualClock>,
    nodes: Vec<SimNode>,
    wire: Wire,
    rng: StdRng,
    faults: Faults,
    down: HashSet<usize>,
    observations: Arc<Mutex<Vec<Observation>>>,
    failures: Arc<Mutex<Vec<(usize, CellId)>>>,
    sent: Vec<Envelope>,
}

impl Simulation {
    /// Creates `n` nodes with master epoch stores.
    pub fn new(n: usize, seed: u64, faults: Faults) -> Self {
        let clock = Arc::new(ManualClock::new(START_MS));
        let wire = Wire::default();
        let observations = Arc::new(Mutex::new(Vec::new()));
        let failures = Arc::new(Mutex::new(Vec::new()));
        let nodes = (0..n)
            .map(|i| {
                let addr = node_addr(i);
                let config = FleaseConfig::new(format!("node-{}", i));
                let (core, resumptions) = StageBuilder::new(
                    config,
                    Box::new(SimSender {
                        from: addr,
                        wire: Arc::clone(&wire),
                    }),
                    Box::new(SimListener {
                        node: i,
                        clock: Arc::clone(&clock),
                        observations: Arc::clone(&observations),
                        failures: Arc::clone(&failures),
                    }),
                )
                .clock(clock.clone())
                .epoch_handler(Box::new(MemoryEpochStore::new()))
                .rng(Box::new(StdRng::seed_from_u64(seed.wrapping_add(i as u64))))
                .build_core()
                .unwrap();
                SimNode {
                    addr,
                    core,
                    resumptions,
                }
            })
            .collect();
        Self {
            clock,
            nodes,
            wire,
            rng: StdRng::seed_from_u64(seed),
            faults,
            down: HashSet::new(),
            observations,
            failures,
            sent: Vec::new(),
        }
    }

    /// Current simulated time.
    pub fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Node `i` neither sends nor receives from now on.
    pub fn crash(&mut self, i: usize) {
        self.down.insert(i);
    }

    /// Opens `cell` on node `i` with every other node as acceptor.
    pub fn open_cell(&mut self, i: usize, cell: &str, request_master_epoch: bool) {
        let acceptors = (0..self.nodes.len())
            .filter(|j| *j != i)
            .map(node_addr)
            .collect();
        let now = self.now();
        self.nodes[i]
            .core
            .open_cell(CellId::from(cell), acceptors, request_master_epoch, 0, now)
            .unwrap();
        self.drain_resumptions(i);
    }

    fn drain_resumptions(&mut self, i: usize) {
        let now = self.now();
        let node = &mut self.nodes[i];
        while let Ok(resumption) = node.resumptions.try_recv() {
            node.core.resume(resumption, now);
        }
    }

    fn index_of(&self, addr: SocketAddr) -> Option<usize> {
        self.nodes.iter().position(|n| n.addr == addr)
    }

    /// Advances time by one step: delivers the previous step's messages, then
    /// fires timers.
    pub fn step(&mut self) {
        self.clock.advance(STEP_MS);
        let mut batch = std::mem::take(&mut *self.wire.lock().unwrap());
        if self.faults.reorder {
            batch.shuffle(&mut self.rng);
        }
        for envelope in batch {
            self.sent.push(envelope.clone());
            let (Some(from), Some(to)) = (self.index_of(envelope.from), self.index_of(envelope.to))
            else {
                continue;
            };
            if self.down.contains(&from) || self.down.contains(&to) {
                continue;
            }
            if self.rng.gen_bool(self.faults.loss) {
                continue;
            }
            let copies = if self.rng.gen_bool(self.faults.duplicate) {
                2
            } else {
                1
            };
            for _ in 0..copies {
                let mut message = envelope.message.clone();
                message.sender = Some(envelope.from);
                let now = self.now();
                self.nodes[to].core.handle_message(message, now);
                self.drain_resumptions(to);
            }
        }
        let now = self.now();
        for i in 0..self.nodes.len() {
            if self.down.contains(&i) {
                continue;
            }
            self.nodes[i].core.on_tick(now);
            self.drain_resumptions(i);
        }
    }

    /// Runs for `duration_ms` of simulated time.
    pub fn run_for(&mut self, duration_ms: i64) {
        let until = self.now() + duration_ms;
        while self.now() < until {
            self.step();
        }
    }

    /// Lease changes seen so far, in observation order.
    pub fn observations(&self) -> Vec<Observation> {
        self.observations.lock().unwrap().clone()
    }

    /// `lease_failed` notifications so far.
    pub fn failures(&self) -> Vec<(usize, CellId)> {
        self.failures.lock().unwrap().clone()
    }

    /// Ballots of the PREPAREs node `i` put on the wire, one entry per round.
    pub fn prepare_ballots(&self, i: usize) -> Vec<ProposalNumber> {
        let from = node_addr(i);
        let mut ballots: Vec<ProposalNumber> = Vec::new();
        for envelope in &self.sent {
            if envelope.from != from || envelope.message.kind != MessageKind::Prepare {
                continue;
            }
            if ballots.last() != Some(&envelope.message.proposal_no) {
                ballots.push(envelope.message.proposal_no);
            }
        }
        ballots
    }
}

/// Address of node `i`.
pub fn node_addr(i: usize) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7000 + i as u16))
}

/// Checks that no two holders are ever valid for the same cell at once.
///
/// Each observed lease is valid from the moment it was observed until its
/// timeout; intervals of different holders must not overlap.
pub fn assert_mutual_exclusion(observations: &[Observation]) {
    let held: Vec<&Observation> = observations
        .iter()
        .filter(|o| o.lease.holder.is_some())
        .collect();
    for (i, a) in held.iter().enumerate() {
        for b in &held[i + 1..] {
            if a.lease.cell_id != b.lease.cell_id || a.lease.holder == b.lease.holder {
                continue;
            }
            let overlap =
                a.at_ms < b.lease.lease_timeout_ms && b.at_ms < a.lease.lease_timeout_ms;
            assert!(
                !overlap,
                "two holders valid at once: node {} saw {} at {}, node {} saw {} at {}",
                a.node, a.lease, a.at_ms, b.node, b.lease, b.at_ms
            );
        }
    }
}
