//! Driver that builds and exercises a cluster of node workers.
//!
//! The driver owns the registry of node handles and the topology under
//! construction. Setup (`create`, `connect`) is only possible until the token
//! is injected; after that the tree is frozen and the driver only feeds
//! requests and crash commands into the nodes.

use std::sync::Arc;

use anyhow::{Context, Result, bail, ensure};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ClusterConfig;
use crate::message::{Envelope, Message, NodeId};
use crate::runtime::{NodeHandle, NodeStatus, spawn_node};
use crate::topology::TreeTopology;
use crate::transport::DelayStrategy;

/// Outcome of [`Cluster::crash`], which toggles a node down and up again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashAction {
    Crashed,
    Revived,
}

pub struct Cluster {
    config: ClusterConfig,
    delay: Arc<dyn DelayStrategy>,
    topology: TreeTopology,
    nodes: Vec<NodeHandle>,
    tasks: Vec<JoinHandle<()>>,
    token_holder: Option<NodeId>,
    crashed: Option<NodeId>,
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> Self {
        let delay = config.delay_strategy();
        Self {
            config,
            delay,
            topology: TreeTopology::new(),
            nodes: Vec::new(),
            tasks: Vec::new(),
            token_holder: None,
            crashed: None,
        }
    }

    /// Builds a cluster over `len` nodes wired along `edges`.
    pub fn with_tree(config: ClusterConfig, len: u64, edges: &[(NodeId, NodeId)]) -> Result<Self> {
        let mut cluster = Self::new(config);
        cluster.create(len)?;
        for &(a, b) in edges {
            cluster.connect(a, b)?;
        }
        Ok(cluster)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn token_injected(&self) -> bool {
        self.token_holder.is_some()
    }

    pub fn crashed(&self) -> Option<NodeId> {
        self.crashed
    }

    /// Spawns `count` new nodes with consecutive ids and returns those ids.
    pub fn create(&mut self, count: u64) -> Result<Vec<NodeId>> {
        ensure!(
            !self.token_injected(),
            "token already injected, cannot add new nodes"
        );
        let ids: Vec<NodeId> = self.topology.grow(count).collect();
        for &id in &ids {
            let (handle, task) = spawn_node(id, self.config.cs_duration, Arc::clone(&self.delay));
            self.nodes.push(handle);
            self.tasks.push(task);
            info!(node = id, "created node");
        }
        Ok(ids)
    }

    /// Makes `a` and `b` tree neighbors.
    pub fn connect(&mut self, a: NodeId, b: NodeId) -> Result<()> {
        ensure!(
            !self.token_injected(),
            "token already injected, cannot change neighbors"
        );
        self.topology.add_edge(a, b)?;
        let (left, right) = (self.handle(a)?, self.handle(b)?);
        left.neighbor_init(right)?;
        right.neighbor_init(left)?;
        info!(a, b, "nodes are now neighbors");
        Ok(())
    }

    /// Makes `id` the initial token owner. Allowed once, on a complete tree.
    pub fn inject(&mut self, id: NodeId) -> Result<()> {
        if let Some(holder) = self.token_holder {
            bail!("token already injected into node {holder}");
        }
        let handle = self.handle(id)?;
        self.topology
            .validate()
            .context("cannot inject the token")?;
        handle.token_inject()?;
        self.token_holder = Some(id);
        info!(node = id, "injected token");
        Ok(())
    }

    /// Asks each listed node to enter the critical section.
    ///
    /// Ids are checked up front; nothing is sent if any of them is unknown.
    pub fn request(&self, ids: &[NodeId]) -> Result<()> {
        let handles = ids
            .iter()
            .map(|&id| self.handle(id))
            .collect::<Result<Vec<_>>>()?;
        for handle in handles {
            info!(node = handle.id(), "sending request");
            handle.request()?;
        }
        Ok(())
    }

    /// Delivers a `Request` to `to` as if `from` had sent it.
    pub fn request_from(&self, from: NodeId, to: NodeId) -> Result<()> {
        self.handle(from)?;
        let target = self.handle(to)?;
        info!(from, to, "injecting request");
        target.send(Envelope::new(from, Message::Request))
    }

    /// Crashes `id`, or revives it if it is the node currently down.
    ///
    /// Only one node may be down at a time.
    pub fn crash(&mut self, id: NodeId) -> Result<CrashAction> {
        let handle = self.handle(id)?;
        match self.crashed {
            None => {
                handle.crash_begin()?;
                self.crashed = Some(id);
                info!(node = id, "crashing node");
                Ok(CrashAction::Crashed)
            }
            Some(down) if down == id => {
                handle.crash_end()?;
                self.crashed = None;
                info!(node = id, "reviving node");
                Ok(CrashAction::Revived)
            }
            Some(down) => bail!("node {down} is already crashed, revive it first"),
        }
    }

    /// Sends `CrashBegin` regardless of other crashed nodes.
    pub fn force_crash(&self, id: NodeId) -> Result<()> {
        warn!(node = id, "forcing crash");
        self.handle(id)?.crash_begin()
    }

    pub fn force_recovery(&self, id: NodeId) -> Result<()> {
        warn!(node = id, "forcing recovery");
        self.handle(id)?.crash_end()
    }

    pub fn handle(&self, id: NodeId) -> Result<&NodeHandle> {
        usize::try_from(id)
            .ok()
            .and_then(|index| self.nodes.get(index))
            .with_context(|| format!("node id {id} not valid"))
    }

    pub async fn status(&self, id: NodeId) -> Result<NodeStatus> {
        self.handle(id)?.status().await
    }

    pub async fn statuses(&self) -> Result<Vec<NodeStatus>> {
        let mut statuses = Vec::with_capacity(self.nodes.len());
        for handle in &self.nodes {
            statuses.push(handle.status().await?);
        }
        Ok(statuses)
    }

    /// Stops every worker and waits for them to finish.
    pub async fn shutdown(self) -> Result<()> {
        for handle in &self.nodes {
            // A worker that already stopped has nothing left to shut down.
            let _ = handle.shutdown();
        }
        for task in self.tasks {
            task.await.context("node worker panicked")?;
        }
        Ok(())
    }
}
