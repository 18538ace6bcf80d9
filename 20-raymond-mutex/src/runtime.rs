//! Worker tasks that run one node each.
//!
//! Every node lives in its own tokio task that owns a [`TreeNode`] and
//! consumes a single mailbox, so a node handles exactly one message at a time
//! and never shares state. The worker turns the node's [`Ready`] effects into
//! sends over [`Link`]s and into delayed self-messages for timers.
//!
//! The driver talks to a worker through a [`NodeHandle`]: protocol messages,
//! neighbor wiring, status queries and shutdown all travel through the same
//! mailbox, so they are observed in the order they were issued.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::broker::BrokerMode;
use crate::error::ProtocolError;
use crate::message::{Envelope, Message, NodeId};
use crate::node::{Outbound, Ready, TimerRequest, TreeNode};
use crate::transport::{DelayStrategy, Link};

/// Everything a worker can find in its mailbox.
enum Mail {
    Protocol(Envelope),
    /// `NeighborInit` together with the neighbor's send-capable handle.
    Neighbor(NodeHandle),
    Status {
        respond_to: oneshot::Sender<NodeStatus>,
    },
    Shutdown,
}

/// Send-capable handle to a running node.
///
/// Cloning is cheap; every clone feeds the same mailbox. Sends never block.
#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    mail_tx: mpsc::UnboundedSender<Mail>,
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle").field("id", &self.id).finish()
    }
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Posts an envelope to the node's mailbox.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.post(Mail::Protocol(envelope))
    }

    /// Posts a message on the node's own behalf (driver commands, timers).
    pub fn command(&self, message: Message) -> Result<()> {
        self.send(Envelope::new(self.id, message))
    }

    /// Installs `neighbor` as a tree neighbor of this node.
    pub fn neighbor_init(&self, neighbor: &NodeHandle) -> Result<()> {
        self.post(Mail::Neighbor(neighbor.clone()))
    }

    pub fn token_inject(&self) -> Result<()> {
        self.command(Message::TokenInject)
    }

    /// Asks for the critical section on this node's behalf.
    pub fn request(&self) -> Result<()> {
        self.command(Message::Request)
    }

    pub fn crash_begin(&self) -> Result<()> {
        self.command(Message::CrashBegin)
    }

    pub fn crash_end(&self) -> Result<()> {
        self.command(Message::CrashEnd)
    }

    /// Snapshot of the node's protocol state, taken between two messages.
    pub async fn status(&self) -> Result<NodeStatus> {
        let (respond_to, response) = oneshot::channel();
        self.post(Mail::Status { respond_to })?;
        response
            .await
            .with_context(|| format!("node {} stopped before answering", self.id))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.post(Mail::Shutdown)
    }

    fn post(&self, mail: Mail) -> Result<()> {
        self.mail_tx
            .send(mail)
            .map_err(|_| anyhow!("node {} is not running", self.id))
    }
}

/// Point-in-time view of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub mode: BrokerMode,
    pub holder: Option<NodeId>,
    pub request_list: Vec<NodeId>,
    pub inside_cs: bool,
    pub cs_entries: u64,
    pub neighbors: Vec<NodeId>,
}

impl NodeStatus {
    pub fn holds_token(&self) -> bool {
        self.holder == Some(self.id)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |on: bool| if on { "Y" } else { "N" };
        let holder = self
            .holder
            .map_or_else(|| "-".to_string(), |holder| holder.to_string());
        write!(
            f,
            "({})   token: {}   holder: {}   requests: {:?}   CS: {}   mode: {:?}",
            self.id,
            flag(self.holds_token()),
            holder,
            self.request_list,
            flag(self.inside_cs),
            self.mode,
        )
    }
}

/// Spawns the worker for node `id`.
///
/// The returned task finishes on [`NodeHandle::shutdown`] or when the node
/// hits a fatal protocol error.
pub fn spawn_node(
    id: NodeId,
    cs_duration: Duration,
    delay: Arc<dyn DelayStrategy>,
) -> (NodeHandle, JoinHandle<()>) {
    let (mail_tx, mail_rx) = mpsc::unbounded_channel();
    let handle = NodeHandle { id, mail_tx };

    let worker = Worker {
        node: TreeNode::new(id, cs_duration),
        links: HashMap::new(),
        delay,
        own: handle.clone(),
        mail_rx,
    };

    let task = tokio::spawn(async move {
        if let Err(err) = worker.run().await {
            error!(node = id, %err, "CRITICAL: node worker stopped");
        }
    });

    (handle, task)
}

struct Worker {
    node: TreeNode,
    links: HashMap<NodeId, Link>,
    delay: Arc<dyn DelayStrategy>,
    own: NodeHandle,
    mail_rx: mpsc::UnboundedReceiver<Mail>,
}

impl Worker {
    async fn run(mut self) -> Result<(), ProtocolError> {
        while let Some(mail) = self.mail_rx.recv().await {
            match mail {
                Mail::Protocol(Envelope {
                    from,
                    message: Message::NeighborInit { id },
                }) => {
                    error!(node = self.node.id(), from, neighbor = id, "neighbor without a handle, use neighbor_init");
                }
                Mail::Protocol(envelope) => self.step(envelope)?,
                Mail::Neighbor(handle) => {
                    let neighbor = handle.id();
                    if neighbor != self.node.id() && !self.links.contains_key(&neighbor) {
                        let link = Link::spawn(self.node.id(), handle, Arc::clone(&self.delay));
                        self.links.insert(neighbor, link);
                    }
                    self.step(Envelope::new(self.node.id(), Message::NeighborInit { id: neighbor }))?;
                }
                Mail::Status { respond_to } => {
                    let _ = respond_to.send(self.status());
                }
                Mail::Shutdown => {
                    debug!(node = self.node.id(), "shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Runs one envelope through the node. Only errors that leave the node
    /// untrustworthy are returned; the rest cost just the offending message.
    fn step(&mut self, envelope: Envelope) -> Result<(), ProtocolError> {
        let result = self.node.step(envelope);
        if let Some(ready) = self.node.take_ready() {
            self.process_ready(ready);
        }

        match result {
            Err(err) if err.is_fatal_for_node() => Err(err),
            Err(err) => {
                error!(node = self.node.id(), %err, "message rejected");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn process_ready(&mut self, ready: Ready) {
        let id = self.node.id();
        for anomaly in ready.anomalies {
            warn!(node = id, %anomaly, "anomaly");
        }
        for outbound in ready.messages {
            self.dispatch(outbound);
        }
        for timer in ready.timers {
            self.schedule(timer);
        }
    }

    fn dispatch(&mut self, outbound: Outbound) {
        let id = self.node.id();
        let envelope = Envelope::new(id, outbound.message);
        debug!(node = id, to = outbound.to, kind = %envelope.kind(), "send");

        if outbound.to == id {
            if self.own.send(envelope).is_err() {
                error!(node = id, "own mailbox closed");
            }
            return;
        }

        let Some(link) = self.links.get(&outbound.to) else {
            error!(node = id, to = outbound.to, "no link to peer, dropping message");
            return;
        };
        if !link.send(envelope) {
            error!(node = id, to = link.to(), "link closed, dropping message");
        }
    }

    fn schedule(&self, timer: TimerRequest) {
        let own = self.own.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timer.after).await;
            if let Err(err) = own.command(timer.message) {
                debug!(%err, "timer fired after node stopped");
            }
        });
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.node.id(),
            mode: self.node.mode(),
            holder: self.node.holder(),
            request_list: self.node.request_list().collect(),
            inside_cs: self.node.inside_cs(),
            cs_entries: self.node.cs_entries(),
            neighbors: self.node.neighbors().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::transport::NoDelay;

    fn spawn(id: NodeId) -> NodeHandle {
        spawn_node(id, Duration::from_secs(1), Arc::new(NoDelay)).0
    }

    /// Holds back the next message on one directed link once armed.
    struct SlowNextHop {
        from: NodeId,
        to: NodeId,
        armed: AtomicBool,
    }

    impl DelayStrategy for SlowNextHop {
        fn delay(&self, from: NodeId, to: NodeId) -> Duration {
            if (from, to) == (self.from, self.to) && self.armed.swap(false, Ordering::SeqCst) {
                Duration::from_millis(100)
            } else {
                Duration::ZERO
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn neighbor_without_a_handle_is_refused() -> Result<()> {
        let a = spawn(0);
        let b = spawn(1);
        a.neighbor_init(&b)?;
        b.neighbor_init(&a)?;

        a.command(Message::NeighborInit { id: 7 })?;
        a.token_inject()?;
        a.crash_begin()?;
        a.crash_end()?;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let status = a.status().await?;
        assert_eq!(status.neighbors, vec![1]);
        assert_eq!(status.mode, BrokerMode::Normal);
        assert!(status.holds_token());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn rewiring_a_neighbor_keeps_link_order() -> Result<()> {
        let delay = Arc::new(SlowNextHop {
            from: 0,
            to: 1,
            armed: AtomicBool::new(false),
        });
        let (a, _) = spawn_node(0, Duration::from_secs(1), delay.clone());
        let (b, _) = spawn_node(1, Duration::from_secs(1), delay.clone());
        a.neighbor_init(&b)?;
        b.neighbor_init(&a)?;
        a.token_inject()?;
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The privilege for b now sits on the 0 -> 1 link for 100ms.
        delay.armed.store(true, Ordering::SeqCst);
        b.request()?;
        tokio::time::sleep(Duration::from_millis(10)).await;

        // a's request must reach b after the privilege, or b drops it as
        // stale and a is never served.
        a.neighbor_init(&b)?;
        a.request()?;
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(b.status().await?.cs_entries, 1);
        let status = a.status().await?;
        assert_eq!(status.cs_entries, 1);
        assert_eq!(status.neighbors, vec![1]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn two_nodes_pass_the_token() -> Result<()> {
        let a = spawn(0);
        let b = spawn(1);
        a.neighbor_init(&b)?;
        b.neighbor_init(&a)?;
        a.token_inject()?;

        b.request()?;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = b.status().await?;
        assert!(status.inside_cs);
        assert!(status.holds_token());
        assert_eq!(a.status().await?.holder, Some(1));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!b.status().await?.inside_cs);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stranger_messages_do_not_stop_the_worker() -> Result<()> {
        let a = spawn(0);
        a.token_inject()?;
        a.send(Envelope::new(9, Message::Request))?;

        let status = a.status().await?;
        assert_eq!(status.mode, BrokerMode::Normal);
        assert!(status.request_list.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_closes_the_mailbox() -> Result<()> {
        let (handle, task) = spawn_node(3, Duration::from_secs(1), Arc::new(NoDelay));
        handle.shutdown()?;
        task.await?;

        assert!(handle.request().is_err());
        assert!(handle.status().await.is_err());
        Ok(())
    }

    #[test]
    fn status_line_matches_console_format() {
        let status = NodeStatus {
            id: 2,
            mode: BrokerMode::Normal,
            holder: Some(2),
            request_list: vec![3, 4],
            inside_cs: false,
            cs_entries: 1,
            neighbors: vec![1, 3, 4],
        };
        assert_eq!(
            status.to_string(),
            "(2)   token: Y   holder: 2   requests: [3, 4]   CS: N   mode: Normal"
        );
    }
}
