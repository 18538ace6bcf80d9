//! Core protocol state machine.
//!
//! [`TreeNode`] holds one node's view of the token tree: which neighbor is
//! closer to the token (`holder`), the FIFO of pending requesters, and whether
//! the node is inside the critical section. It performs no I/O. Every call to
//! [`TreeNode::step`] runs one inbound envelope to completion and queues the
//! resulting effects; the caller drains them with [`TreeNode::take_ready`] and
//! is responsible for delivering messages and firing timers.
//!
//! All inbound traffic passes through the node's [`MessageBroker`] first, so
//! the handlers below only see messages that are safe in the current mode.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::broker::{Admission, BrokerMode, MessageBroker};
use crate::error::{Anomaly, ProtocolError};
use crate::message::{Envelope, Message, MessageKind, NodeId};

/// How long a node stays in the critical section unless configured otherwise.
pub const DEFAULT_CS_DURATION: Duration = Duration::from_secs(1);

/// A message the node wants delivered to a neighbor (or to itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outbound {
    pub to: NodeId,
    pub message: Message,
}

/// A message the node wants delivered to itself after `after` has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    pub after: Duration,
    pub message: Message,
}

/// Effects produced since the last call to [`TreeNode::take_ready`].
#[derive(Debug, Default)]
pub struct Ready {
    pub messages: Vec<Outbound>,
    pub timers: Vec<TimerRequest>,
    pub anomalies: Vec<Anomaly>,
}

impl Ready {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.timers.is_empty() && self.anomalies.is_empty()
    }
}

/// What a neighbor reported about itself during a recovery episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub holder: NodeId,
    pub has_request: bool,
}

pub struct TreeNode {
    id: NodeId,
    neighbors: BTreeSet<NodeId>,
    holder: Option<NodeId>,
    request_list: VecDeque<NodeId>,
    inside_cs: bool,
    recovery_info: BTreeMap<NodeId, RecoveryReport>,
    broker: MessageBroker,
    cs_duration: Duration,
    cs_entries: u64,
    ready: Ready,
}

impl TreeNode {
    pub fn new(id: NodeId, cs_duration: Duration) -> Self {
        Self {
            id,
            neighbors: BTreeSet::new(),
            holder: None,
            request_list: VecDeque::new(),
            inside_cs: false,
            recovery_info: BTreeMap::new(),
            broker: MessageBroker::new(id),
            cs_duration,
            cs_entries: 0,
            ready: Ready::default(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The neighbor believed to be closer to the token, or this node's own id
    /// when it believes it has the token. `None` before `Init` and while
    /// recovering from a crash.
    pub fn holder(&self) -> Option<NodeId> {
        self.holder
    }

    pub fn holds_token(&self) -> bool {
        self.holder == Some(self.id)
    }

    pub fn request_list(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.request_list.iter().copied()
    }

    pub fn inside_cs(&self) -> bool {
        self.inside_cs
    }

    pub fn mode(&self) -> BrokerMode {
        self.broker.mode()
    }

    pub fn neighbors(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.neighbors.iter().copied()
    }

    pub fn broker(&self) -> &MessageBroker {
        &self.broker
    }

    /// Number of times this node has entered the critical section.
    pub fn cs_entries(&self) -> u64 {
        self.cs_entries
    }

    /// Processes one inbound envelope, plus anything the broker releases as a
    /// consequence.
    pub fn step(&mut self, envelope: Envelope) -> Result<(), ProtocolError> {
        self.deliver(envelope)?;
        self.drain_replay()
    }

    /// Returns the effects accumulated so far, or `None` if there are none.
    pub fn take_ready(&mut self) -> Option<Ready> {
        if self.ready.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.ready))
    }

    fn deliver(&mut self, envelope: Envelope) -> Result<(), ProtocolError> {
        match self.broker.admit(envelope) {
            Admission::Dispatch => self.handle(envelope),
            Admission::Buffer => {
                debug!(node = self.id, from = envelope.from, kind = %envelope.kind(), "buffered");
                Ok(())
            }
            Admission::Drop => {
                self.report(Anomaly::DroppedDuringRecovery {
                    from: envelope.from,
                    kind: envelope.kind(),
                });
                Ok(())
            }
        }
    }

    fn drain_replay(&mut self) -> Result<(), ProtocolError> {
        while let Some(envelope) = self.broker.take_replay() {
            if let Err(err) = self.deliver(envelope) {
                if err.is_fatal_for_node() {
                    return Err(err);
                }
                error!(node = self.id, %err, "replayed message rejected");
            }
        }
        Ok(())
    }

    fn handle(&mut self, envelope: Envelope) -> Result<(), ProtocolError> {
        let from = envelope.from;
        match envelope.message {
            Message::NeighborInit { id } => {
                self.on_neighbor_init(id);
                Ok(())
            }
            Message::TokenInject => self.on_token_inject(from),
            Message::Init { holder } => {
                self.check_sender(envelope)?;
                self.on_init(from, holder)
            }
            Message::Request => {
                self.check_sender(envelope)?;
                self.on_request(from);
                Ok(())
            }
            Message::Privilege { requires_token_back } => {
                self.check_sender(envelope)?;
                self.on_privilege(from, requires_token_back);
                Ok(())
            }
            Message::RecoveryInfoRequest => {
                self.check_sender(envelope)?;
                self.on_recovery_info_request(from);
                Ok(())
            }
            Message::RecoveryInfoResponse { holder, has_request } => {
                self.check_sender(envelope)?;
                self.on_recovery_info_response(from, RecoveryReport { holder, has_request })
            }
            Message::ExitCs => {
                self.on_exit_cs();
                Ok(())
            }
            Message::CrashBegin => self.on_crash_begin(),
            Message::CrashEnd => self.on_crash_end(),
        }
    }

    fn check_sender(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        if envelope.from == self.id || self.neighbors.contains(&envelope.from) {
            return Ok(());
        }
        Err(ProtocolError::UnknownSender {
            node: self.id,
            from: envelope.from,
            kind: envelope.kind(),
        })
    }

    fn on_neighbor_init(&mut self, id: NodeId) {
        if id == self.id {
            debug!(node = self.id, "ignoring self as neighbor");
            return;
        }
        if self.neighbors.insert(id) {
            debug!(node = self.id, neighbor = id, "neighbor registered");
        }
    }

    fn on_token_inject(&mut self, from: NodeId) -> Result<(), ProtocolError> {
        if self.mode() != BrokerMode::Uninitialized {
            self.report(Anomaly::RepeatedInit {
                from,
                kind: MessageKind::TokenInject,
            });
            return Ok(());
        }

        info!(node = self.id, "token injected");
        self.holder = Some(self.id);
        let neighbors: Vec<_> = self.neighbors().collect();
        for neighbor in neighbors {
            self.send(neighbor, Message::Init { holder: self.id });
        }
        self.resume_normal()
    }

    fn on_init(&mut self, from: NodeId, declared: NodeId) -> Result<(), ProtocolError> {
        if self.mode() != BrokerMode::Uninitialized {
            self.report(Anomaly::RepeatedInit {
                from,
                kind: MessageKind::Init,
            });
            return Ok(());
        }

        debug!(node = self.id, holder = from, declared, "init received");
        self.holder = Some(from);
        let downstream: Vec<_> = self.neighbors().filter(|&n| n != from).collect();
        for neighbor in downstream {
            self.send(neighbor, Message::Init { holder: self.id });
        }
        self.resume_normal()
    }

    fn on_request(&mut self, requester: NodeId) {
        if self.request_list.contains(&requester) {
            self.report(Anomaly::DuplicateRequest { requester });
            return;
        }
        if requester != self.id && self.holder == Some(requester) {
            self.report(Anomaly::StaleRequestFromHolder { holder: requester });
            return;
        }

        let was_empty = self.request_list.is_empty();
        self.request_list.push_back(requester);

        if self.inside_cs {
            return;
        }

        if self.holds_token() && was_empty {
            if requester == self.id {
                // stays queued; the self-addressed privilege pops it
                self.send(self.id, Message::Privilege { requires_token_back: false });
            } else {
                self.request_list.pop_back();
                self.send(requester, Message::Privilege { requires_token_back: false });
                self.holder = Some(requester);
            }
        } else if was_empty {
            match self.holder {
                Some(holder) => self.send(holder, Message::Request),
                None => debug!(node = self.id, requester, "no holder to forward request to"),
            }
        }
    }

    fn on_privilege(&mut self, from: NodeId, requires_token_back: bool) {
        self.holder = Some(self.id);
        if requires_token_back && from != self.id && !self.request_list.contains(&from) {
            self.request_list.push_back(from);
        }

        if self.inside_cs {
            return;
        }
        if self.request_list.is_empty() {
            self.report(Anomaly::PrivilegeWithEmptyQueue);
            return;
        }
        self.grant_to_head();
    }

    fn grant_to_head(&mut self) {
        let Some(head) = self.request_list.pop_front() else {
            return;
        };

        if head == self.id {
            self.inside_cs = true;
            self.cs_entries += 1;
            info!(node = self.id, "entering critical section");
            self.ready.timers.push(TimerRequest {
                after: self.cs_duration,
                message: Message::ExitCs,
            });
        } else {
            let requires_token_back = !self.request_list.is_empty();
            self.send(head, Message::Privilege { requires_token_back });
            self.holder = Some(head);
        }
    }

    fn on_exit_cs(&mut self) {
        if !self.inside_cs {
            self.report(Anomaly::SpuriousExitCs);
            return;
        }

        self.inside_cs = false;
        info!(node = self.id, "leaving critical section");
        if !self.request_list.is_empty() {
            self.grant_to_head();
        }
    }

    fn on_crash_begin(&mut self) -> Result<(), ProtocolError> {
        if self.inside_cs {
            self.report(Anomaly::CrashWhileInCs);
            return Ok(());
        }

        self.broker.enter_recovering(self.neighbors.iter().copied())?;
        self.holder = None;
        self.request_list.clear();
        self.recovery_info.clear();
        info!(node = self.id, "crashed");
        Ok(())
    }

    fn on_crash_end(&mut self) -> Result<(), ProtocolError> {
        if self.mode() != BrokerMode::Recovering {
            self.report(Anomaly::UnexpectedCrashEnd);
            return Ok(());
        }

        info!(node = self.id, "recovering, querying neighbors");
        let neighbors: Vec<_> = self.neighbors().collect();
        for neighbor in neighbors {
            self.send(neighbor, Message::RecoveryInfoRequest);
        }

        // a node without neighbors has nobody to wait for
        if self.recovery_complete() {
            self.finish_recovery()?;
        }
        Ok(())
    }

    fn on_recovery_info_request(&mut self, from: NodeId) {
        let Some(holder) = self.holder else {
            debug!(node = self.id, from, "no holder known, cannot answer recovery query");
            return;
        };
        let has_request = !self.request_list.is_empty();
        self.send(from, Message::RecoveryInfoResponse { holder, has_request });
    }

    fn on_recovery_info_response(
        &mut self,
        from: NodeId,
        report: RecoveryReport,
    ) -> Result<(), ProtocolError> {
        if self.mode() != BrokerMode::Recovering {
            self.report(Anomaly::StaleRecoveryResponse { from });
            return Ok(());
        }

        self.recovery_info.insert(from, report);
        self.broker.clear_blacklist(from);
        debug!(node = self.id, from, holder = report.holder, has_request = report.has_request, "recovery info");

        if self.recovery_complete() {
            self.finish_recovery()?;
        }
        Ok(())
    }

    fn recovery_complete(&self) -> bool {
        self.neighbors.iter().all(|n| self.recovery_info.contains_key(n))
    }

    fn finish_recovery(&mut self) -> Result<(), ProtocolError> {
        let holder = self.decide_holder();
        self.holder = Some(holder);

        let owed: Vec<_> = self
            .recovery_info
            .iter()
            .filter(|(_, report)| report.holder == self.id && report.has_request)
            .map(|(&neighbor, _)| neighbor)
            .collect();
        for neighbor in owed {
            if !self.request_list.contains(&neighbor) {
                self.request_list.push_back(neighbor);
            }
        }

        if holder != self.id && !self.request_list.is_empty() {
            self.send(holder, Message::Request);
        }

        self.recovery_info.clear();
        info!(node = self.id, holder, requests = ?self.request_list, "recovered");
        self.resume_normal()?;

        if self.holds_token() && !self.inside_cs && !self.request_list.is_empty() {
            self.grant_to_head();
        }
        Ok(())
    }

    /// Exactly one neighbor points away from us unless the token is here.
    fn decide_holder(&self) -> NodeId {
        self.recovery_info
            .iter()
            .find(|(_, report)| report.holder != self.id)
            .map(|(&neighbor, _)| neighbor)
            .unwrap_or(self.id)
    }

    fn resume_normal(&mut self) -> Result<(), ProtocolError> {
        self.broker.enter_normal()?;
        self.drain_replay()
    }

    fn send(&mut self, to: NodeId, message: Message) {
        self.ready.messages.push(Outbound { to, message });
    }

    fn report(&mut self, anomaly: Anomaly) {
        self.ready.anomalies.push(anomaly);
    }
}
