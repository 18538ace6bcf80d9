//! Per-node admission gate in front of the protocol state machine.
//!
//! The broker tracks the node's operating mode and decides for every inbound
//! envelope whether it is handled now, parked until the node is back in
//! [`BrokerMode::Normal`], or discarded. Parked envelopes are replayed in the
//! order they arrived; the broker never reorders them.

use std::collections::{BTreeSet, VecDeque};

use crate::error::ProtocolError;
use crate::message::{Envelope, MessageKind, NodeId};

/// Operating mode of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerMode {
    /// Created, not yet reached by the token's `Init` flood.
    Uninitialized,
    /// Taking part in the protocol.
    Normal,
    /// Between `CrashBegin` and the end of the recovery handshake.
    Recovering,
}

/// What the broker does with an inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Dispatch,
    Buffer,
    Drop,
}

/// The mode × kind admission table.
///
/// `blacklisted` tells whether the sender is a neighbor that has not yet
/// answered the recovery query; it only matters while recovering.
pub fn admission(mode: BrokerMode, kind: MessageKind, blacklisted: bool) -> Admission {
    use MessageKind::*;

    match (mode, kind) {
        (BrokerMode::Uninitialized, NeighborInit | TokenInject | Init) => Admission::Dispatch,
        (BrokerMode::Uninitialized, _) => Admission::Buffer,
        (BrokerMode::Normal, _) => Admission::Dispatch,
        (BrokerMode::Recovering, CrashEnd) => Admission::Dispatch,
        (BrokerMode::Recovering, RecoveryInfoResponse) if blacklisted => Admission::Dispatch,
        (BrokerMode::Recovering, _) if blacklisted => Admission::Drop,
        (BrokerMode::Recovering, _) => Admission::Buffer,
    }
}

pub struct MessageBroker {
    node: NodeId,
    mode: BrokerMode,
    pending: VecDeque<Envelope>,
    replay: VecDeque<Envelope>,
    blacklist: BTreeSet<NodeId>,
}

impl MessageBroker {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            mode: BrokerMode::Uninitialized,
            pending: VecDeque::new(),
            replay: VecDeque::new(),
            blacklist: BTreeSet::new(),
        }
    }

    pub fn mode(&self) -> BrokerMode {
        self.mode
    }

    pub fn is_blacklisted(&self, id: NodeId) -> bool {
        self.blacklist.contains(&id)
    }

    pub fn blacklist(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.blacklist.iter().copied()
    }

    /// Number of envelopes waiting for the node to return to normal mode.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Gates one envelope. Buffered envelopes are kept by the broker; the
    /// caller only acts on [`Admission::Dispatch`].
    pub fn admit(&mut self, envelope: Envelope) -> Admission {
        let decision = admission(self.mode, envelope.kind(), self.is_blacklisted(envelope.from));
        if decision == Admission::Buffer {
            self.pending.push_back(envelope);
        }
        decision
    }

    /// Moves to normal mode and schedules every buffered envelope for replay.
    pub fn enter_normal(&mut self) -> Result<(), ProtocolError> {
        match self.mode {
            BrokerMode::Normal => return Err(self.illegal(BrokerMode::Normal, "already normal")),
            BrokerMode::Recovering if !self.blacklist.is_empty() => {
                return Err(self.illegal(
                    BrokerMode::Normal,
                    "neighbors still owe a recovery response",
                ));
            }
            BrokerMode::Uninitialized | BrokerMode::Recovering => {}
        }

        self.mode = BrokerMode::Normal;
        self.replay.extend(self.pending.drain(..));
        Ok(())
    }

    /// Moves to recovering mode, blacklisting every current neighbor.
    pub fn enter_recovering<I>(&mut self, neighbors: I) -> Result<(), ProtocolError>
    where
        I: IntoIterator<Item = NodeId>,
    {
        match self.mode {
            BrokerMode::Uninitialized => {
                return Err(self.illegal(BrokerMode::Recovering, "node never joined the protocol"));
            }
            BrokerMode::Recovering => {
                return Err(self.illegal(BrokerMode::Recovering, "already recovering"));
            }
            BrokerMode::Normal if !self.blacklist.is_empty() => {
                return Err(self.illegal(BrokerMode::Recovering, "blacklist not empty"));
            }
            BrokerMode::Normal => {}
        }

        self.mode = BrokerMode::Recovering;
        self.blacklist.extend(neighbors);
        Ok(())
    }

    /// Lifts the recovery blacklist for `id`. Returns whether it was listed.
    pub fn clear_blacklist(&mut self, id: NodeId) -> bool {
        self.blacklist.remove(&id)
    }

    /// Next envelope released by the last transition to normal mode.
    pub fn take_replay(&mut self) -> Option<Envelope> {
        self.replay.pop_front()
    }

    fn illegal(&self, to: BrokerMode, reason: &'static str) -> ProtocolError {
        ProtocolError::IllegalModeTransition {
            node: self.node,
            from: self.mode,
            to,
            reason,
        }
    }
}
