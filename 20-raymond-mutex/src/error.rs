//! Error taxonomy for the protocol.
//!
//! [`ProtocolError`] covers conditions that point at a wiring or
//! implementation bug; the node refuses to go on with the message at hand.
//! [`Anomaly`] covers races the protocol absorbs on its own: the message is
//! dropped and the condition is only logged.

use thiserror::Error;

use crate::broker::BrokerMode;
use crate::message::{MessageKind, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("node {node}: {kind} from {from}, which is not a neighbor")]
    UnknownSender {
        node: NodeId,
        from: NodeId,
        kind: MessageKind,
    },
    #[error("node {node}: illegal broker transition {from:?} -> {to:?}: {reason}")]
    IllegalModeTransition {
        node: NodeId,
        from: BrokerMode,
        to: BrokerMode,
        reason: &'static str,
    },
}

impl ProtocolError {
    /// Whether the node must stop processing altogether.
    ///
    /// An unknown sender only spoils one message; a broken mode transition
    /// means local state can no longer be trusted.
    pub fn is_fatal_for_node(&self) -> bool {
        matches!(self, ProtocolError::IllegalModeTransition { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Anomaly {
    #[error("duplicate request from {requester}, already queued")]
    DuplicateRequest { requester: NodeId },
    #[error("stale request from current holder {holder}")]
    StaleRequestFromHolder { holder: NodeId },
    #[error("crash refused while inside the critical section")]
    CrashWhileInCs,
    #[error("privilege received with an empty request list")]
    PrivilegeWithEmptyQueue,
    #[error("repeated {kind} from {from} ignored, node already initialized")]
    RepeatedInit { from: NodeId, kind: MessageKind },
    #[error("crash end received while not recovering")]
    UnexpectedCrashEnd,
    #[error("recovery response from {from} outside a recovery episode")]
    StaleRecoveryResponse { from: NodeId },
    #[error("{kind} from blacklisted neighbor {from} dropped during recovery")]
    DroppedDuringRecovery { from: NodeId, kind: MessageKind },
    #[error("critical section timer fired while outside the critical section")]
    SpuriousExitCs,
}
