//! Protocol messages exchanged between nodes and the driver.
//!
//! Every interaction with a node is one of the ten [`Message`] kinds below,
//! wrapped in an [`Envelope`] that records who sent it. Messages that a node
//! generates for itself (the critical-section timer) or that the driver issues
//! on a node's own behalf carry the node's own id as sender.

use std::fmt;

/// Identifier of a node; unique and stable for the node's lifetime.
pub type NodeId = u64;

/// The closed set of messages a node understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// Registers `id` as a tree neighbor. The send-capable handle travels
    /// alongside in the runtime mailbox, see [`crate::runtime::NodeHandle`].
    NeighborInit { id: NodeId },
    /// Makes the receiving node the initial token owner.
    TokenInject,
    /// Flood that tells each node which neighbor points towards the token.
    Init { holder: NodeId },
    /// The sender wants the critical section (directly or on behalf of its subtree).
    Request,
    /// Hands over the token, asking for it back when `requires_token_back` is set.
    Privilege { requires_token_back: bool },
    /// A recovering neighbor asks for our view of the tree.
    RecoveryInfoRequest,
    /// Reply to [`Message::RecoveryInfoRequest`].
    RecoveryInfoResponse { holder: NodeId, has_request: bool },
    /// Self-timer that ends the critical section.
    ExitCs,
    /// Driver command: simulate a crash.
    CrashBegin,
    /// Driver command: recover from a crash.
    CrashEnd,
}

/// Tag of a [`Message`] used by the broker's admission table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    NeighborInit,
    TokenInject,
    Init,
    Request,
    Privilege,
    RecoveryInfoRequest,
    RecoveryInfoResponse,
    ExitCs,
    CrashBegin,
    CrashEnd,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::NeighborInit { .. } => MessageKind::NeighborInit,
            Message::TokenInject => MessageKind::TokenInject,
            Message::Init { .. } => MessageKind::Init,
            Message::Request => MessageKind::Request,
            Message::Privilege { .. } => MessageKind::Privilege,
            Message::RecoveryInfoRequest => MessageKind::RecoveryInfoRequest,
            Message::RecoveryInfoResponse { .. } => MessageKind::RecoveryInfoResponse,
            Message::ExitCs => MessageKind::ExitCs,
            Message::CrashBegin => MessageKind::CrashBegin,
            Message::CrashEnd => MessageKind::CrashEnd,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::NeighborInit => "NeighborInit",
            MessageKind::TokenInject => "TokenInject",
            MessageKind::Init => "Init",
            MessageKind::Request => "Request",
            MessageKind::Privilege => "Privilege",
            MessageKind::RecoveryInfoRequest => "RecoveryInfoRequest",
            MessageKind::RecoveryInfoResponse => "RecoveryInfoResponse",
            MessageKind::ExitCs => "ExitCS",
            MessageKind::CrashBegin => "CrashBegin",
            MessageKind::CrashEnd => "CrashEnd",
        };
        f.write_str(name)
    }
}

/// A message together with the id of the node that sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub from: NodeId,
    pub message: Message,
}

impl Envelope {
    pub fn new(from: NodeId, message: Message) -> Self {
        Self { from, message }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }
}
