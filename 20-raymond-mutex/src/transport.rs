//! Links between node workers.
//!
//! Every directed edge of the tree gets its own [`Link`]: an unbounded queue
//! drained by a dedicated task that waits out the configured delay and then
//! drops the envelope into the peer's mailbox. One task per link means a slow
//! message holds back the messages queued behind it on the same link, so
//! per-link order survives any delay strategy, while different links stay
//! independent of each other.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::debug;

use crate::message::{Envelope, NodeId};
use crate::runtime::NodeHandle;

/// Decides how long a message waits before it is handed to its recipient.
pub trait DelayStrategy: Send + Sync {
    fn delay(&self, from: NodeId, to: NodeId) -> Duration;
}

/// Deliver as soon as the link task gets scheduled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDelay;

impl DelayStrategy for NoDelay {
    fn delay(&self, _from: NodeId, _to: NodeId) -> Duration {
        Duration::ZERO
    }
}

/// The same delay on every link.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay(pub Duration);

impl DelayStrategy for FixedDelay {
    fn delay(&self, _from: NodeId, _to: NodeId) -> Duration {
        self.0
    }
}

/// Uniform delay in `0..=max`, drawn from a seeded generator so fault
/// injection runs can be reproduced.
pub struct RandomDelay {
    max_millis: u64,
    rng: Mutex<StdRng>,
}

impl RandomDelay {
    pub fn new(max: Duration, seed: u64) -> Self {
        Self {
            max_millis: u64::try_from(max.as_millis()).unwrap_or(u64::MAX),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl DelayStrategy for RandomDelay {
    fn delay(&self, _from: NodeId, _to: NodeId) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        Duration::from_millis(rng.gen_range(0..=self.max_millis))
    }
}

/// Outbound half of one directed tree edge.
pub struct Link {
    to: NodeId,
    queue: mpsc::UnboundedSender<Envelope>,
}

impl Link {
    /// Starts the forwarding task for `from -> target`.
    pub fn spawn(from: NodeId, target: NodeHandle, delay: Arc<dyn DelayStrategy>) -> Self {
        let to = target.id();
        let (queue, mut rx) = mpsc::unbounded_channel::<Envelope>();

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let wait = delay.delay(from, to);
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                if target.send(envelope).is_err() {
                    debug!(from, to, "peer mailbox closed, link shutting down");
                    break;
                }
            }
        });

        Self { to, queue }
    }

    pub fn to(&self) -> NodeId {
        self.to
    }

    /// Enqueues without waiting. Returns `false` once the link task is gone.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.queue.send(envelope).is_ok()
    }
}
