//! Raymond's tree-based token mutual exclusion, extended with crash recovery.
//!
//! Nodes form a fixed tree. Exactly one token circulates; each node keeps a
//! `holder` pointer towards it and a FIFO of neighbors (or itself) waiting
//! for it. A crashed node rebuilds that state by asking its neighbors, while a
//! per-node broker holds back traffic the node is not ready to handle.
//!
//! # Architecture
//!
//! - **Node workers**: one tokio task per node owns its state machine and
//!   consumes a single mailbox, so protocol state is never shared or locked.
//! - **Links**: one forwarding task per directed edge keeps per-link order
//!   while applying a pluggable delay.
//! - **Driver**: builds the tree, injects the token and issues requests and
//!   crashes, either from code or from the `dmx` console.
//!
//! # Modules
//!
//! - [`message`]: the ten message kinds and their envelope
//! - [`error`]: fatal protocol errors and recoverable anomalies
//! - [`broker`]: mode-based admission, buffering and replay
//! - [`node`]: the pure protocol state machine
//! - [`transport`]: delay strategies and per-link forwarding
//! - [`runtime`]: node workers and their handles
//! - [`topology`]: tree validation for the driver
//! - [`cluster`]: the driver
//! - [`config`]: cluster-wide settings
//! - [`protocol`]: console command parsing
//! - [`console`]: the interactive shell
//! - [`cli`]: command-line arguments of the `dmx` binary

pub mod broker;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod console;
pub mod error;
pub mod message;
pub mod node;
pub mod protocol;
pub mod runtime;
pub mod topology;
pub mod transport;
