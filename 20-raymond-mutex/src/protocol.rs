//! Console command parsing for the interactive shell.
//!
//! Commands come from the terminal or from a script loaded with `source`.
//! They map one to one onto [`crate::cluster::Cluster`] operations, plus a few
//! meta-commands (`status`, `delay`, `source`, `help`, `exit`) that never reach
//! a node.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};

use crate::message::NodeId;

pub const USAGE: &str = "\
Setup:
  create <n>                 create n more nodes
  connect <a> <b>            make nodes a and b neighbors
  inject <n>                 inject the token into node n
Simulation:
  request <a>[,<b>...]       ask nodes to enter the critical section (alias: r)
  crash <n>                  crash node n, or revive it if it is the one down
  rft <from> <to>            deliver a request to <to> as if sent by <from>
  force_crash <n>            crash node n even if another node is down
  force_recovery <n>         send a crash end to node n
Utility:
  status [n]                 print node state (alias: s)
  delay <ms>                 pause before reading the next command
  source <file>              run the commands in file
  help                       print this reference (alias: h)
  exit                       shut down (alias: e)";

#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Create { count: u64 },
    Connect { a: NodeId, b: NodeId },
    Inject { node: NodeId },
    Request { nodes: Vec<NodeId> },
    Crash { node: NodeId },
    RequestFrom { from: NodeId, to: NodeId },
    ForceCrash { node: NodeId },
    ForceRecovery { node: NodeId },
    Delay { duration: Duration },
    Status { node: Option<NodeId> },
    Source { path: PathBuf },
    Help,
    Exit,
}

impl ConsoleCommand {
    /// Parses one line of input.
    ///
    /// Returns `Ok(None)` for blank lines and `#` comments, which scripts use
    /// freely. Command names are case-insensitive.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(None);
        }

        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        let cmd = parts[0].to_lowercase();
        let normalized_cmd = match cmd.as_str() {
            "r" => "request",
            "s" => "status",
            "h" => "help",
            "e" | "quit" => "exit",
            other => other,
        };
        let args = &parts[1..];

        let command = match (normalized_cmd, args) {
            ("help", []) => ConsoleCommand::Help,
            ("exit", []) => ConsoleCommand::Exit,
            ("status", []) => ConsoleCommand::Status { node: None },
            ("status", [node]) => ConsoleCommand::Status {
                node: Some(parse_id(node)?),
            },
            ("create", [count]) => ConsoleCommand::Create {
                count: count
                    .parse()
                    .with_context(|| format!("invalid node count {count:?}"))?,
            },
            ("connect", [a, b]) => ConsoleCommand::Connect {
                a: parse_id(a)?,
                b: parse_id(b)?,
            },
            ("inject", [node]) => ConsoleCommand::Inject {
                node: parse_id(node)?,
            },
            // `request 1, 2,3` is fine: the list is rejoined before splitting.
            ("request", [_, ..]) => ConsoleCommand::Request {
                nodes: args
                    .concat()
                    .split(',')
                    .map(parse_id)
                    .collect::<Result<_>>()?,
            },
            ("crash", [node]) => ConsoleCommand::Crash {
                node: parse_id(node)?,
            },
            ("rft", [from, to]) => ConsoleCommand::RequestFrom {
                from: parse_id(from)?,
                to: parse_id(to)?,
            },
            ("force_crash", [node]) => ConsoleCommand::ForceCrash {
                node: parse_id(node)?,
            },
            ("force_recovery", [node]) => ConsoleCommand::ForceRecovery {
                node: parse_id(node)?,
            },
            ("delay", [millis]) => ConsoleCommand::Delay {
                duration: Duration::from_millis(
                    millis
                        .parse()
                        .with_context(|| format!("invalid delay {millis:?}"))?,
                ),
            },
            ("source", [path]) => ConsoleCommand::Source {
                path: PathBuf::from(path),
            },
            ("create", _) => bail!("usage: create <n>"),
            ("connect", _) => bail!("usage: connect <a> <b>"),
            ("inject", _) => bail!("usage: inject <n>"),
            ("request", _) => bail!("usage: request <a>[,<b>...]"),
            ("crash", _) => bail!("usage: crash <n>"),
            ("rft", _) => bail!("usage: rft <from> <to>"),
            ("force_crash", _) => bail!("usage: force_crash <n>"),
            ("force_recovery", _) => bail!("usage: force_recovery <n>"),
            ("delay", _) => bail!("usage: delay <ms>"),
            ("source", _) => bail!("usage: source <file>"),
            ("status", _) => bail!("usage: status [n]"),
            _ => return Err(anyhow!("unknown command {:?}. Try: help", parts[0])),
        };
        Ok(Some(command))
    }
}

fn parse_id(raw: &str) -> Result<NodeId> {
    raw.trim()
        .parse()
        .with_context(|| format!("invalid node id {raw:?}"))
}
