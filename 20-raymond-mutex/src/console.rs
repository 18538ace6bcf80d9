//! Line-oriented shell over a [`Cluster`].
//!
//! Reads commands from any async line source (stdin in the binary), runs
//! them against the cluster and writes human-readable feedback. Scripts loaded
//! with `source` are played in full before input is read again.

use std::collections::VecDeque;
use std::path::Path;

use anyhow::Result;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::cluster::{Cluster, CrashAction};
use crate::protocol::{ConsoleCommand, USAGE};

const PROMPT: &str = "# ";

/// Whether the shell keeps reading after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Console<W> {
    cluster: Cluster,
    out: W,
    scripted: VecDeque<String>,
}

impl<W: AsyncWrite + Unpin> Console<W> {
    pub fn new(cluster: Cluster, out: W) -> Self {
        Self {
            cluster,
            out,
            scripted: VecDeque::new(),
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn into_parts(self) -> (Cluster, W) {
        (self.cluster, self.out)
    }

    /// Queues the lines of a script ahead of interactive input.
    pub async fn source(&mut self, path: &Path) -> io::Result<()> {
        match tokio::fs::read_to_string(path).await {
            Ok(script) => {
                for line in script.lines().rev() {
                    self.scripted.push_front(line.to_string());
                }
                self.write_line(&format!("Sourcing commands from file {}", path.display()))
                    .await
            }
            Err(err) => {
                self.write_line(&format!("Cannot read {}: {err}", path.display()))
                    .await
            }
        }
    }

    /// Runs until `exit` or until `input` is exhausted.
    pub async fn run<R: AsyncBufRead + Unpin>(&mut self, input: R) -> Result<()> {
        let mut lines = input.lines();
        loop {
            let line = match self.scripted.pop_front() {
                Some(line) => line,
                None => {
                    self.write_prompt().await?;
                    match lines.next_line().await? {
                        Some(line) => line,
                        None => break,
                    }
                }
            };
            if self.execute_line(&line).await? == Flow::Exit {
                break;
            }
        }
        Ok(())
    }

    /// Parses and runs one line. Bad input and refused operations are
    /// reported on the output; only output failures are returned.
    pub async fn execute_line(&mut self, line: &str) -> io::Result<Flow> {
        let command = match ConsoleCommand::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(Flow::Continue),
            Err(err) => {
                self.write_line(&format!("{err:#}")).await?;
                return Ok(Flow::Continue);
            }
        };
        debug!(?command, "console command");

        match self.execute(command).await {
            Ok(flow) => Ok(flow),
            Err(err) => {
                self.write_line(&format!("{err:#}")).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn execute(&mut self, command: ConsoleCommand) -> Result<Flow> {
        match command {
            ConsoleCommand::Create { count } => {
                for id in self.cluster.create(count)? {
                    self.write_line(&format!("Created node {id}")).await?;
                }
            }
            ConsoleCommand::Connect { a, b } => {
                self.cluster.connect(a, b)?;
                self.write_line(&format!("Nodes {a} and {b} are now neighbors"))
                    .await?;
            }
            ConsoleCommand::Inject { node } => {
                self.cluster.inject(node)?;
                self.write_line(&format!("Injected token to {node}")).await?;
            }
            ConsoleCommand::Request { nodes } => {
                self.cluster.request(&nodes)?;
                for node in nodes {
                    self.write_line(&format!("Sent request message to node {node}"))
                        .await?;
                }
            }
            ConsoleCommand::Crash { node } => {
                let line = match self.cluster.crash(node)? {
                    CrashAction::Crashed => format!("Crashing node {node}"),
                    CrashAction::Revived => format!("Reviving node {node}"),
                };
                self.write_line(&line).await?;
            }
            ConsoleCommand::RequestFrom { from, to } => {
                self.cluster.request_from(from, to)?;
                self.write_line(&format!("Injected request from {from} to {to}"))
                    .await?;
            }
            ConsoleCommand::ForceCrash { node } => {
                self.cluster.force_crash(node)?;
                self.write_line(&format!("Forcing crash of node {node}"))
                    .await?;
            }
            ConsoleCommand::ForceRecovery { node } => {
                self.cluster.force_recovery(node)?;
                self.write_line(&format!("Forcing recovery of node {node}"))
                    .await?;
            }
            ConsoleCommand::Delay { duration } => tokio::time::sleep(duration).await,
            ConsoleCommand::Status { node: Some(node) } => {
                let status = self.cluster.status(node).await?;
                self.write_line(&status.to_string()).await?;
            }
            ConsoleCommand::Status { node: None } => {
                if self.cluster.is_empty() {
                    self.write_line("No nodes yet").await?;
                }
                for status in self.cluster.statuses().await? {
                    self.write_line(&status.to_string()).await?;
                }
            }
            ConsoleCommand::Source { path } => self.source(&path).await?,
            ConsoleCommand::Help => self.write_line(USAGE).await?,
            ConsoleCommand::Exit => return Ok(Flow::Exit),
        }
        Ok(Flow::Continue)
    }

    async fn write_prompt(&mut self) -> io::Result<()> {
        self.out.write_all(PROMPT.as_bytes()).await?;
        self.out.flush().await
    }

    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.out.write_all(line.as_bytes()).await?;
        self.out.write_all(b"\n").await?;
        self.out.flush().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::ClusterConfig;

    fn console() -> Console<Vec<u8>> {
        Console::new(Cluster::new(ClusterConfig::default()), Vec::new())
    }

    fn output(console: Console<Vec<u8>>) -> String {
        String::from_utf8(console.into_parts().1).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn runs_a_session_until_exit() -> Result<()> {
        let mut console = console();
        let input = "create 3\nconnect 0 1\nconnect 1 2\ninject 1\nrequest 2\ndelay 100\nstatus 2\nexit\ncreate 1\n";
        console.run(input.as_bytes()).await?;

        assert_eq!(console.cluster().len(), 3);
        let out = output(console);
        assert!(out.contains("Created node 2"));
        assert!(out.contains("Injected token to 1"));
        assert!(out.contains("(2)   token: Y   holder: 2   requests: []   CS: Y"));
        Ok(())
    }

    #[tokio::test]
    async fn refusals_are_reported_and_the_shell_goes_on() -> Result<()> {
        let mut console = console();
        let input = "create 2\ninject 0\nfrobnicate\nconnect 0 0\ncrash 5\nstatus\n";
        console.run(input.as_bytes()).await?;

        let out = output(console);
        assert!(out.contains("cannot inject the token"));
        assert!(out.contains("unknown command"));
        assert!(out.contains("cannot be its own neighbor"));
        assert!(out.contains("node id 5 not valid"));
        assert!(out.contains("(0)   token: N   holder: -"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn sourced_script_runs_before_further_input() -> Result<()> {
        let path = std::env::temp_dir().join(format!("dmx-script-{}.txt", std::process::id()));
        tokio::fs::write(&path, "# sample tree\ncreate 2\nconnect 0 1\ninject 0\n").await?;

        let mut console = console();
        let input = format!("source {}\nrequest 1\ndelay 50\nstatus 1\n", path.display());
        console.run(input.as_bytes()).await?;
        tokio::fs::remove_file(&path).await?;

        let out = output(console);
        assert!(out.contains("Sourcing commands from file"));
        assert!(out.contains("(1)   token: Y   holder: 1   requests: []   CS: Y"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_script_is_reported() -> Result<()> {
        let mut console = console();
        console.execute_line("source /nonexistent/dmx.txt").await?;
        assert!(output(console).contains("Cannot read /nonexistent/dmx.txt"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn crash_toggle_is_echoed() -> Result<()> {
        let mut console = console();
        console
            .run("create 2\nconnect 0 1\ninject 0\ndelay 10\ncrash 1\ncrash 0\ncrash 1\n".as_bytes())
            .await?;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let out = output(console);
        assert!(out.contains("Crashing node 1"));
        assert!(out.contains("node 1 is already crashed"));
        assert!(out.contains("Reviving node 1"));
        Ok(())
    }
}
