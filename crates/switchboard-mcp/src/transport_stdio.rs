//! MCP stdio transport.
//!
//! Spawns the MCP server as a child process and speaks line-delimited
//! JSON-RPC over its stdin/stdout. Stderr is drained to the log so a
//! misbehaving server is visible without attaching a debugger.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use switchboard_types::errors::SwitchboardError;
use switchboard_types::messages::JsonRpcMessage;
use switchboard_types::traits::McpTransport;

/// Stdio transport: one child process per connection.
#[derive(Debug)]
pub struct McpStdioTransport {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    connected: bool,
}

impl McpStdioTransport {
    /// Spawn the configured command and wire up its pipes.
    pub fn spawn(command: &str, args: &[String]) -> Result<Self, SwitchboardError> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SwitchboardError::McpTransport(format!("failed to spawn '{command}': {e}"))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            SwitchboardError::McpTransport("child process has no stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SwitchboardError::McpTransport("child process has no stdout".to_string())
        })?;

        // Drain stderr into the log in the background.
        if let Some(stderr) = child.stderr.take() {
            let name = command.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %name, "mcp stderr: {line}");
                }
            });
        }

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            connected: true,
        })
    }
}

#[async_trait]
impl McpTransport for McpStdioTransport {
    async fn send(&mut self, message: JsonRpcMessage) -> Result<(), SwitchboardError> {
        if !self.connected {
            return Err(SwitchboardError::McpTransport(
                "transport is closed".to_string(),
            ));
        }

        let mut line = serde_json::to_string(&message)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await.map_err(|e| {
            self.connected = false;
            SwitchboardError::McpTransport(format!("stdin write failed: {e}"))
        })?;
        self.stdin.flush().await.map_err(|e| {
            self.connected = false;
            SwitchboardError::McpTransport(format!("stdin flush failed: {e}"))
        })
    }

    async fn recv(&mut self) -> Result<JsonRpcMessage, SwitchboardError> {
        if !self.connected {
            return Err(SwitchboardError::McpTransport(
                "transport is closed".to_string(),
            ));
        }

        let mut line = String::new();
        loop {
            line.clear();
            let read = self.stdout.read_line(&mut line).await.map_err(|e| {
                self.connected = false;
                SwitchboardError::McpTransport(format!("stdout read failed: {e}"))
            })?;
            if read == 0 {
                self.connected = false;
                return Err(SwitchboardError::McpTransport(
                    "child process closed stdout".to_string(),
                ));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRpcMessage>(trimmed) {
                Ok(msg) => return Ok(msg),
                Err(e) => {
                    // Servers sometimes print banners on stdout before the
                    // first frame; skip anything that is not JSON-RPC.
                    tracing::warn!(error = %e, "skipping non-JSON-RPC stdout line");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), SwitchboardError> {
        self.connected = false;
        let _ = self.stdin.shutdown().await;
        let _ = self.child.kill().await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
