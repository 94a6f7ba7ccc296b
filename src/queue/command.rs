use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::handler::{HandlerTable, OperationHandler};
use super::kind::OperationKind;
use crate::storage::Payload;

/// Handler that delivers an operation by running a shell command.
///
/// The payload is written to the command's stdin and the kind tag is exported
/// as `TOURQ_OPERATION_KIND`. Exit status 0 means delivered; anything else,
/// or running past the timeout, is a failed attempt.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    command: String,
    kind: &'static str,
    timeout: Option<Duration>,
}

impl CommandHandler {
    pub fn new(command: impl Into<String>, kind: &'static str) -> Self {
        Self {
            command: command.into(),
            kind,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// A table routing every kind in `kinds` to `command`.
    pub fn table<K: OperationKind>(
        command: &str,
        kinds: &[K],
        timeout: Option<Duration>,
    ) -> HandlerTable<K> {
        let mut table = HandlerTable::new();
        for kind in kinds {
            let handler = CommandHandler::new(command, kind.tag()).with_timeout(timeout);
            table.register(*kind, std::sync::Arc::new(handler));
        }
        table
    }

    async fn run(&self, payload: &Payload) -> anyhow::Result<()> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("TOURQ_OPERATION_KIND", self.kind)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", self.command))?;

        // Feed stdin while the child runs and its stderr is drained, so a
        // chatty command cannot block on a full pipe.
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok::<(), std::io::Error>(());
            };
            match stdin.write_all(payload.as_bytes()).await {
                // The command exited without reading everything; its exit
                // status decides the outcome.
                Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
        };

        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.context("failed to wait for command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("'{}' exited with {}: {}", self.command, output.status, stderr.trim());
        }
        fed.context("failed to write payload to command stdin")?;
        Ok(())
    }
}

#[async_trait]
impl OperationHandler for CommandHandler {
    async fn handle(&self, payload: &Payload) -> anyhow::Result<()> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run(payload))
                .await
                .with_context(|| format!("'{}' timed out after {:?}", self.command, limit))?,
            None => self.run(payload).await,
        }
    }
}
