//! Launcher trait for executing commands

use crate::command::Command;
use crate::error::Result;
use crate::event::{ProcessEvent, ProcessEventType};
use crate::process::{ExitResult, ProcessHandle};
use async_trait::async_trait;
use futures::stream::Stream;

/// A launcher that can execute commands in a specific context
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    /// The event stream type this launcher produces
    type EventStream: Stream<Item = ProcessEvent> + Send + Unpin;

    /// The process handle type this launcher produces
    type Handle: ProcessHandle;

    /// Launch a command, returning its event stream and control handle
    async fn launch(&self, command: Command) -> Result<(Self::EventStream, Self::Handle)>;

    /// Execute a command and wait for it to complete, capturing output
    async fn execute(&self, command: Command) -> Result<ExitResult> {
        use futures::StreamExt;

        let (mut events, mut handle) = self.launch(command).await?;
        let mut stdout = String::new();
        let mut stderr = String::new();

        while let Some(event) = events.next().await {
            let sink = match event.event_type {
                ProcessEventType::Stdout => &mut stdout,
                ProcessEventType::Stderr => &mut stderr,
                ProcessEventType::Started { .. } => continue,
            };
            if let Some(data) = &event.data {
                sink.push_str(data);
                sink.push('\n');
            }
        }

        let status = handle.wait().await?;
        Ok(ExitResult {
            status,
            stdout,
            stderr,
        })
    }
}
