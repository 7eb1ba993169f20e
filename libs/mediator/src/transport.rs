//! Seams for channel/transport collaborators.
//!
//! Any channel name the assembler leaves open is fed or drained through
//! these traits; the engine never learns the wire format behind them.

use crate::error::StageFailure;
use crate::graph::{PipelineInput, PipelineOutput};
use crate::message::AnyMessage;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Inbound side of a transport: yields messages for an open channel.
#[async_trait]
pub trait MessageSource: Send {
    /// Next message from the transport; `None` completes the channel.
    async fn next_message(&mut self) -> Option<AnyMessage>;
}

/// Outbound side of a transport: receives messages from an open channel.
#[async_trait]
pub trait MessageOutlet: Send {
    async fn deliver(&mut self, message: AnyMessage) -> anyhow::Result<()>;

    /// Stream failures reach the outlet too; the default logs and keeps
    /// the binding alive.
    async fn deliver_failure(&mut self, failure: StageFailure) -> anyhow::Result<()> {
        warn!(%failure, "stream failure reached outlet");
        Ok(())
    }
}

/// Pump a source into an open inbound endpoint, honoring its credit.
pub fn bind_source(
    input: PipelineInput,
    mut source: impl MessageSource + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = source.next_message().await {
            if input.publish(message).await.is_err() {
                debug!(channel = %input.channel(), "pipeline input closed; source unbound");
                return;
            }
        }
        debug!(channel = %input.channel(), "source completed");
    })
}

/// Drain an open outbound endpoint into an outlet.
pub fn bind_outlet(
    mut output: PipelineOutput,
    mut outlet: impl MessageOutlet + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = output.recv().await {
            let delivered = match item {
                Ok(message) => outlet.deliver(message).await,
                Err(failure) => outlet.deliver_failure(failure).await,
            };
            if let Err(err) = delivered {
                warn!(channel = %output.channel(), %err, "outlet delivery failed; unbinding");
                return;
            }
        }
        debug!(channel = %output.channel(), "output completed");
    })
}
