//! Pipeline assembly: classify every registration, join channel names,
//! and activate the resulting graph.
//!
//! Linking is a pure name-based join. Channel names left unmatched are
//! not errors; they become open endpoints for transport collaborators.
//! The channel mapping is read-only once assembly completes.

use crate::ack::AckPolicy;
use crate::config::{Cardinality, PipelineConfig, DEFAULT_CREDIT};
use crate::descriptor::Concurrency;
use crate::error::{MediatorError, MediatorResult, StageFailure};
use crate::handler::Invoker;
use crate::message::AnyMessage;
use crate::registry::MethodRegistration;
use crate::shape::{classify, effective_policy, validate_policy, Shape};
use crate::stage::{ItemReceiver, ItemSender, ProcessingStage, StageHandle, StageItem};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// The stages attached to one channel name.
#[derive(Debug, Clone, Default)]
pub struct ChannelEnds {
    /// Methods publishing to the channel
    pub producers: Vec<String>,
    /// Methods consuming from the channel
    pub consumers: Vec<String>,
}

struct StagePlan {
    name: String,
    shape: Shape,
    policy: AckPolicy,
    credit: usize,
    tolerant: bool,
    inbound: Option<String>,
    outbound: Option<String>,
    invoker: Invoker,
}

/// Assembled but not yet running pipeline.
pub struct PipelineGraph {
    stages: Vec<StagePlan>,
    channels: HashMap<String, ChannelEnds>,
}

/// Classify and link a set of registrations into a pipeline graph.
///
/// Every failing method is reported, in registration order; any failure
/// aborts startup of this pipeline before a single stage runs.
pub fn assemble(
    registrations: Vec<MethodRegistration>,
    config: &PipelineConfig,
) -> MediatorResult<PipelineGraph> {
    let mut errors = Vec::new();
    let mut stages: Vec<StagePlan> = Vec::new();
    let mut channels: HashMap<String, ChannelEnds> = HashMap::new();
    let mut names = HashSet::new();

    for registration in registrations {
        let (descriptor, handler) = registration.into_parts();
        let name = descriptor.name().to_string();
        if !names.insert(name.clone()) {
            errors.push(MediatorError::invalid_config(format!(
                "duplicate method name `{name}`"
            )));
            continue;
        }
        let shape = match classify(&descriptor) {
            Ok(shape) => shape,
            Err(err) => {
                errors.push(err);
                continue;
            }
        };
        let stage_config = config.stage(&name);
        let policy = effective_policy(shape, descriptor.ack_policy(), stage_config.ack_policy);
        if let Err(err) = validate_policy(shape, policy, &name) {
            errors.push(err);
            continue;
        }
        if let Some(channel) = descriptor.inbound() {
            channels
                .entry(channel.to_string())
                .or_default()
                .consumers
                .push(name.clone());
        }
        if let Some(channel) = descriptor.outbound() {
            channels
                .entry(channel.to_string())
                .or_default()
                .producers
                .push(name.clone());
        }
        let declared = stage_config
            .concurrency
            .unwrap_or_else(|| descriptor.concurrency());
        let tolerant = shape.implicitly_tolerant() || declared == Concurrency::Tolerant;
        debug!(method = %name, shape = %shape, ?policy, tolerant, "method classified");
        stages.push(StagePlan {
            name: name.clone(),
            shape,
            policy,
            credit: stage_config.credit.max(1),
            tolerant,
            inbound: descriptor.inbound().map(String::from),
            outbound: descriptor.outbound().map(String::from),
            invoker: Invoker::new(name, handler),
        });
    }

    for (channel, ends) in &channels {
        if ends.producers.len() > 1 && config.cardinality(channel) == Cardinality::Exclusive {
            errors.push(MediatorError::link(
                channel,
                format!(
                    "producers `{}` and `{}` both claim exclusive ownership",
                    ends.producers[0], ends.producers[1]
                ),
            ));
        }
        if ends.consumers.len() > 1 {
            errors.push(MediatorError::link(
                channel,
                format!(
                    "consumers `{}` and `{}` both claim the inbound endpoint; \
                     fan-out belongs to an external channel policy",
                    ends.consumers[0], ends.consumers[1]
                ),
            ));
        }
    }

    if errors.len() == 1 {
        return Err(errors.remove(0));
    }
    if !errors.is_empty() {
        return Err(MediatorError::Wiring(errors));
    }
    Ok(PipelineGraph { stages, channels })
}

impl PipelineGraph {
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn shape_of(&self, method: &str) -> Option<Shape> {
        self.stages
            .iter()
            .find(|s| s.name == method)
            .map(|s| s.shape)
    }

    /// Whether a stage may run overlapping invocations (declared, or
    /// implicit for stream shapes)
    pub fn is_concurrency_tolerant(&self, method: &str) -> Option<bool> {
        self.stages
            .iter()
            .find(|s| s.name == method)
            .map(|s| s.tolerant)
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    pub fn producers_of(&self, channel: &str) -> &[String] {
        self.channels
            .get(channel)
            .map(|ends| ends.producers.as_slice())
            .unwrap_or(&[])
    }

    pub fn consumers_of(&self, channel: &str) -> &[String] {
        self.channels
            .get(channel)
            .map(|ends| ends.consumers.as_slice())
            .unwrap_or(&[])
    }

    /// Exactly one internal producer and one internal consumer
    pub fn is_direct_link(&self, channel: &str) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|ends| ends.producers.len() == 1 && ends.consumers.len() == 1)
    }

    /// Channels consumed internally with no internal producer; an external
    /// source must feed them.
    pub fn open_inbound(&self) -> Vec<&str> {
        let mut open: Vec<&str> = self
            .channels
            .iter()
            .filter(|(_, ends)| ends.producers.is_empty() && !ends.consumers.is_empty())
            .map(|(name, _)| name.as_str())
            .collect();
        open.sort_unstable();
        open
    }

    /// Channels produced internally with no internal consumer; an external
    /// outlet must drain them.
    pub fn open_outbound(&self) -> Vec<&str> {
        let mut open: Vec<&str> = self
            .channels
            .iter()
            .filter(|(_, ends)| ends.consumers.is_empty() && !ends.producers.is_empty())
            .map(|(name, _)| name.as_str())
            .collect();
        open.sort_unstable();
        open
    }

    /// Spawn every stage and hand out the open endpoints.
    pub fn activate(self) -> RunningPipeline {
        let PipelineGraph { stages, channels } = self;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut channel_tx: HashMap<String, ItemSender> = HashMap::new();
        let mut channel_rx: HashMap<String, ItemReceiver> = HashMap::new();
        for (channel, ends) in &channels {
            let capacity = ends
                .consumers
                .first()
                .and_then(|name| stages.iter().find(|s| s.name == *name))
                .map(|s| s.credit)
                .unwrap_or(DEFAULT_CREDIT);
            let (tx, rx) = mpsc::channel(capacity.max(1));
            channel_tx.insert(channel.clone(), tx);
            channel_rx.insert(channel.clone(), rx);
        }

        let mut ready = Vec::new();
        for plan in stages {
            let mut stage =
                ProcessingStage::new(plan.name, plan.shape, plan.policy, plan.invoker);
            if let Some(channel) = &plan.inbound {
                if let Some(rx) = channel_rx.remove(channel) {
                    stage.attach_inbound(rx);
                }
            }
            if let Some(channel) = &plan.outbound {
                if let Some(tx) = channel_tx.get(channel) {
                    stage.attach_outbound(tx.clone());
                }
            }
            ready.push(stage);
        }

        let mut inputs = HashMap::new();
        let mut outputs = HashMap::new();
        for (channel, ends) in &channels {
            if ends.producers.is_empty() && !ends.consumers.is_empty() {
                if let Some(tx) = channel_tx.remove(channel) {
                    inputs.insert(
                        channel.clone(),
                        PipelineInput {
                            channel: channel.clone(),
                            tx,
                        },
                    );
                }
            }
            if ends.consumers.is_empty() && !ends.producers.is_empty() {
                if let Some(rx) = channel_rx.remove(channel) {
                    outputs.insert(
                        channel.clone(),
                        PipelineOutput {
                            channel: channel.clone(),
                            rx,
                        },
                    );
                }
            }
        }
        // Internal links keep only the clones held by their stages; the
        // originals must drop so channel closure propagates.
        drop(channel_tx);
        drop(channel_rx);

        let handles: Vec<StageHandle> = ready
            .into_iter()
            .map(|stage| stage.spawn(shutdown_rx.clone()))
            .collect();
        info!(
            stages = handles.len(),
            inputs = inputs.len(),
            outputs = outputs.len(),
            "pipeline activated"
        );

        RunningPipeline {
            inputs,
            outputs,
            handles,
            shutdown: shutdown_tx,
        }
    }
}

impl std::fmt::Debug for PipelineGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineGraph")
            .field("stages", &self.stages.len())
            .field("channels", &self.channels)
            .finish()
    }
}

/// Publishing side of an open channel, for transport collaborators.
/// Sends honor the consuming stage's credit.
#[derive(Clone)]
pub struct PipelineInput {
    channel: String,
    tx: ItemSender,
}

impl PipelineInput {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publish a message, waiting for credit.
    pub async fn publish(&self, message: AnyMessage) -> MediatorResult<()> {
        match self.tx.send(Ok(message)).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(item)) => {
                if let Ok(message) = item {
                    message.acknowledgment().resolve_if_pending(
                        crate::ack::AckOutcome::Nacked(crate::error::nack_cause(
                            anyhow::anyhow!("channel `{}` is closed", self.channel),
                        )),
                    );
                }
                Err(MediatorError::ChannelClosed {
                    channel: self.channel.clone(),
                })
            }
        }
    }

    /// Signal a transport-side failure into the channel.
    pub async fn fail(&self, failure: StageFailure) -> MediatorResult<()> {
        self.tx
            .send(Err(failure))
            .await
            .map_err(|_| MediatorError::ChannelClosed {
                channel: self.channel.clone(),
            })
    }
}

impl std::fmt::Debug for PipelineInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineInput")
            .field("channel", &self.channel)
            .finish()
    }
}

/// Consuming side of an open channel, for transport collaborators.
pub struct PipelineOutput {
    channel: String,
    rx: ItemReceiver,
}

impl PipelineOutput {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next item; `None` when the producing side completed.
    pub async fn recv(&mut self) -> Option<StageItem> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> BoxStream<'static, StageItem> {
        futures::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()
    }
}

impl std::fmt::Debug for PipelineOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOutput")
            .field("channel", &self.channel)
            .finish()
    }
}

/// An activated pipeline: open endpoints plus the stage tasks.
pub struct RunningPipeline {
    inputs: HashMap<String, PipelineInput>,
    outputs: HashMap<String, PipelineOutput>,
    handles: Vec<StageHandle>,
    shutdown: watch::Sender<bool>,
}

impl RunningPipeline {
    /// Open inbound endpoint for a channel, if one exists
    pub fn input(&self, channel: &str) -> Option<PipelineInput> {
        self.inputs.get(channel).cloned()
    }

    /// Take the open outbound endpoint for a channel
    pub fn take_output(&mut self, channel: &str) -> Option<PipelineOutput> {
        self.outputs.remove(channel)
    }

    pub fn input_channels(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.inputs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn output_channels(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.outputs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.handles.iter().map(StageHandle::name).collect()
    }

    /// Tear the pipeline down: every stage nacks what it holds and stops.
    pub async fn shutdown(mut self) {
        info!(stages = self.handles.len(), "pipeline shutting down");
        let _ = self.shutdown.send(true);
        self.inputs.clear();
        self.outputs.clear();
        for handle in self.handles.drain(..) {
            handle.join().await;
        }
    }
}

impl std::fmt::Debug for RunningPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningPipeline")
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("stages", &self.handles.len())
            .finish()
    }
}
