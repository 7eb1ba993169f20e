//! Processing stages: one spawned task per classified method.
//!
//! A stage consumes its inbound endpoint under credit-based backpressure
//! (bounded channel capacity), invokes the user method sequentially for
//! 1:1 shapes, adapts the result into outbound messages, and applies the
//! acknowledgment policy. Teardown nacks the in-flight element and drains
//! the inbound buffer; messages are never silently dropped.

use crate::ack::{AckGroup, AckOutcome, AckPolicy, Acknowledgment};
use crate::error::{nack_cause, NackCause, StageFailure};
use crate::handler::{CallArgs, CallResult, Invoker, MessageStream};
use crate::message::{AnyMessage, Message};
use crate::shape::{ArgForm, Shape};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Element flowing between stages: a message, or the terminal failure of
/// the producing stage's stream.
pub type StageItem = Result<AnyMessage, StageFailure>;

pub(crate) type ItemSender = mpsc::Sender<StageItem>;
pub(crate) type ItemReceiver = mpsc::Receiver<StageItem>;

enum Flow {
    Continue,
    Stop,
}

fn teardown_cause() -> NackCause {
    nack_cause(anyhow::anyhow!("stage torn down"))
}

/// Close the endpoint and nack whatever is still buffered in it.
fn drain_inbound(inbound: &mut ItemReceiver, cause: &NackCause) {
    inbound.close();
    while let Ok(item) = inbound.try_recv() {
        if let Ok(message) = item {
            message
                .acknowledgment()
                .resolve_if_pending(AckOutcome::Nacked(cause.clone()));
        }
    }
}

/// Runtime entity produced per method descriptor.
pub struct ProcessingStage {
    name: String,
    shape: Shape,
    policy: AckPolicy,
    invoker: Invoker,
    inbound: Option<ItemReceiver>,
    outbound: Option<ItemSender>,
}

impl ProcessingStage {
    pub(crate) fn new(name: String, shape: Shape, policy: AckPolicy, invoker: Invoker) -> Self {
        Self {
            name,
            shape,
            policy,
            invoker,
            inbound: None,
            outbound: None,
        }
    }

    pub(crate) fn attach_inbound(&mut self, inbound: ItemReceiver) {
        self.inbound = Some(inbound);
    }

    pub(crate) fn attach_outbound(&mut self, outbound: ItemSender) {
        self.outbound = Some(outbound);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn policy(&self) -> AckPolicy {
        self.policy
    }

    pub(crate) fn spawn(self, shutdown: watch::Receiver<bool>) -> StageHandle {
        let name = self.name.clone();
        let join = tokio::spawn(self.run(shutdown));
        StageHandle { name, join }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        debug!(stage = %self.name, shape = %self.shape, "stage started");
        match self.shape {
            Shape::ProducerStream { .. } => self.run_producer_stream(&mut shutdown).await,
            Shape::ProcessorStreamBuilder { .. } => self.run_stream_builder(&mut shutdown).await,
            shape if shape.is_producer() => self.run_producer(&mut shutdown).await,
            _ => self.run_sequential(&mut shutdown).await,
        }
        debug!(stage = %self.name, "stage stopped");
    }

    /// 1:1 processors and consumers: one element at a time, never
    /// overlapping invocations.
    async fn run_sequential(&mut self, shutdown: &mut watch::Receiver<bool>) {
        let Some(mut inbound) = self.inbound.take() else {
            warn!(stage = %self.name, "no inbound endpoint attached");
            return;
        };
        loop {
            let item = tokio::select! {
                _ = shutdown.changed() => {
                    drain_inbound(&mut inbound, &teardown_cause());
                    return;
                }
                item = inbound.recv() => item,
            };
            let message = match item {
                None => return,
                Some(Err(failure)) => {
                    warn!(stage = %self.name, %failure, "upstream failed; stopping");
                    let _ = self.send_item(Err(failure), shutdown).await;
                    drain_inbound(&mut inbound, &teardown_cause());
                    return;
                }
                Some(Ok(message)) => message,
            };
            match self.process_element(message, shutdown).await {
                Flow::Continue => {}
                Flow::Stop => {
                    drain_inbound(&mut inbound, &teardown_cause());
                    return;
                }
            }
        }
    }

    async fn process_element(
        &mut self,
        message: AnyMessage,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Flow {
        let inbound_ack = message.acknowledgment().clone();
        if self.policy == AckPolicy::Pre {
            if let Err(err) = message.ack() {
                debug!(stage = %self.name, %err, "pre-acknowledge failed");
            }
        }
        let args = match self.shape.input_form() {
            Some(ArgForm::Value) => CallArgs::Value(message.into_payload()),
            _ => CallArgs::Message(message),
        };
        let result = self.invoker.invoke(args);
        if self.shape.is_consumer() {
            self.adapt_consumer_result(result, inbound_ack, shutdown).await
        } else {
            self.adapt_processor_result(result, inbound_ack, shutdown).await
        }
    }

    async fn adapt_consumer_result(
        &mut self,
        result: CallResult,
        inbound_ack: Acknowledgment,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Flow {
        let completion = match result {
            CallResult::Done => Ok(()),
            CallResult::FutureDone(fut) => {
                tokio::select! {
                    _ = shutdown.changed() => {
                        inbound_ack.resolve_if_pending(AckOutcome::Nacked(teardown_cause()));
                        return Flow::Stop;
                    }
                    completion = fut => completion,
                }
            }
            CallResult::Failed(err) => Err(err),
            other => Err(self.shape_mismatch(&other)),
        };
        match completion {
            Ok(()) => self.complete_consumed(inbound_ack),
            Err(err) => self.fail_element(inbound_ack, err, shutdown).await,
        }
    }

    async fn adapt_processor_result(
        &mut self,
        result: CallResult,
        inbound_ack: Acknowledgment,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Flow {
        match result {
            CallResult::Value(payload) => {
                self.emit_single(Message::of(payload), inbound_ack, shutdown)
                    .await
            }
            CallResult::Message(message) => self.emit_single(message, inbound_ack, shutdown).await,
            CallResult::FutureValue(fut) => {
                let resolved = tokio::select! {
                    _ = shutdown.changed() => {
                        inbound_ack.resolve_if_pending(AckOutcome::Nacked(teardown_cause()));
                        return Flow::Stop;
                    }
                    resolved = fut => resolved,
                };
                match resolved {
                    Ok(payload) => {
                        self.emit_single(Message::of(payload), inbound_ack, shutdown)
                            .await
                    }
                    Err(err) => self.fail_element(inbound_ack, err, shutdown).await,
                }
            }
            CallResult::FutureMessage(fut) => {
                let resolved = tokio::select! {
                    _ = shutdown.changed() => {
                        inbound_ack.resolve_if_pending(AckOutcome::Nacked(teardown_cause()));
                        return Flow::Stop;
                    }
                    resolved = fut => resolved,
                };
                match resolved {
                    Ok(message) => self.emit_single(message, inbound_ack, shutdown).await,
                    Err(err) => self.fail_element(inbound_ack, err, shutdown).await,
                }
            }
            CallResult::Failed(err) => self.fail_element(inbound_ack, err, shutdown).await,
            other => {
                let err = self.shape_mismatch(&other);
                self.fail_element(inbound_ack, err, shutdown).await
            }
        }
    }

    fn shape_mismatch(&self, result: &CallResult) -> anyhow::Error {
        anyhow::anyhow!(
            "method `{}` returned `{}` for shape {}",
            self.invoker.method(),
            result.label(),
            self.shape
        )
    }

    /// Post-acknowledge chains the outbound resolution back to the
    /// inbound message; other policies already ran their course.
    async fn emit_single(
        &mut self,
        outbound: AnyMessage,
        inbound_ack: Acknowledgment,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Flow {
        if self.policy == AckPolicy::Post {
            outbound.acknowledgment().chain_to(inbound_ack);
        }
        if self.send_item(Ok(outbound), shutdown).await {
            Flow::Continue
        } else {
            Flow::Stop
        }
    }

    fn complete_consumed(&self, inbound_ack: Acknowledgment) -> Flow {
        if self.policy == AckPolicy::Post {
            if let Err(err) = inbound_ack.ack() {
                debug!(stage = %self.name, %err, "acknowledge after consume failed");
            }
        }
        Flow::Continue
    }

    /// Convert an invocation failure per shape: consumers nack and keep
    /// consuming, processors fail their outbound stream and stop.
    async fn fail_element(
        &mut self,
        inbound_ack: Acknowledgment,
        err: anyhow::Error,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Flow {
        let cause = nack_cause(err);
        warn!(stage = %self.name, %cause, "invocation failed");
        if self.policy == AckPolicy::Post {
            inbound_ack.resolve_if_pending(AckOutcome::Nacked(cause.clone()));
        }
        if self.shape.is_consumer() {
            return Flow::Continue;
        }
        let failure = StageFailure::new(self.name.clone(), cause);
        let _ = self.send_item(Err(failure), shutdown).await;
        Flow::Stop
    }

    /// Producers of single elements: invoke under downstream demand; the
    /// bounded outbound channel is the credit.
    async fn run_producer(&mut self, shutdown: &mut watch::Receiver<bool>) {
        loop {
            let result = self.invoker.invoke(CallArgs::None);
            let outbound = match result {
                CallResult::Value(payload) => Message::of(payload),
                CallResult::Message(message) => message,
                CallResult::FutureValue(fut) => {
                    let resolved = tokio::select! {
                        _ = shutdown.changed() => return,
                        resolved = fut => resolved,
                    };
                    match resolved {
                        Ok(payload) => Message::of(payload),
                        Err(err) => {
                            self.fail_stream(err, shutdown).await;
                            return;
                        }
                    }
                }
                CallResult::FutureMessage(fut) => {
                    let resolved = tokio::select! {
                        _ = shutdown.changed() => return,
                        resolved = fut => resolved,
                    };
                    match resolved {
                        Ok(message) => message,
                        Err(err) => {
                            self.fail_stream(err, shutdown).await;
                            return;
                        }
                    }
                }
                CallResult::Failed(err) => {
                    self.fail_stream(err, shutdown).await;
                    return;
                }
                other => {
                    let err = self.shape_mismatch(&other);
                    self.fail_stream(err, shutdown).await;
                    return;
                }
            };
            let gate = (self.policy == AckPolicy::Post).then(|| outbound.acknowledgment().listen());
            if !self.send_item(Ok(outbound), shutdown).await {
                return;
            }
            if let Some(listener) = gate {
                let outcome = tokio::select! {
                    _ = shutdown.changed() => return,
                    outcome = listener.outcome() => outcome,
                };
                if let Some(cause) = outcome.cause() {
                    debug!(stage = %self.name, %cause, "production round nacked");
                }
            }
        }
    }

    /// Producer-Stream: one activation splices the returned stream; under
    /// post-acknowledge the round completes only when every spliced
    /// message has been acknowledged.
    async fn run_producer_stream(&mut self, shutdown: &mut watch::Receiver<bool>) {
        let stream = match self.invoker.invoke(CallArgs::None) {
            CallResult::Stream(stream) => stream,
            CallResult::Failed(err) => {
                self.fail_stream(err, shutdown).await;
                return;
            }
            other => {
                let err = self.shape_mismatch(&other);
                self.fail_stream(err, shutdown).await;
                return;
            }
        };
        let group = (self.policy == AckPolicy::Post).then(AckGroup::new);
        if !self.splice(stream, group.as_ref(), shutdown).await {
            return;
        }
        if let Some(group) = group {
            group.seal();
            let outcome = tokio::select! {
                _ = shutdown.changed() => return,
                outcome = group.listen().outcome() => outcome,
            };
            match outcome.cause() {
                None => debug!(stage = %self.name, "production round complete"),
                Some(cause) => warn!(stage = %self.name, %cause, "production round nacked"),
            }
        }
    }

    /// Stream-builder processors: the whole inbound stream is the
    /// argument, invoked exactly once per activation.
    async fn run_stream_builder(&mut self, shutdown: &mut watch::Receiver<bool>) {
        let Some(inbound) = self.inbound.take() else {
            warn!(stage = %self.name, "no inbound endpoint attached");
            return;
        };
        let pending_failure: Arc<Mutex<Option<StageFailure>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&pending_failure);
        let source: MessageStream = futures::stream::unfold(
            (inbound, slot),
            |(mut inbound, slot)| async move {
                match inbound.recv().await {
                    Some(Ok(message)) => Some((message, (inbound, slot))),
                    Some(Err(failure)) => {
                        *slot.lock() = Some(failure);
                        None
                    }
                    None => None,
                }
            },
        )
        .boxed();
        let stream = match self.invoker.invoke(CallArgs::Stream(source)) {
            CallResult::Stream(stream) => stream,
            CallResult::Failed(err) => {
                self.fail_stream(err, shutdown).await;
                return;
            }
            other => {
                let err = self.shape_mismatch(&other);
                self.fail_stream(err, shutdown).await;
                return;
            }
        };
        if !self.splice(stream, None, shutdown).await {
            return;
        }
        // The user stream ended; surface any upstream failure it absorbed.
        let pending = pending_failure.lock().take();
        if let Some(failure) = pending {
            let _ = self.send_item(Err(failure), shutdown).await;
        }
    }

    /// Splice a returned stream into the outbound endpoint with no extra
    /// buffering; downstream backpressure flows through the send.
    async fn splice(
        &mut self,
        mut stream: MessageStream,
        group: Option<&AckGroup>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            let next = tokio::select! {
                _ = shutdown.changed() => return false,
                next = stream.next() => next,
            };
            let Some(message) = next else {
                return true;
            };
            if let Some(group) = group {
                group.track(message.acknowledgment());
            }
            if !self.send_item(Ok(message), shutdown).await {
                return false;
            }
        }
    }

    async fn fail_stream(&mut self, err: anyhow::Error, shutdown: &mut watch::Receiver<bool>) {
        let cause = nack_cause(err);
        warn!(stage = %self.name, %cause, "invocation failed");
        let failure = StageFailure::new(self.name.clone(), cause);
        let _ = self.send_item(Err(failure), shutdown).await;
    }

    /// Send one item downstream, honoring backpressure via channel
    /// capacity. Returns false when the stage should stop; any message in
    /// the item is nacked, never silently dropped.
    async fn send_item(&mut self, item: StageItem, shutdown: &mut watch::Receiver<bool>) -> bool {
        let Some(outbound) = &self.outbound else {
            if let Ok(message) = item {
                warn!(stage = %self.name, "no outbound endpoint attached; refusing message");
                message.acknowledgment().resolve_if_pending(AckOutcome::Nacked(
                    nack_cause(anyhow::anyhow!(
                        "stage `{}` has no outbound endpoint",
                        self.name
                    )),
                ));
            }
            return false;
        };
        let permit = tokio::select! {
            _ = shutdown.changed() => {
                if let Ok(message) = item {
                    message
                        .acknowledgment()
                        .resolve_if_pending(AckOutcome::Nacked(teardown_cause()));
                }
                return false;
            }
            permit = outbound.reserve() => permit,
        };
        match permit {
            Ok(permit) => {
                permit.send(item);
                true
            }
            Err(_) => {
                if let Ok(message) = item {
                    message.acknowledgment().resolve_if_pending(AckOutcome::Nacked(
                        nack_cause(anyhow::anyhow!("downstream channel closed")),
                    ));
                }
                false
            }
        }
    }
}

impl std::fmt::Debug for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingStage")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("policy", &self.policy)
            .field("has_inbound", &self.inbound.is_some())
            .field("has_outbound", &self.outbound.is_some())
            .finish()
    }
}

/// Handle to a spawned stage task.
pub struct StageHandle {
    name: String,
    join: JoinHandle<()>,
}

impl StageHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) async fn join(self) {
        if let Err(err) = self.join.await {
            if err.is_panic() {
                error!(stage = %self.name, "stage task panicked");
            }
        }
    }
}

impl std::fmt::Debug for StageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageHandle").field("name", &self.name).finish()
    }
}
