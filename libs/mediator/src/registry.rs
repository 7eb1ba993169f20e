//! Method registrations: a descriptor paired with its adapted handler.
//!
//! The typed constructors below build both halves consistently for the
//! common signature shapes, erasing user payload types at the boundary.
//! Anything unusual can still be registered from raw parts with
//! [`MethodRegistration::new`].

use crate::ack::AckPolicy;
use crate::descriptor::{Concurrency, MethodDescriptor, TypeShape};
use crate::handler::{
    downcast_payload, unexpected_args, BoxHandler, CallArgs, CallResult, Handler, MessageStream,
};
use crate::message::Message;
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::future::Future;
use tracing::warn;

/// A user method ready for assembly: descriptor plus bound callable.
pub struct MethodRegistration {
    descriptor: MethodDescriptor,
    handler: BoxHandler,
}

impl MethodRegistration {
    pub fn new(descriptor: MethodDescriptor, handler: BoxHandler) -> Self {
        Self {
            descriptor,
            handler,
        }
    }

    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    /// Override the acknowledgment policy declared on the descriptor
    pub fn with_ack_policy(mut self, policy: AckPolicy) -> Self {
        self.descriptor = self.descriptor.with_ack_policy(policy);
        self
    }

    /// Override the concurrency declaration on the descriptor
    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.descriptor = self.descriptor.with_concurrency(concurrency);
        self
    }

    pub(crate) fn into_parts(self) -> (MethodDescriptor, BoxHandler) {
        (self.descriptor, self.handler)
    }
}

impl std::fmt::Debug for MethodRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistration")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// Processor taking a payload and returning a payload.
pub fn transform<I, O, F>(
    name: impl Into<String>,
    inbound: impl Into<String>,
    outbound: impl Into<String>,
    mut f: F,
) -> MethodRegistration
where
    I: Any + Send,
    O: Any + Send,
    F: FnMut(I) -> anyhow::Result<O> + Send + 'static,
{
    let name = name.into();
    let descriptor = MethodDescriptor::new(name.clone())
        .with_inbound(inbound)
        .with_outbound(outbound)
        .with_param(TypeShape::Value)
        .returning(TypeShape::Value);
    let handler = move |args: CallArgs| -> CallResult {
        let payload = match args {
            CallArgs::Value(payload) => payload,
            other => return CallResult::Failed(unexpected_args(&name, &other)),
        };
        match downcast_payload::<I>(&name, payload).and_then(&mut f) {
            Ok(output) => CallResult::Value(Box::new(output)),
            Err(err) => CallResult::Failed(err),
        }
    };
    MethodRegistration::new(descriptor, Box::new(handler))
}

/// Processor taking a payload and returning a wrapped Message.
pub fn transform_to_message<I, O, F>(
    name: impl Into<String>,
    inbound: impl Into<String>,
    outbound: impl Into<String>,
    mut f: F,
) -> MethodRegistration
where
    I: Any + Send,
    O: Send + 'static,
    F: FnMut(I) -> anyhow::Result<Message<O>> + Send + 'static,
{
    let name = name.into();
    let descriptor = MethodDescriptor::new(name.clone())
        .with_inbound(inbound)
        .with_outbound(outbound)
        .with_param(TypeShape::Value)
        .returning(TypeShape::Message);
    let handler = move |args: CallArgs| -> CallResult {
        let payload = match args {
            CallArgs::Value(payload) => payload,
            other => return CallResult::Failed(unexpected_args(&name, &other)),
        };
        match downcast_payload::<I>(&name, payload).and_then(&mut f) {
            Ok(message) => CallResult::Message(message.erase()),
            Err(err) => CallResult::Failed(err),
        }
    };
    MethodRegistration::new(descriptor, Box::new(handler))
}

/// Processor taking and returning a wrapped Message.
pub fn transform_message<I, O, F>(
    name: impl Into<String>,
    inbound: impl Into<String>,
    outbound: impl Into<String>,
    mut f: F,
) -> MethodRegistration
where
    I: Any + Send,
    O: Send + 'static,
    F: FnMut(Message<I>) -> anyhow::Result<Message<O>> + Send + 'static,
{
    let name = name.into();
    let descriptor = MethodDescriptor::new(name.clone())
        .with_inbound(inbound)
        .with_outbound(outbound)
        .with_param(TypeShape::Message)
        .returning(TypeShape::Message);
    let handler = move |args: CallArgs| -> CallResult {
        let message = match args {
            CallArgs::Message(message) => message,
            other => return CallResult::Failed(unexpected_args(&name, &other)),
        };
        let typed = match message.downcast::<I>() {
            Ok(typed) => typed,
            Err(_) => {
                return CallResult::Failed(anyhow::anyhow!(
                    "method `{name}` received a message whose payload is not {}",
                    std::any::type_name::<I>()
                ));
            }
        };
        match f(typed) {
            Ok(message) => CallResult::Message(message.erase()),
            Err(err) => CallResult::Failed(err),
        }
    };
    MethodRegistration::new(descriptor, Box::new(handler))
}

/// Processor taking a payload and resolving asynchronously to a payload.
pub fn transform_async<I, O, F, Fut>(
    name: impl Into<String>,
    inbound: impl Into<String>,
    outbound: impl Into<String>,
    mut f: F,
) -> MethodRegistration
where
    I: Any + Send,
    O: Any + Send,
    F: FnMut(I) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
{
    let name = name.into();
    let descriptor = MethodDescriptor::new(name.clone())
        .with_inbound(inbound)
        .with_outbound(outbound)
        .with_param(TypeShape::Value)
        .returning(TypeShape::future(TypeShape::Value));
    let handler = move |args: CallArgs| -> CallResult {
        let payload = match args {
            CallArgs::Value(payload) => payload,
            other => return CallResult::Failed(unexpected_args(&name, &other)),
        };
        let input = match downcast_payload::<I>(&name, payload) {
            Ok(input) => input,
            Err(err) => return CallResult::Failed(err),
        };
        let fut = f(input);
        CallResult::FutureValue(
            async move {
                fut.await
                    .map(|output| Box::new(output) as crate::message::AnyPayload)
            }
            .boxed(),
        )
    };
    MethodRegistration::new(descriptor, Box::new(handler))
}

/// Processor taking a wrapped Message and resolving asynchronously to a
/// wrapped Message.
pub fn transform_message_async<I, O, F, Fut>(
    name: impl Into<String>,
    inbound: impl Into<String>,
    outbound: impl Into<String>,
    mut f: F,
) -> MethodRegistration
where
    I: Any + Send,
    O: Send + 'static,
    F: FnMut(Message<I>) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Message<O>>> + Send + 'static,
{
    let name = name.into();
    let descriptor = MethodDescriptor::new(name.clone())
        .with_inbound(inbound)
        .with_outbound(outbound)
        .with_param(TypeShape::Message)
        .returning(TypeShape::future(TypeShape::Message));
    let handler = move |args: CallArgs| -> CallResult {
        let message = match args {
            CallArgs::Message(message) => message,
            other => return CallResult::Failed(unexpected_args(&name, &other)),
        };
        let typed = match message.downcast::<I>() {
            Ok(typed) => typed,
            Err(_) => {
                return CallResult::Failed(anyhow::anyhow!(
                    "method `{name}` received a message whose payload is not {}",
                    std::any::type_name::<I>()
                ));
            }
        };
        let fut = f(typed);
        CallResult::FutureMessage(
            async move { fut.await.map(Message::erase) }.boxed(),
        )
    };
    MethodRegistration::new(descriptor, Box::new(handler))
}

/// Stream-builder processor over wrapped Messages, invoked once per
/// activation with the whole inbound stream.
pub fn stream_builder<I, O, F>(
    name: impl Into<String>,
    inbound: impl Into<String>,
    outbound: impl Into<String>,
    f: F,
) -> MethodRegistration
where
    I: Any + Send,
    O: Send + 'static,
    F: FnOnce(futures::stream::BoxStream<'static, Message<I>>) -> futures::stream::BoxStream<'static, Message<O>>
        + Send
        + 'static,
{
    let name = name.into();
    let descriptor = MethodDescriptor::new(name.clone())
        .with_inbound(inbound)
        .with_outbound(outbound)
        .with_param(TypeShape::builder(TypeShape::Message))
        .returning(TypeShape::builder(TypeShape::Message));
    let method = name.clone();
    let handler = OnceHandler {
        method: name,
        f: Some(move |source: MessageStream| {
            let typed = source
                .filter_map(move |message| {
                    futures::future::ready(match message.downcast::<I>() {
                        Ok(typed) => Some(typed),
                        Err(message) => {
                            warn!(
                                method = %method,
                                "dropping message whose payload is not {}",
                                std::any::type_name::<I>()
                            );
                            let _ = message.nack(crate::error::nack_cause(anyhow::anyhow!(
                                "payload is not {}",
                                std::any::type_name::<I>()
                            )));
                            None
                        }
                    })
                })
                .boxed();
            f(typed).map(Message::erase).boxed()
        }),
    };
    MethodRegistration::new(descriptor, Box::new(handler))
}

/// Stream-builder processor over raw payloads. Each inbound Message is
/// unwrapped (and acknowledged) as it enters the user stream; each
/// outbound payload is wrapped into a fresh Message.
pub fn stream_builder_values<I, O, F>(
    name: impl Into<String>,
    inbound: impl Into<String>,
    outbound: impl Into<String>,
    f: F,
) -> MethodRegistration
where
    I: Any + Send,
    O: Send + 'static,
    F: FnOnce(futures::stream::BoxStream<'static, I>) -> futures::stream::BoxStream<'static, O>
        + Send
        + 'static,
{
    let name = name.into();
    let descriptor = MethodDescriptor::new(name.clone())
        .with_inbound(inbound)
        .with_outbound(outbound)
        .with_param(TypeShape::builder(TypeShape::Value))
        .returning(TypeShape::builder(TypeShape::Value));
    let handler = OnceHandler {
        method: name,
        f: Some(move |source: MessageStream| {
            let typed = source
                .filter_map(|message| {
                    futures::future::ready(match message.downcast::<I>() {
                        Ok(typed) => {
                            let _ = typed.ack();
                            Some(typed.into_payload())
                        }
                        Err(message) => {
                            let _ = message.nack(crate::error::nack_cause(anyhow::anyhow!(
                                "payload is not {}",
                                std::any::type_name::<I>()
                            )));
                            None
                        }
                    })
                })
                .boxed();
            f(typed).map(|payload| Message::of(payload).erase()).boxed()
        }),
    };
    MethodRegistration::new(descriptor, Box::new(handler))
}

/// Consumer taking a payload.
pub fn consumer<I, F>(
    name: impl Into<String>,
    inbound: impl Into<String>,
    mut f: F,
) -> MethodRegistration
where
    I: Any + Send,
    F: FnMut(I) -> anyhow::Result<()> + Send + 'static,
{
    let name = name.into();
    let descriptor = MethodDescriptor::new(name.clone())
        .with_inbound(inbound)
        .with_param(TypeShape::Value)
        .returning(TypeShape::Void);
    let handler = move |args: CallArgs| -> CallResult {
        let payload = match args {
            CallArgs::Value(payload) => payload,
            other => return CallResult::Failed(unexpected_args(&name, &other)),
        };
        match downcast_payload::<I>(&name, payload).and_then(&mut f) {
            Ok(()) => CallResult::Done,
            Err(err) => CallResult::Failed(err),
        }
    };
    MethodRegistration::new(descriptor, Box::new(handler))
}

/// Consumer taking a wrapped Message.
pub fn consumer_message<I, F>(
    name: impl Into<String>,
    inbound: impl Into<String>,
    mut f: F,
) -> MethodRegistration
where
    I: Any + Send,
    F: FnMut(Message<I>) -> anyhow::Result<()> + Send + 'static,
{
    let name = name.into();
    let descriptor = MethodDescriptor::new(name.clone())
        .with_inbound(inbound)
        .with_param(TypeShape::Message)
        .returning(TypeShape::Void);
    let handler = move |args: CallArgs| -> CallResult {
        let message = match args {
            CallArgs::Message(message) => message,
            other => return CallResult::Failed(unexpected_args(&name, &other)),
        };
        let typed = match message.downcast::<I>() {
            Ok(typed) => typed,
            Err(_) => {
                return CallResult::Failed(anyhow::anyhow!(
                    "method `{name}` received a message whose payload is not {}",
                    std::any::type_name::<I>()
                ));
            }
        };
        match f(typed) {
            Ok(()) => CallResult::Done,
            Err(err) => CallResult::Failed(err),
        }
    };
    MethodRegistration::new(descriptor, Box::new(handler))
}

/// Consumer taking a payload and completing asynchronously.
pub fn consumer_async<I, F, Fut>(
    name: impl Into<String>,
    inbound: impl Into<String>,
    mut f: F,
) -> MethodRegistration
where
    I: Any + Send,
    F: FnMut(I) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let name = name.into();
    let descriptor = MethodDescriptor::new(name.clone())
        .with_inbound(inbound)
        .with_param(TypeShape::Value)
        .returning(TypeShape::future(TypeShape::Void));
    let handler = move |args: CallArgs| -> CallResult {
        let payload = match args {
            CallArgs::Value(payload) => payload,
            other => return CallResult::Failed(unexpected_args(&name, &other)),
        };
        let input = match downcast_payload::<I>(&name, payload) {
            Ok(input) => input,
            Err(err) => return CallResult::Failed(err),
        };
        CallResult::FutureDone(f(input).boxed())
    };
    MethodRegistration::new(descriptor, Box::new(handler))
}

/// Producer of payload values, invoked once per downstream request.
pub fn producer<O, F>(
    name: impl Into<String>,
    outbound: impl Into<String>,
    mut f: F,
) -> MethodRegistration
where
    O: Any + Send,
    F: FnMut() -> anyhow::Result<O> + Send + 'static,
{
    let name = name.into();
    let descriptor = MethodDescriptor::new(name.clone())
        .with_outbound(outbound)
        .returning(TypeShape::Value);
    let handler = move |args: CallArgs| -> CallResult {
        match args {
            CallArgs::None => match f() {
                Ok(output) => CallResult::Value(Box::new(output)),
                Err(err) => CallResult::Failed(err),
            },
            other => CallResult::Failed(unexpected_args(&name, &other)),
        }
    };
    MethodRegistration::new(descriptor, Box::new(handler))
}

/// Producer of wrapped Messages.
pub fn producer_message<O, F>(
    name: impl Into<String>,
    outbound: impl Into<String>,
    mut f: F,
) -> MethodRegistration
where
    O: Send + 'static,
    F: FnMut() -> anyhow::Result<Message<O>> + Send + 'static,
{
    let name = name.into();
    let descriptor = MethodDescriptor::new(name.clone())
        .with_outbound(outbound)
        .returning(TypeShape::Message);
    let handler = move |args: CallArgs| -> CallResult {
        match args {
            CallArgs::None => match f() {
                Ok(message) => CallResult::Message(message.erase()),
                Err(err) => CallResult::Failed(err),
            },
            other => CallResult::Failed(unexpected_args(&name, &other)),
        }
    };
    MethodRegistration::new(descriptor, Box::new(handler))
}

/// Producer resolving asynchronously to a payload value.
pub fn producer_async<O, F, Fut>(
    name: impl Into<String>,
    outbound: impl Into<String>,
    mut f: F,
) -> MethodRegistration
where
    O: Any + Send,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
{
    let name = name.into();
    let descriptor = MethodDescriptor::new(name.clone())
        .with_outbound(outbound)
        .returning(TypeShape::future(TypeShape::Value));
    let handler = move |args: CallArgs| -> CallResult {
        match args {
            CallArgs::None => {
                let fut = f();
                CallResult::FutureValue(
                    async move {
                        fut.await
                            .map(|output| Box::new(output) as crate::message::AnyPayload)
                    }
                    .boxed(),
                )
            }
            other => CallResult::Failed(unexpected_args(&name, &other)),
        }
    };
    MethodRegistration::new(descriptor, Box::new(handler))
}

/// Producer splicing a whole stream of Messages, invoked once per
/// activation.
pub fn producer_stream<O, F>(
    name: impl Into<String>,
    outbound: impl Into<String>,
    f: F,
) -> MethodRegistration
where
    O: Send + 'static,
    F: FnOnce() -> futures::stream::BoxStream<'static, Message<O>> + Send + 'static,
{
    let name = name.into();
    let descriptor = MethodDescriptor::new(name.clone())
        .with_outbound(outbound)
        .returning(TypeShape::stream(TypeShape::Message));
    let mut f = Some(f);
    let method = name.clone();
    let handler = move |args: CallArgs| -> CallResult {
        match args {
            CallArgs::None => match f.take() {
                Some(f) => CallResult::Stream(f().map(Message::erase).boxed()),
                None => CallResult::Failed(anyhow::anyhow!(
                    "method `{method}` activated more than once"
                )),
            },
            other => CallResult::Failed(unexpected_args(&method, &other)),
        }
    };
    MethodRegistration::new(descriptor, Box::new(handler))
}

/// Handler wrapper for methods invoked exactly once per activation.
struct OnceHandler<F> {
    method: String,
    f: Option<F>,
}

impl<F> Handler for OnceHandler<F>
where
    F: FnOnce(MessageStream) -> MessageStream + Send,
{
    fn call(&mut self, args: CallArgs) -> CallResult {
        let source = match args {
            CallArgs::Stream(source) => source,
            other => return CallResult::Failed(unexpected_args(&self.method, &other)),
        };
        match self.f.take() {
            Some(f) => CallResult::Stream(f(source)),
            None => CallResult::Failed(anyhow::anyhow!(
                "method `{}` activated more than once",
                self.method
            )),
        }
    }
}
