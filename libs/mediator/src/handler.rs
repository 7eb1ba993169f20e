//! Uniform invocation surface for user methods.
//!
//! A user method is registered as a [`Handler`]: one call signature over
//! the adapted argument forms ([`CallArgs`]) returning whichever result
//! form its shape produces ([`CallResult`]). The [`Invoker`] wraps the
//! handler so no synchronous failure, `Err` or panic, escapes the stage
//! boundary.

use crate::message::{AnyMessage, AnyPayload};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Erased message stream handed to (and returned by) stream shapes
pub type MessageStream = BoxStream<'static, AnyMessage>;

/// Adapted arguments for one invocation.
pub enum CallArgs {
    /// Producer shapes take no argument
    None,
    /// The unwrapped payload of the inbound Message
    Value(AnyPayload),
    /// The inbound Message, unchanged
    Message(AnyMessage),
    /// The entire inbound stream (stream-builder shapes, once per activation)
    Stream(MessageStream),
}

impl CallArgs {
    pub fn label(&self) -> &'static str {
        match self {
            CallArgs::None => "none",
            CallArgs::Value(_) => "value",
            CallArgs::Message(_) => "message",
            CallArgs::Stream(_) => "stream",
        }
    }
}

/// What one invocation produced, before result adaptation.
pub enum CallResult {
    /// Void completion (consumer shapes)
    Done,
    /// A raw payload value
    Value(AnyPayload),
    /// A wrapped Message
    Message(AnyMessage),
    /// A stream to splice into the outbound channel
    Stream(MessageStream),
    /// Async void completion
    FutureDone(BoxFuture<'static, anyhow::Result<()>>),
    /// Async payload value
    FutureValue(BoxFuture<'static, anyhow::Result<AnyPayload>>),
    /// Async wrapped Message
    FutureMessage(BoxFuture<'static, anyhow::Result<AnyMessage>>),
    /// Synchronous failure
    Failed(anyhow::Error),
}

impl CallResult {
    pub fn label(&self) -> &'static str {
        match self {
            CallResult::Done => "done",
            CallResult::Value(_) => "value",
            CallResult::Message(_) => "message",
            CallResult::Stream(_) => "stream",
            CallResult::FutureDone(_) => "future-done",
            CallResult::FutureValue(_) => "future-value",
            CallResult::FutureMessage(_) => "future-message",
            CallResult::Failed(_) => "failed",
        }
    }
}

/// An adapted user method, bound to its declaring object.
pub trait Handler: Send {
    fn call(&mut self, args: CallArgs) -> CallResult;
}

impl<F> Handler for F
where
    F: FnMut(CallArgs) -> CallResult + Send,
{
    fn call(&mut self, args: CallArgs) -> CallResult {
        self(args)
    }
}

/// Boxed handler stored per stage
pub type BoxHandler = Box<dyn Handler>;

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Calls the user method, converting panics into [`CallResult::Failed`].
pub struct Invoker {
    method: String,
    handler: BoxHandler,
}

impl Invoker {
    pub fn new(method: impl Into<String>, handler: BoxHandler) -> Self {
        Self {
            method: method.into(),
            handler,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn invoke(&mut self, args: CallArgs) -> CallResult {
        match catch_unwind(AssertUnwindSafe(|| self.handler.call(args))) {
            Ok(result) => result,
            Err(payload) => CallResult::Failed(anyhow::anyhow!(
                "method `{}` panicked: {}",
                self.method,
                panic_message(payload)
            )),
        }
    }
}

impl std::fmt::Debug for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invoker").field("method", &self.method).finish()
    }
}

/// Unwrap an erased payload into the registered parameter type.
pub(crate) fn downcast_payload<T: Any>(
    method: &str,
    payload: AnyPayload,
) -> anyhow::Result<T> {
    payload.downcast::<T>().map(|boxed| *boxed).map_err(|_| {
        anyhow::anyhow!(
            "method `{method}` received a payload that is not {}",
            std::any::type_name::<T>()
        )
    })
}

/// Diagnostic for a handler handed an argument form its shape rules out.
pub(crate) fn unexpected_args(method: &str, args: &CallArgs) -> anyhow::Error {
    anyhow::anyhow!(
        "method `{method}` invoked with unexpected argument form `{}`",
        args.label()
    )
}
