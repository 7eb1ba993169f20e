//! # Mediator
//!
//! Method-shape resolution and stream pipeline assembly for reactive
//! messaging. Application methods declare an inbound and/or outbound
//! channel; the engine classifies each declaration against a closed set
//! of invocation shapes, wraps it in a processing stage with uniform
//! stream semantics, and links stages whose channel names match.
//!
//! ```text
//! MethodRegistration → classify → ProcessingStage ─┐
//! MethodRegistration → classify → ProcessingStage ─┼→ PipelineGraph → activate
//! MethodRegistration → classify → ProcessingStage ─┘        │
//!                                                   open endpoints ↔ transports
//! ```
//!
//! Stages exchange acknowledgeable [`Message`]s under credit-based
//! backpressure; invocation failures become stream failures downstream
//! stages observe, never escaped exceptions.

pub mod ack;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod graph;
pub mod handler;
pub mod message;
pub mod registry;
pub mod shape;
pub mod stage;
pub mod transport;

pub use ack::{AckGroup, AckListener, AckOutcome, AckPolicy, Acknowledgment};
pub use config::{Cardinality, ChannelConfig, PipelineConfig, StageConfig, DEFAULT_CREDIT};
pub use descriptor::{Concurrency, MethodDescriptor, TypeShape};
pub use error::{nack_cause, MediatorError, MediatorResult, NackCause, StageFailure};
pub use graph::{
    assemble, ChannelEnds, PipelineGraph, PipelineInput, PipelineOutput, RunningPipeline,
};
pub use handler::{BoxHandler, CallArgs, CallResult, Handler, Invoker, MessageStream};
pub use message::{AnyMessage, AnyPayload, Message, Metadata};
pub use registry::MethodRegistration;
pub use shape::{classify, ArgForm, Shape};
pub use stage::{ProcessingStage, StageHandle, StageItem};
pub use transport::{bind_outlet, bind_source, MessageOutlet, MessageSource};
