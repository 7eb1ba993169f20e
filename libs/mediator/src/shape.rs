//! Shape classification: mapping a method descriptor onto the closed set
//! of supported invocation shapes.
//!
//! Classification is pure and deterministic. Channel presence picks the
//! family (both → processor, inbound only → consumer, outbound only →
//! producer); parameter/return structure picks the shape within it.

use crate::ack::AckPolicy;
use crate::descriptor::{MethodDescriptor, TypeShape};
use crate::error::MediatorError;

/// Whether a single-element position carries the raw payload or the
/// wrapped Message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgForm {
    Value,
    Message,
}

/// The closed set of supported invocation shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    ProducerValue,
    ProducerMessage,
    ProducerAsyncValue,
    ProducerAsyncMessage,
    ProducerStream { element: ArgForm },
    ProcessorValueToValue,
    ProcessorValueToMessage,
    ProcessorMessageToMessage,
    ProcessorAsync { input: ArgForm },
    ProcessorStreamBuilder { input: ArgForm, output: ArgForm },
    Consumer { input: ArgForm },
    ConsumerAsync { input: ArgForm },
}

impl Shape {
    pub fn is_producer(&self) -> bool {
        matches!(
            self,
            Shape::ProducerValue
                | Shape::ProducerMessage
                | Shape::ProducerAsyncValue
                | Shape::ProducerAsyncMessage
                | Shape::ProducerStream { .. }
        )
    }

    pub fn is_consumer(&self) -> bool {
        matches!(self, Shape::Consumer { .. } | Shape::ConsumerAsync { .. })
    }

    pub fn is_processor(&self) -> bool {
        !self.is_producer() && !self.is_consumer()
    }

    /// Shapes that splice a multi-element stream into the pipeline
    pub fn is_stream(&self) -> bool {
        matches!(
            self,
            Shape::ProducerStream { .. } | Shape::ProcessorStreamBuilder { .. }
        )
    }

    /// The form of the single inbound element, for 1:1 shapes
    pub fn input_form(&self) -> Option<ArgForm> {
        match self {
            Shape::ProcessorValueToValue | Shape::ProcessorValueToMessage => Some(ArgForm::Value),
            Shape::ProcessorMessageToMessage => Some(ArgForm::Message),
            Shape::ProcessorAsync { input }
            | Shape::Consumer { input }
            | Shape::ConsumerAsync { input } => Some(*input),
            _ => None,
        }
    }

    /// Whether the user method receives the wrapped Message (and can
    /// therefore acknowledge manually)
    pub fn exposes_message(&self) -> bool {
        match self {
            Shape::ProcessorMessageToMessage => true,
            Shape::ProcessorAsync { input }
            | Shape::Consumer { input }
            | Shape::ConsumerAsync { input } => *input == ArgForm::Message,
            Shape::ProcessorStreamBuilder { input, .. } => *input == ArgForm::Message,
            _ => false,
        }
    }

    /// Default acknowledgment policy when neither descriptor nor
    /// configuration declares one.
    pub fn default_policy(&self) -> AckPolicy {
        if self.is_producer() || self.is_stream() {
            AckPolicy::None
        } else {
            AckPolicy::Post
        }
    }

    /// Stream shapes manage their own internal concurrency.
    pub fn implicitly_tolerant(&self) -> bool {
        self.is_stream()
    }

    pub fn label(&self) -> &'static str {
        match self {
            Shape::ProducerValue => "producer-value",
            Shape::ProducerMessage => "producer-message",
            Shape::ProducerAsyncValue => "producer-async-value",
            Shape::ProducerAsyncMessage => "producer-async-message",
            Shape::ProducerStream { .. } => "producer-stream",
            Shape::ProcessorValueToValue => "processor-value-to-value",
            Shape::ProcessorValueToMessage => "processor-value-to-message",
            Shape::ProcessorMessageToMessage => "processor-message-to-message",
            Shape::ProcessorAsync { .. } => "processor-async",
            Shape::ProcessorStreamBuilder { .. } => "processor-stream-builder",
            Shape::Consumer { .. } => "consumer",
            Shape::ConsumerAsync { .. } => "consumer-async",
        }
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

fn element_form(inner: &TypeShape) -> Option<ArgForm> {
    match inner {
        TypeShape::Value => Some(ArgForm::Value),
        TypeShape::Message => Some(ArgForm::Message),
        _ => None,
    }
}

/// Classify a method descriptor into its invocation shape.
pub fn classify(descriptor: &MethodDescriptor) -> Result<Shape, MediatorError> {
    let method = descriptor.name();
    let family = match (descriptor.inbound(), descriptor.outbound()) {
        (Some(_), Some(_)) => "processor",
        (Some(_), None) => "consumer",
        (None, Some(_)) => "producer",
        (None, None) => {
            return Err(MediatorError::classification(
                method,
                "no inbound or outbound channel declared",
            ));
        }
    };

    let shape = match family {
        "producer" => classify_producer(descriptor),
        "consumer" => classify_consumer(descriptor),
        _ => classify_processor(descriptor),
    };

    shape.ok_or_else(|| {
        MediatorError::classification(
            method,
            format!(
                "signature {} is not in the {family} table",
                descriptor.signature()
            ),
        )
    })
}

fn classify_producer(descriptor: &MethodDescriptor) -> Option<Shape> {
    if !descriptor.params().is_empty() {
        return None;
    }
    match descriptor.returns() {
        TypeShape::Value => Some(Shape::ProducerValue),
        TypeShape::Message => Some(Shape::ProducerMessage),
        TypeShape::Future(inner) => match **inner {
            TypeShape::Value => Some(Shape::ProducerAsyncValue),
            TypeShape::Message => Some(Shape::ProducerAsyncMessage),
            _ => None,
        },
        TypeShape::Stream(inner) | TypeShape::Builder(inner) => {
            element_form(inner).map(|element| Shape::ProducerStream { element })
        }
        _ => None,
    }
}

fn classify_processor(descriptor: &MethodDescriptor) -> Option<Shape> {
    let [param] = descriptor.params() else {
        return None;
    };
    match (param, descriptor.returns()) {
        (TypeShape::Value, TypeShape::Value) => Some(Shape::ProcessorValueToValue),
        (TypeShape::Value, TypeShape::Message) => Some(Shape::ProcessorValueToMessage),
        (TypeShape::Message, TypeShape::Message) => Some(Shape::ProcessorMessageToMessage),
        (TypeShape::Value, TypeShape::Future(inner)) => {
            element_form(inner).map(|_| Shape::ProcessorAsync {
                input: ArgForm::Value,
            })
        }
        (TypeShape::Message, TypeShape::Future(inner)) => {
            element_form(inner).map(|_| Shape::ProcessorAsync {
                input: ArgForm::Message,
            })
        }
        (
            TypeShape::Stream(input) | TypeShape::Builder(input),
            TypeShape::Stream(output) | TypeShape::Builder(output),
        ) => match (element_form(input), element_form(output)) {
            (Some(input), Some(output)) => Some(Shape::ProcessorStreamBuilder { input, output }),
            _ => None,
        },
        _ => None,
    }
}

fn classify_consumer(descriptor: &MethodDescriptor) -> Option<Shape> {
    let [param] = descriptor.params() else {
        return None;
    };
    let input = element_form(param)?;
    match descriptor.returns() {
        TypeShape::Void => Some(Shape::Consumer { input }),
        TypeShape::Future(inner) if **inner == TypeShape::Void => {
            Some(Shape::ConsumerAsync { input })
        }
        _ => None,
    }
}

/// The policy a stage runs under: configuration override, then the
/// descriptor's declaration, then the shape default.
pub fn effective_policy(
    shape: Shape,
    declared: Option<AckPolicy>,
    configured: Option<AckPolicy>,
) -> AckPolicy {
    configured
        .or(declared)
        .unwrap_or_else(|| shape.default_policy())
}

/// Reject policy/shape combinations the propagator cannot honor.
/// Surfaced at wiring time with the same severity as classification.
pub fn validate_policy(
    shape: Shape,
    policy: AckPolicy,
    method: &str,
) -> Result<(), MediatorError> {
    if policy == AckPolicy::Manual && !shape.exposes_message() {
        return Err(MediatorError::classification(
            method,
            format!("manual acknowledgment requires the wrapped message form, but shape is {shape}"),
        ));
    }
    if shape.is_producer() && matches!(policy, AckPolicy::Pre | AckPolicy::Manual) {
        return Err(MediatorError::classification(
            method,
            format!("policy has no inbound message to apply to on shape {shape}"),
        ));
    }
    if matches!(shape, Shape::ProcessorStreamBuilder { .. })
        && matches!(policy, AckPolicy::Pre | AckPolicy::Post)
    {
        return Err(MediatorError::classification(
            method,
            "stream builders manage their own per-element acknowledgment",
        ));
    }
    Ok(())
}
