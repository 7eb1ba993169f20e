//! Static descriptions of user processing methods.
//!
//! No runtime reflection: descriptors are built at registration time from
//! explicit declarations and classified once at wiring time.

use crate::ack::AckPolicy;
use serde::Deserialize;
use std::fmt;

/// Structural type descriptor for a parameter or return position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeShape {
    /// No value (void return)
    Void,
    /// A raw payload value
    Value,
    /// A wrapped Message
    Message,
    /// An asynchronous completion resolving to the inner shape
    Future(Box<TypeShape>),
    /// A multi-element stream of the inner shape
    Stream(Box<TypeShape>),
    /// A stream builder of the inner shape
    Builder(Box<TypeShape>),
}

impl TypeShape {
    pub fn future(inner: TypeShape) -> Self {
        TypeShape::Future(Box::new(inner))
    }

    pub fn stream(inner: TypeShape) -> Self {
        TypeShape::Stream(Box::new(inner))
    }

    pub fn builder(inner: TypeShape) -> Self {
        TypeShape::Builder(Box::new(inner))
    }
}

impl fmt::Display for TypeShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeShape::Void => write!(f, "void"),
            TypeShape::Value => write!(f, "value"),
            TypeShape::Message => write!(f, "message"),
            TypeShape::Future(inner) => write!(f, "future<{inner}>"),
            TypeShape::Stream(inner) => write!(f, "stream<{inner}>"),
            TypeShape::Builder(inner) => write!(f, "builder<{inner}>"),
        }
    }
}

/// Whether a stage tolerates overlapping invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Concurrency {
    /// Invocations never overlap (the engine's default guarantee)
    Sequential,
    /// The method manages its own internal concurrency
    Tolerant,
}

impl Default for Concurrency {
    fn default() -> Self {
        Concurrency::Sequential
    }
}

/// Static description of a user processing method, created once at wiring
/// time and immutable thereafter.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    name: String,
    params: Vec<TypeShape>,
    returns: TypeShape,
    inbound: Option<String>,
    outbound: Option<String>,
    ack_policy: Option<AckPolicy>,
    concurrency: Concurrency,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns: TypeShape::Void,
            inbound: None,
            outbound: None,
            ack_policy: None,
            concurrency: Concurrency::default(),
        }
    }

    pub fn with_param(mut self, param: TypeShape) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_params(mut self, params: Vec<TypeShape>) -> Self {
        self.params = params;
        self
    }

    pub fn returning(mut self, returns: TypeShape) -> Self {
        self.returns = returns;
        self
    }

    /// Declare the inbound channel this method consumes
    pub fn with_inbound(mut self, channel: impl Into<String>) -> Self {
        self.inbound = Some(channel.into());
        self
    }

    /// Declare the outbound channel this method publishes to
    pub fn with_outbound(mut self, channel: impl Into<String>) -> Self {
        self.outbound = Some(channel.into());
        self
    }

    pub fn with_ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = Some(policy);
        self
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[TypeShape] {
        &self.params
    }

    pub fn returns(&self) -> &TypeShape {
        &self.returns
    }

    pub fn inbound(&self) -> Option<&str> {
        self.inbound.as_deref()
    }

    pub fn outbound(&self) -> Option<&str> {
        self.outbound.as_deref()
    }

    pub fn ack_policy(&self) -> Option<AckPolicy> {
        self.ack_policy
    }

    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    /// Human-readable signature for diagnostics
    pub fn signature(&self) -> String {
        let params = self
            .params
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!("({params}) -> {}", self.returns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_shape_display() {
        let shape = TypeShape::future(TypeShape::Message);
        assert_eq!(shape.to_string(), "future<message>");
        assert_eq!(
            TypeShape::builder(TypeShape::Value).to_string(),
            "builder<value>"
        );
    }

    #[test]
    fn test_descriptor_signature() {
        let descriptor = MethodDescriptor::new("process")
            .with_inbound("count")
            .with_outbound("sink")
            .with_param(TypeShape::Message)
            .returning(TypeShape::future(TypeShape::Message));
        assert_eq!(descriptor.signature(), "(message) -> future<message>");
        assert_eq!(descriptor.inbound(), Some("count"));
        assert_eq!(descriptor.outbound(), Some("sink"));
    }
}
