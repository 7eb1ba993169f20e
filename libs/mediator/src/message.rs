//! Message envelope: payload, typed metadata, acknowledgment handle.
//!
//! Stages exchange the type-erased [`AnyMessage`] form; typed construction
//! and downcast accessors bridge user payload types to it.

use crate::ack::Acknowledgment;
use crate::error::{MediatorError, NackCause};
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// Type-erased payload moving between stages
pub type AnyPayload = Box<dyn Any + Send>;

/// The uniform inter-stage message form
pub type AnyMessage = Message<AnyPayload>;

/// Ordered set of typed attributes attached to a message.
///
/// Lookup is by type, first match wins; inserting an attribute of an
/// already-present type replaces it in place.
#[derive(Clone, Default)]
pub struct Metadata {
    entries: Vec<Arc<dyn Any + Send + Sync>>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-attribute metadata
    pub fn of<T: Any + Send + Sync>(value: T) -> Self {
        let mut metadata = Self::new();
        metadata.insert(value);
        metadata
    }

    /// Insert an attribute, replacing any existing attribute of the same
    /// type without changing its position.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        let entry: Arc<dyn Any + Send + Sync> = Arc::new(value);
        for slot in self.entries.iter_mut() {
            if (**slot).type_id() == TypeId::of::<T>() {
                *slot = entry;
                return;
            }
        }
        self.entries.push(entry);
    }

    /// Builder-style insert
    pub fn with<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.insert(value);
        self
    }

    /// First attribute of type `T`, if present
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.entries.iter().find_map(|e| (**e).downcast_ref::<T>())
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.get::<T>().is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Attributes in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Any + Send + Sync>> {
        self.entries.iter()
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Metadata({} attributes)", self.entries.len())
    }
}

/// Immutable envelope flowing through pipelines.
pub struct Message<T> {
    payload: T,
    metadata: Metadata,
    ack: Acknowledgment,
}

impl<T> Message<T> {
    /// Wrap a payload with empty metadata and a fresh acknowledgment cell
    pub fn of(payload: T) -> Self {
        Self {
            payload,
            metadata: Metadata::new(),
            ack: Acknowledgment::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach one metadata attribute
    pub fn with_attribute<A: Any + Send + Sync>(mut self, attribute: A) -> Self {
        self.metadata.insert(attribute);
        self
    }

    /// Replace the acknowledgment handle
    pub fn with_acknowledgment(mut self, ack: Acknowledgment) -> Self {
        self.ack = ack;
        self
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn acknowledgment(&self) -> &Acknowledgment {
        &self.ack
    }

    /// Acknowledge this message
    pub fn ack(&self) -> Result<(), MediatorError> {
        self.ack.ack()
    }

    /// Negatively acknowledge this message with a cause
    pub fn nack(&self, cause: NackCause) -> Result<(), MediatorError> {
        self.ack.nack(cause)
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    pub fn into_parts(self) -> (T, Metadata, Acknowledgment) {
        (self.payload, self.metadata, self.ack)
    }

    /// Derive a message with a new payload, keeping metadata and the
    /// acknowledgment handle.
    pub fn with_payload<U>(self, payload: U) -> Message<U> {
        Message {
            payload,
            metadata: self.metadata,
            ack: self.ack,
        }
    }

    /// Derive a message by mapping the payload, keeping metadata and the
    /// acknowledgment handle.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Message<U> {
        Message {
            payload: f(self.payload),
            metadata: self.metadata,
            ack: self.ack,
        }
    }
}

impl<T: Send + 'static> Message<T> {
    /// Erase the payload type for inter-stage transport
    pub fn erase(self) -> AnyMessage {
        Message {
            payload: Box::new(self.payload) as AnyPayload,
            metadata: self.metadata,
            ack: self.ack,
        }
    }
}

impl Message<AnyPayload> {
    /// Recover the typed form; returns the erased message unchanged on a
    /// payload type mismatch.
    pub fn downcast<T: Any>(self) -> Result<Message<T>, AnyMessage> {
        match self.payload.downcast::<T>() {
            Ok(payload) => Ok(Message {
                payload: *payload,
                metadata: self.metadata,
                ack: self.ack,
            }),
            Err(payload) => Err(Message {
                payload,
                metadata: self.metadata,
                ack: self.ack,
            }),
        }
    }

    /// Borrow the payload as `T`, if that is its concrete type
    pub fn payload_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl<T> fmt::Debug for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("payload", &std::any::type_name::<T>())
            .field("metadata", &self.metadata)
            .field("ack", &self.ack)
            .finish()
    }
}
