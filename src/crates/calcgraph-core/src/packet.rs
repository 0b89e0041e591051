//! Immutable, reference-counted, type-erased values with an attached timestamp.

use crate::timestamp::Timestamp;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A unit of data flowing on a stream.
///
/// A packet pairs a payload of any `Send + Sync` type with a [`Timestamp`].
/// Payloads are stored behind an [`Arc`], so cloning a packet is cheap and
/// every holder shares ownership of the same immutable value. A
/// default-constructed packet is *empty*: it has no payload and the
/// [`Timestamp::UNSET`] timestamp, and is used as the "no input this round"
/// sentinel handed to calculators.
///
/// Packets are never mutated. [`Packet::at`] produces a copy with a different
/// timestamp; the payload is shared between the copies.
#[derive(Clone, Default)]
pub struct Packet {
    payload: Option<Arc<dyn Any + Send + Sync>>,
    type_name: &'static str,
    timestamp: Timestamp,
}

impl Packet {
    /// Creates a packet holding `value`, with no timestamp attached yet.
    pub fn new<T: Send + Sync + 'static>(value: T) -> Packet {
        Packet {
            payload: Some(Arc::new(value)),
            type_name: std::any::type_name::<T>(),
            timestamp: Timestamp::UNSET,
        }
    }

    /// Creates an empty packet (no payload, unset timestamp).
    pub fn empty() -> Packet {
        Packet::default()
    }

    /// Returns a copy of this packet carrying `timestamp`.
    ///
    /// The payload is shared with `self`; this is an immutable update, not an
    /// in-place mutation.
    #[must_use]
    pub fn at(&self, timestamp: Timestamp) -> Packet {
        Packet {
            payload: self.payload.clone(),
            type_name: self.type_name,
            timestamp,
        }
    }

    /// The packet's timestamp ([`Timestamp::UNSET`] if never stamped).
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// True if this packet holds no payload.
    pub fn is_empty(&self) -> bool {
        self.payload.is_none()
    }

    /// The name of the payload type, if any.
    pub fn type_name(&self) -> Option<&'static str> {
        self.payload.as_ref().map(|_| self.type_name)
    }

    /// Borrows the payload as `T`.
    ///
    /// Type safety is normally established by graph validation before a run
    /// starts, so a mismatch here is a bug in a calculator implementation.
    ///
    /// # Panics
    ///
    /// Panics if the packet is empty or the payload is not a `T`.
    pub fn get<T: Send + Sync + 'static>(&self) -> &T {
        match self.try_get::<T>() {
            Some(value) => value,
            None if self.is_empty() => panic!(
                "Packet::get::<{}>() called on an empty packet",
                std::any::type_name::<T>()
            ),
            None => panic!(
                "Packet::get::<{}>() called on a packet holding {}",
                std::any::type_name::<T>(),
                self.type_name
            ),
        }
    }

    /// Borrows the payload as `T`, or `None` if empty or of a different type.
    pub fn try_get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.payload
            .as_deref()
            .and_then(|payload| payload.downcast_ref::<T>())
    }

    /// True if the payload is a `T`.
    pub fn holds<T: Send + Sync + 'static>(&self) -> bool {
        self.try_get::<T>().is_some()
    }

    pub(crate) fn payload_type_id(&self) -> Option<std::any::TypeId> {
        self.payload.as_deref().map(|payload| payload.type_id())
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Some(_) => write!(f, "Packet<{}>@{}", self.type_name, self.timestamp),
            None => write!(f, "Packet<empty>@{}", self.timestamp),
        }
    }
}
