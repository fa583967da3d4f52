//! Target identity and property keys.
//!
//! The engine never inspects host objects. An external proxy layer mints a
//! `Target` handle when it makes an object observable and passes that handle
//! to `track` and `trigger`. The handle carries a process-unique id plus the
//! object's shape, which drives the selection rules for structural mutations.

use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for an observed object.
///
/// Each observed object gets a unique ID when the proxy layer makes it
/// reactive. Uses an atomic counter to ensure uniqueness across threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(u64);

impl TargetId {
    /// Generate a new unique target ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for TargetId {
    fn default() -> Self {
        Self::new()
    }
}

/// The shape of an observed object, declared by the proxy layer.
///
/// `trigger` applies different fan-out rules to list-shaped and map-shaped
/// targets; everything else is `Plain`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    /// A plain keyed object.
    Plain,
    /// An indexable sequence with a length.
    List,
    /// A keyed collection whose iteration observes values as well as keys.
    Map,
}

/// Handle for one observed object: identity plus shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target {
    id: TargetId,
    kind: TargetKind,
}

impl Target {
    /// Mint a handle for a newly observed object.
    pub fn new(kind: TargetKind) -> Self {
        Self {
            id: TargetId::new(),
            kind,
        }
    }

    pub fn id(&self) -> TargetId {
        self.id
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }
}

/// A property key inside one observed object.
///
/// `Iterate` and `MapKeyIterate` are the reserved iteration keys. They are
/// ordinary entries in the per-target key map; only their identity is
/// special, standing for "the set of keys" and "the set of map keys"
/// respectively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrackedKey {
    /// A named property.
    Prop(String),
    /// A list element.
    Index(usize),
    /// The length pseudo-property of a list.
    Length,
    /// Iteration over a collection.
    Iterate,
    /// Iteration over map keys specifically.
    MapKeyIterate,
}

impl TrackedKey {
    /// Shorthand for a named property key.
    pub fn prop(name: impl Into<String>) -> Self {
        Self::Prop(name.into())
    }
}

/// The kind of read reported through `track`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackOp {
    Get,
    Has,
    Iterate,
}

/// The kind of mutation reported through `trigger`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerOp {
    Set,
    Add,
    Delete,
    Clear,
}
