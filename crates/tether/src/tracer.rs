//! Bridge event tracing.
//!
//! A trait-based tracing hook for the bridge, monomorphized so the default
//! [`NoopTracer`] compiles away entirely. Concrete implementations collect
//! different kinds of data:
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | Zero-cost no-op (production default) |
//! | [`StderrTracer`] | Human-readable event log to stderr |
//! | [`RecordingTracer`] | Full event recording for assertions and post-mortem |
//!
//! Events cover the observable lifecycle of the bridge: type creation and
//! teardown, handle pinning, constructor binding and invocation, attribute
//! cache invalidation, and singleton bootstrap/teardown/restore.

use crate::{
    host::{ClassToken, CtorId, RawHandle},
    typeobj::{InstanceId, TypeId},
};

/// One observable bridge event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// A proxy type was published to the type table.
    TypeCreated { type_id: TypeId, name: String },
    /// A proxy type's memory was returned to the type table.
    TypeFreed { type_id: TypeId },
    /// A proxy instance was allocated for a type.
    InstanceAllocated { instance: InstanceId, type_id: TypeId },
    /// A proxy instance was deallocated.
    InstanceFreed { instance: InstanceId },
    /// A host object or class-metadata handle was pinned.
    HandlePinned { handle: RawHandle },
    /// A pinning handle was released.
    HandleReleased { handle: RawHandle },
    /// Overload resolution selected a constructor.
    ConstructorBound { ctor: CtorId },
    /// A constructor invocation completed.
    ConstructorInvoked { ctor: CtorId, ok: bool },
    /// A value type was built through default construction.
    DefaultConstructed { class: ClassToken },
    /// A type's attribute cache tag was bumped.
    CacheInvalidated { type_id: TypeId, version: u64 },
    /// The singleton metatype was constructed.
    Bootstrap { meta: TypeId },
    /// The singleton metatype was torn down.
    Teardown,
    /// The singleton metatype was reconstructed from a snapshot.
    Restored { meta: TypeId },
}

/// Hook invoked for every bridge event.
///
/// Implementations must be cheap; the bridge calls them inline while holding
/// the interpreter's global lock.
pub trait BridgeTracer {
    /// Records one event.
    fn record(&mut self, event: TraceEvent);
}

/// Zero-cost tracer that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl BridgeTracer for NoopTracer {
    #[inline]
    fn record(&mut self, _event: TraceEvent) {}
}

/// Tracer that prints each event to stderr, one line per event.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrTracer;

impl BridgeTracer for StderrTracer {
    fn record(&mut self, event: TraceEvent) {
        eprintln!("[tether] {event:?}");
    }
}

/// Tracer that records every event for later inspection.
#[derive(Debug, Clone, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
}

impl RecordingTracer {
    /// Creates an empty recording tracer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded events in order.
    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Drops all recorded events.
    pub fn reset(&mut self) {
        self.events.clear();
    }
}

impl BridgeTracer for RecordingTracer {
    fn record(&mut self, event: TraceEvent) {
        self.events.push(event);
    }
}
