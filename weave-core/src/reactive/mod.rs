//! Reactive effect engine.
//!
//! This module implements the dependency tracking and invalidation core:
//! deps, effects, the tracking registry and effect scopes.
//!
//! # Concepts
//!
//! ## Deps
//!
//! A `Dep` is the subscriber set for one (target, key) pair. It carries two
//! marker bitmasks used to reconcile an effect's subscriptions across runs
//! without rebuilding them from scratch.
//!
//! ## Effects
//!
//! An `Effect` wraps a user function. Running it makes the effect the active
//! one, so every read reported through `track` during the run subscribes the
//! effect to the property that was read. Runs nest; each effect remembers
//! its parent for the duration of its run.
//!
//! ## Track and trigger
//!
//! An external proxy layer reports reads through [`track`] and mutations
//! through [`trigger`]. The engine never sees host values; targets are
//! opaque handles and keys are plain data. `trigger` selects the affected
//! deps from the mutation kind and the target's shape, then re-runs or
//! schedules every subscribed effect, computed-backed effects first.
//!
//! ## Scopes
//!
//! An [`EffectScope`] owns effects and cleanup callbacks and forms a tree
//! with other scopes. Stopping a scope disposes everything it transitively
//! owns in one call.
//!
//! # Implementation notes
//!
//! The execution context is thread-local. Signals of intent such as
//! [`pause_tracking`] nest through a save stack, and effect runs restore the
//! context through RAII frames even when user code panics. Diagnostics go
//! through the `log` facade and the per-effect debug hooks; the hooks are
//! only consulted in debug builds.

mod context;
mod dep;
mod effect;
mod registry;
mod scope;
mod target;

pub use context::{
    active_effect, enable_tracking, is_tracking, pause_tracking, reset_tracking, should_track,
};
pub use dep::Dep;
pub use effect::{
    effect, effect_with_options, stop, DebuggerEvent, DebuggerOp, EffectId, EffectOptions,
    EffectRunner, ReactiveEffect, WeakEffect,
};
pub use registry::{
    drop_target, get_dep_from_reactive, track, track_effects, trigger, trigger_effects,
};
pub use scope::{get_current_scope, on_scope_dispose, record_effect_scope, EffectScope};
pub use target::{Target, TargetId, TargetKind, TrackOp, TrackedKey, TriggerOp};
