//! Weave Core
//!
//! This crate provides the reactive effect engine at the heart of the Weave
//! framework. It implements:
//!
//! - Dependency tracking (which effect read which property)
//! - Invalidation (which effects a mutation must re-run)
//! - Effect scopes for bulk disposal
//!
//! The engine is driven from the outside: a reactive-object proxy layer
//! reports property reads through `track` and mutations through `trigger`.
//! Value wrappers such as refs and computed values sit on top of the same
//! primitives through standalone deps.
//!
//! # Architecture
//!
//! Everything lives in the `reactive` module:
//!
//! - `Dep`: the subscriber set for one (target, key) pair
//! - `ReactiveEffect` and the `effect` factory: re-runnable computations
//! - `track` / `trigger`: the registry entry points called by proxies
//! - `EffectScope`: lifetime containers that dispose effects as a group
//!
//! # Example
//!
//! ```rust,ignore
//! use weave_core::reactive::{effect, track, trigger};
//! use weave_core::reactive::{Target, TargetKind, TrackOp, TrackedKey, TriggerOp};
//!
//! // A proxy layer would mint one target per observed object.
//! let obj = Target::new(TargetKind::Plain);
//!
//! // The effect reads obj.count; the proxy reports the read.
//! let runner = effect(move || {
//!     track(obj, TrackOp::Get, TrackedKey::prop("count"));
//!     println!("count changed");
//! });
//!
//! // A write re-runs the effect.
//! trigger(obj, TriggerOp::Set, Some(TrackedKey::prop("count")), None);
//! ```

pub mod reactive;
