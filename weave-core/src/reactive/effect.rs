//! Effect implementation.
//!
//! An effect wraps a user function and re-executes it whenever one of the
//! properties it read is mutated.
//!
//! # How a run works
//!
//! 1. The effect makes itself the active effect and records its parent, so
//!    nested runs form a chain.
//!
//! 2. Every dep it is already subscribed to is marked "was tracked" at the
//!    current recursion depth.
//!
//! 3. The user function executes. Reads reported through `track` mark deps
//!    "newly tracked" and subscribe the effect to deps it did not hold yet.
//!
//! 4. On exit the effect removes itself from every dep that was tracked
//!    before but not read this time, clears the markers, and restores the
//!    previous context. Unchanged dependencies cost only bit flips.
//!
//! Entry and exit are one RAII frame, so a panic inside the user function
//! still restores the context; subscriptions made before the panic are kept.
//!
//! Beyond depth 30 the marker fast path no longer has a bit to use, and the
//! run falls back to dropping all subscriptions up front and rebuilding them
//! from the reads it observes.
//!
//! # Disposal
//!
//! `stop` removes the effect from every dep and marks it inactive. Stopping
//! the effect that is currently running is deferred to the end of its run.
//! A stopped effect's runner still evaluates the function, but without
//! entering a tracking frame, so it never re-subscribes.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use super::context::{self, MAX_MARKER_BITS};
use super::dep::Dep;
use super::scope::{self, EffectScope};
use super::target::{TargetId, TrackOp, TrackedKey, TriggerOp};

/// Counter for generating unique effect IDs.
static EFFECT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EffectId(u64);

impl EffectId {
    fn next() -> Self {
        Self(EFFECT_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The operation behind a debug event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerOp {
    Track(TrackOp),
    Trigger(TriggerOp),
}

/// Payload handed to the `on_track` and `on_trigger` debug hooks.
#[derive(Debug, Clone)]
pub struct DebuggerEvent {
    pub target: TargetId,
    pub op: DebuggerOp,
    pub key: Option<TrackedKey>,
}

/// Construction options for [`effect_with_options`].
#[derive(Default)]
pub struct EffectOptions {
    /// Do not run on creation.
    pub lazy: bool,
    /// Invoked instead of `run` when the effect is triggered. The scheduler
    /// decides when, and whether, the run actually happens.
    pub scheduler: Option<Rc<dyn Fn()>>,
    /// Scope that owns the effect. Defaults to the currently active scope.
    pub scope: Option<EffectScope>,
    /// Let a trigger raised during the effect's own run re-invoke it.
    pub allow_recurse: bool,
    /// Marks an effect backing a computed value. Computed effects are
    /// notified ahead of ordinary effects.
    pub computed: bool,
    /// Invoked once when the effect is stopped.
    pub on_stop: Option<Box<dyn FnOnce()>>,
    /// Fired when the effect subscribes to a dep. Debug builds only.
    pub on_track: Option<Rc<dyn Fn(&DebuggerEvent)>>,
    /// Fired when a mutation notifies the effect. Debug builds only.
    pub on_trigger: Option<Rc<dyn Fn(&DebuggerEvent)>>,
}

struct EffectInner {
    id: EffectId,
    run_fn: Rc<dyn Fn()>,
    scheduler: Option<Rc<dyn Fn()>>,
    /// Deps this effect is currently subscribed to.
    deps: RefCell<Vec<Dep>>,
    active: Cell<bool>,
    /// The effect that was running when this one entered its run frame.
    parent: RefCell<Option<ReactiveEffect>>,
    defer_stop: Cell<bool>,
    computed: bool,
    allow_recurse: bool,
    on_stop: RefCell<Option<Box<dyn FnOnce()>>>,
    on_track: Option<Rc<dyn Fn(&DebuggerEvent)>>,
    on_trigger: Option<Rc<dyn Fn(&DebuggerEvent)>>,
}

/// A user function plus the bookkeeping needed to re-run it.
///
/// Cloning yields another handle to the same effect.
#[derive(Clone)]
pub struct ReactiveEffect {
    inner: Rc<EffectInner>,
}

/// Non-owning handle to an effect, held by deps.
#[derive(Clone)]
pub struct WeakEffect {
    id: EffectId,
    inner: Weak<EffectInner>,
}

impl WeakEffect {
    pub fn id(&self) -> EffectId {
        self.id
    }

    pub fn upgrade(&self) -> Option<ReactiveEffect> {
        self.inner.upgrade().map(|inner| ReactiveEffect { inner })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl ReactiveEffect {
    /// Create an effect with default options. The effect does not run;
    /// callers decide when the first run happens.
    pub fn new(f: impl Fn() + 'static) -> Self {
        Self::with_options(f, EffectOptions::default())
    }

    /// Create an effect and register it with its owning scope.
    pub fn with_options(f: impl Fn() + 'static, options: EffectOptions) -> Self {
        let effect = Self {
            inner: Rc::new(EffectInner {
                id: EffectId::next(),
                run_fn: Rc::new(f),
                scheduler: options.scheduler,
                deps: RefCell::new(Vec::new()),
                active: Cell::new(true),
                parent: RefCell::new(None),
                defer_stop: Cell::new(false),
                computed: options.computed,
                allow_recurse: options.allow_recurse,
                on_stop: RefCell::new(options.on_stop),
                on_track: options.on_track,
                on_trigger: options.on_trigger,
            }),
        };
        scope::record_effect_scope(&effect, options.scope.as_ref());
        effect
    }

    pub fn id(&self) -> EffectId {
        self.inner.id
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.get()
    }

    pub fn is_computed(&self) -> bool {
        self.inner.computed
    }

    pub fn allow_recurse(&self) -> bool {
        self.inner.allow_recurse
    }

    /// Number of deps the effect is currently subscribed to.
    pub fn deps_len(&self) -> usize {
        self.inner.deps.borrow().len()
    }

    pub fn downgrade(&self) -> WeakEffect {
        WeakEffect {
            id: self.inner.id,
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Whether two handles refer to the same effect.
    pub fn ptr_eq(a: &ReactiveEffect, b: &ReactiveEffect) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    pub(crate) fn scheduler(&self) -> Option<Rc<dyn Fn()>> {
        self.inner.scheduler.clone()
    }

    pub(crate) fn parent(&self) -> Option<ReactiveEffect> {
        self.inner.parent.borrow().clone()
    }

    pub(crate) fn push_dep(&self, dep: Dep) {
        self.inner.deps.borrow_mut().push(dep);
    }

    pub(crate) fn fire_on_track(&self, event: &DebuggerEvent) {
        if cfg!(debug_assertions) {
            if let Some(hook) = &self.inner.on_track {
                hook(event);
            }
        }
    }

    pub(crate) fn fire_on_trigger(&self, event: &DebuggerEvent) {
        if cfg!(debug_assertions) {
            if let Some(hook) = &self.inner.on_trigger {
                hook(event);
            }
        }
    }

    /// Re-execute the user function with dependency tracking enabled.
    ///
    /// A stopped effect evaluates the function directly, without touching
    /// the tracking context. If this effect is already somewhere on the
    /// running parent chain the call returns without running, which cuts off
    /// unbounded self-recursion through chains of nested effects.
    pub fn run(&self) {
        if !self.inner.active.get() {
            (self.inner.run_fn)();
            return;
        }

        let mut cursor = context::active_effect();
        while let Some(ancestor) = cursor {
            if ReactiveEffect::ptr_eq(&ancestor, self) {
                return;
            }
            cursor = ancestor.parent();
        }

        let _frame = RunFrame::enter(self);
        (self.inner.run_fn)();
    }

    /// Dispose the effect: unsubscribe from every dep, fire `on_stop`, mark
    /// inactive. Deferred to the end of the run when the effect is currently
    /// executing. Idempotent.
    pub fn stop(&self) {
        let is_running = context::active_effect()
            .map_or(false, |active| ReactiveEffect::ptr_eq(&active, self));
        if is_running {
            self.inner.defer_stop.set(true);
        } else if self.inner.active.get() {
            self.clear_deps();
            if let Some(on_stop) = self.inner.on_stop.borrow_mut().take() {
                on_stop();
            }
            self.inner.active.set(false);
        }
    }

    /// Mark every held dep "was tracked" at the current depth.
    fn init_dep_markers(&self) {
        let bit = context::track_op_bit();
        for dep in self.inner.deps.borrow().iter() {
            dep.init_marker(bit);
        }
    }

    /// Drop deps that were not read during this run and clear all markers
    /// at the current depth, compacting the dep list in place.
    fn finalize_dep_markers(&self) {
        let bit = context::track_op_bit();
        let id = self.inner.id;
        self.inner.deps.borrow_mut().retain(|dep| {
            let stale = dep.was_tracked() && !dep.newly_tracked();
            if stale {
                dep.remove_id(id);
            }
            dep.clear_markers(bit);
            !stale
        });
    }

    /// Remove this effect from every dep and forget them all.
    fn clear_deps(&self) {
        let deps = std::mem::take(&mut *self.inner.deps.borrow_mut());
        let id = self.inner.id;
        for dep in deps {
            dep.remove_id(id);
        }
    }
}

impl std::fmt::Debug for ReactiveEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveEffect")
            .field("id", &self.inner.id)
            .field("active", &self.is_active())
            .field("computed", &self.inner.computed)
            .field("deps", &self.deps_len())
            .finish()
    }
}

/// RAII frame for one effect run.
///
/// Entering saves the tracking context and marks the held deps; dropping
/// reconciles dep membership and restores the context, including when the
/// user function panics.
struct RunFrame {
    effect: ReactiveEffect,
    prev_should_track: bool,
}

impl RunFrame {
    fn enter(effect: &ReactiveEffect) -> Self {
        let prev_should_track = context::should_track();
        let prev_active = context::swap_active_effect(Some(effect.clone()));
        *effect.inner.parent.borrow_mut() = prev_active;
        context::set_should_track(true);

        let depth = context::enter_run_frame();
        if depth <= MAX_MARKER_BITS {
            effect.init_dep_markers();
        } else {
            effect.clear_deps();
        }

        Self {
            effect: effect.clone(),
            prev_should_track,
        }
    }
}

impl Drop for RunFrame {
    fn drop(&mut self) {
        if context::effect_track_depth() <= MAX_MARKER_BITS {
            self.effect.finalize_dep_markers();
        }
        context::exit_run_frame();

        let parent = self.effect.inner.parent.borrow_mut().take();
        context::swap_active_effect(parent);
        context::set_should_track(self.prev_should_track);

        if self.effect.inner.defer_stop.get() {
            self.effect.stop();
        }
    }
}

/// Handle returned by [`effect`].
///
/// Re-runs the effect on demand and exposes the underlying
/// [`ReactiveEffect`] for introspection and disposal.
pub struct EffectRunner {
    effect: ReactiveEffect,
}

impl EffectRunner {
    pub fn run(&self) {
        self.effect.run();
    }

    pub fn effect(&self) -> &ReactiveEffect {
        &self.effect
    }
}

/// Create an effect that runs immediately and re-runs whenever a property
/// it read is mutated.
pub fn effect(f: impl Fn() + 'static) -> EffectRunner {
    effect_with_options(f, EffectOptions::default())
}

/// Create an effect with explicit options. Runs immediately unless `lazy`.
pub fn effect_with_options(f: impl Fn() + 'static, options: EffectOptions) -> EffectRunner {
    let lazy = options.lazy;
    let effect = ReactiveEffect::with_options(f, options);
    if !lazy {
        effect.run();
    }
    EffectRunner { effect }
}

/// Dispose an effect through its runner.
pub fn stop(runner: &EffectRunner) {
    runner.effect.stop();
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
