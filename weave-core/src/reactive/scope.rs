//! Effect scopes.
//!
//! A scope is the unit of bulk disposal. Effects created for one owner, a
//! UI component for instance, are registered in that owner's scope; tearing
//! the owner down stops every owned effect, runs the registered cleanups and
//! cascades into child scopes with one call, however deeply they nest.
//!
//! Scopes form a tree. A scope created while another scope is active links
//! itself under that parent unless it is constructed detached; a detached
//! scope has no parent link and survives parent-initiated cascades.
//!
//! # Disposal order
//!
//! `stop` first stops the owned effects, then runs cleanups in registration
//! order, then stops child scopes. A panicking cleanup is reported through
//! the warning channel and does not prevent the remaining cleanups or the
//! child cascade; the first payload is re-raised once disposal finished.
//! Removing a scope from its parent's child list is O(1): the scope swaps
//! itself with the last sibling using the index recorded at construction.

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use super::effect::ReactiveEffect;

thread_local! {
    static ACTIVE_SCOPE: RefCell<Option<EffectScope>> = const { RefCell::new(None) };
}

struct ScopeInner {
    active: Cell<bool>,
    detached: bool,
    effects: RefCell<Vec<ReactiveEffect>>,
    cleanups: RefCell<Vec<Box<dyn FnOnce()>>>,
    parent: RefCell<Option<Weak<ScopeInner>>>,
    scopes: RefCell<Vec<EffectScope>>,
    /// Position inside the parent's child list, kept current across swaps.
    index: Cell<usize>,
}

/// A lifetime container owning effects and cleanup callbacks.
///
/// Cloning yields another handle to the same scope.
#[derive(Clone)]
pub struct EffectScope {
    inner: Rc<ScopeInner>,
}

impl EffectScope {
    /// Create a scope.
    ///
    /// A non-detached scope created while another scope is active becomes a
    /// child of that scope and is stopped when the parent stops.
    pub fn new(detached: bool) -> Self {
        let scope = Self {
            inner: Rc::new(ScopeInner {
                active: Cell::new(true),
                detached,
                effects: RefCell::new(Vec::new()),
                cleanups: RefCell::new(Vec::new()),
                parent: RefCell::new(None),
                scopes: RefCell::new(Vec::new()),
                index: Cell::new(0),
            }),
        };
        if !detached {
            if let Some(parent) = get_current_scope() {
                *scope.inner.parent.borrow_mut() = Some(Rc::downgrade(&parent.inner));
                let mut siblings = parent.inner.scopes.borrow_mut();
                siblings.push(scope.clone());
                scope.inner.index.set(siblings.len() - 1);
            }
        }
        scope
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.get()
    }

    /// Run `f` with this scope active, restoring the previous one after.
    ///
    /// Returns `None` and warns when the scope has already been stopped.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if !self.inner.active.get() {
            log::warn!("cannot run an inactive effect scope");
            return None;
        }
        let _guard = ScopeGuard::enter(self);
        Some(f())
    }

    /// Make this scope the active one. Pair with [`off`](Self::off).
    pub fn on(&self) {
        ACTIVE_SCOPE.with(|scope| *scope.borrow_mut() = Some(self.clone()));
    }

    /// Restore this scope's parent as the active one.
    pub fn off(&self) {
        let parent = self
            .inner
            .parent
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| EffectScope { inner });
        ACTIVE_SCOPE.with(|scope| *scope.borrow_mut() = parent);
    }

    /// Stop every owned effect, run the cleanups, cascade into child scopes
    /// and detach from the parent. Idempotent.
    pub fn stop(&self) {
        self.stop_inner(false);
    }

    fn stop_inner(&self, from_parent: bool) {
        if !self.inner.active.get() {
            return;
        }

        let effects = std::mem::take(&mut *self.inner.effects.borrow_mut());
        for effect in effects {
            effect.stop();
        }

        let cleanups = std::mem::take(&mut *self.inner.cleanups.borrow_mut());
        let mut first_panic = None;
        for cleanup in cleanups {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(cleanup)) {
                log::error!(
                    "effect scope cleanup panicked: {}",
                    panic_message(payload.as_ref())
                );
                if first_panic.is_none() {
                    first_panic = Some(payload);
                }
            }
        }

        let children = std::mem::take(&mut *self.inner.scopes.borrow_mut());
        for child in children {
            child.stop_inner(true);
        }

        // A parent-initiated cascade is already consuming the child list;
        // only a direct stop detaches itself.
        if !self.inner.detached && !from_parent {
            let parent = self.inner.parent.borrow().as_ref().and_then(Weak::upgrade);
            if let Some(parent) = parent {
                let mut siblings = parent.scopes.borrow_mut();
                if let Some(last) = siblings.pop() {
                    let index = self.inner.index.get();
                    if !Rc::ptr_eq(&last.inner, &self.inner) {
                        last.inner.index.set(index);
                        siblings[index] = last;
                    }
                }
            }
        }
        *self.inner.parent.borrow_mut() = None;
        self.inner.active.set(false);

        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
    }
}

impl std::fmt::Debug for EffectScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectScope")
            .field("active", &self.is_active())
            .field("detached", &self.inner.detached)
            .field("effects", &self.inner.effects.borrow().len())
            .field("children", &self.inner.scopes.borrow().len())
            .finish()
    }
}

/// Restores the previously active scope when dropped.
struct ScopeGuard {
    prev: Option<EffectScope>,
}

impl ScopeGuard {
    fn enter(scope: &EffectScope) -> Self {
        let prev = ACTIVE_SCOPE.with(|active| active.borrow_mut().replace(scope.clone()));
        Self { prev }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        ACTIVE_SCOPE.with(|active| *active.borrow_mut() = prev);
    }
}

/// The currently active scope, if any.
pub fn get_current_scope() -> Option<EffectScope> {
    ACTIVE_SCOPE.with(|scope| scope.borrow().clone())
}

/// Register `effect` with `scope`, or with the active scope when `None`.
///
/// Inactive scopes do not accept effects.
pub fn record_effect_scope(effect: &ReactiveEffect, scope: Option<&EffectScope>) {
    let scope = match scope {
        Some(scope) => Some(scope.clone()),
        None => get_current_scope(),
    };
    if let Some(scope) = scope {
        if scope.inner.active.get() {
            scope.inner.effects.borrow_mut().push(effect.clone());
        }
    }
}

/// Register a cleanup on the active scope, invoked once when it stops.
///
/// Warns when no scope is active; the callback is dropped.
pub fn on_scope_dispose(f: impl FnOnce() + 'static) {
    match get_current_scope() {
        Some(scope) => scope.inner.cleanups.borrow_mut().push(Box::new(f)),
        None => log::warn!(
            "on_scope_dispose() is called when there is no active effect scope to be associated with"
        ),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("opaque panic payload")
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
