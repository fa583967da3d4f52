//! Subscriber sets.
//!
//! A `Dep` is the set of effects subscribed to one (target, key) pair. Deps
//! live in the tracking registry, or standalone when a value wrapper owns
//! its subscriber set directly.
//!
//! # Marker bits
//!
//! Each dep carries two `u32` marker fields driving the re-tracking
//! protocol that reconciles an effect's subscriptions across runs:
//!
//! - `w` ("was tracked"): bit `d` is set while an effect running at
//!   recursion depth `d` was subscribed to this dep before its run began.
//! - `n` ("newly tracked"): bit `d` is set once the dep has been read again
//!   during that run.
//!
//! On run exit the effect drops every dep whose `w` bit is set but whose
//! `n` bit is not, then clears both bits. A run whose dependencies did not
//! change therefore costs only bit flips per dep instead of a full
//! unsubscribe and resubscribe. At rest both fields are zero.
//!
//! Subscribers are held weakly. An effect whose owners dropped it without
//! stopping it simply stops being notified; dead entries are compacted the
//! next time the dep is snapshotted.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::context;
use super::effect::{EffectId, ReactiveEffect, WeakEffect};

struct DepState {
    subscribers: RefCell<Vec<WeakEffect>>,
    w: Cell<u32>,
    n: Cell<u32>,
}

/// The set of effects subscribed to one (target, key) pair.
///
/// Cloning yields another handle to the same set.
#[derive(Clone)]
pub struct Dep {
    state: Rc<DepState>,
}

impl Dep {
    /// Create an empty dep.
    pub fn new() -> Self {
        Self {
            state: Rc::new(DepState {
                subscribers: RefCell::new(Vec::new()),
                w: Cell::new(0),
                n: Cell::new(0),
            }),
        }
    }

    /// Create a dep pre-populated from a sequence of effects.
    pub fn from_effects(effects: impl IntoIterator<Item = ReactiveEffect>) -> Self {
        let dep = Self::new();
        {
            let mut subscribers = dep.state.subscribers.borrow_mut();
            for effect in effects {
                subscribers.push(effect.downgrade());
            }
        }
        dep
    }

    /// Whether two handles refer to the same subscriber set.
    pub fn ptr_eq(a: &Dep, b: &Dep) -> bool {
        Rc::ptr_eq(&a.state, &b.state)
    }

    /// Subscribe an effect.
    pub fn add(&self, effect: &ReactiveEffect) {
        self.state.subscribers.borrow_mut().push(effect.downgrade());
    }

    /// Unsubscribe an effect.
    pub fn remove(&self, effect: &ReactiveEffect) {
        self.remove_id(effect.id());
    }

    pub(crate) fn remove_id(&self, id: EffectId) {
        self.state
            .subscribers
            .borrow_mut()
            .retain(|weak| weak.id() != id && weak.is_alive());
    }

    /// Whether the effect is subscribed.
    pub fn contains(&self, effect: &ReactiveEffect) -> bool {
        let id = effect.id();
        self.state
            .subscribers
            .borrow()
            .iter()
            .any(|weak| weak.id() == id && weak.is_alive())
    }

    /// Number of live subscribers.
    pub fn len(&self) -> usize {
        self.state
            .subscribers
            .borrow()
            .iter()
            .filter(|weak| weak.is_alive())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the live subscribers in insertion order.
    ///
    /// Also compacts entries whose effect has been dropped.
    pub fn effects(&self) -> Vec<ReactiveEffect> {
        let mut subscribers = self.state.subscribers.borrow_mut();
        subscribers.retain(WeakEffect::is_alive);
        subscribers.iter().filter_map(WeakEffect::upgrade).collect()
    }

    /// Whether the running effect was subscribed before its current run.
    pub fn was_tracked(&self) -> bool {
        self.state.w.get() & context::track_op_bit() != 0
    }

    /// Whether the running effect re-subscribed during its current run.
    pub fn newly_tracked(&self) -> bool {
        self.state.n.get() & context::track_op_bit() != 0
    }

    /// Mark an existing subscription at run entry.
    pub(crate) fn init_marker(&self, bit: u32) {
        self.state.w.set(self.state.w.get() | bit);
        self.state.n.set(self.state.n.get() & !bit);
    }

    pub(crate) fn set_new_bit(&self, bit: u32) {
        self.state.n.set(self.state.n.get() | bit);
    }

    /// Clear both marker bits for one depth at run exit.
    pub(crate) fn clear_markers(&self, bit: u32) {
        self.state.w.set(self.state.w.get() & !bit);
        self.state.n.set(self.state.n.get() & !bit);
    }

    #[cfg(test)]
    pub(crate) fn marker_bits(&self) -> (u32, u32) {
        (self.state.w.get(), self.state.n.get())
    }
}

impl Default for Dep {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dep")
            .field("subscribers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_contains() {
        let dep = Dep::new();
        let effect = ReactiveEffect::new(|| {});

        assert!(!dep.contains(&effect));
        assert!(dep.is_empty());

        dep.add(&effect);
        assert!(dep.contains(&effect));
        assert_eq!(dep.len(), 1);

        dep.remove(&effect);
        assert!(!dep.contains(&effect));
        assert!(dep.is_empty());
    }

    #[test]
    fn from_effects_preserves_insertion_order() {
        let first = ReactiveEffect::new(|| {});
        let second = ReactiveEffect::new(|| {});

        let dep = Dep::from_effects([first.clone(), second.clone()]);
        let snapshot = dep.effects();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id(), first.id());
        assert_eq!(snapshot[1].id(), second.id());
    }

    #[test]
    fn dropped_effects_are_compacted() {
        let dep = Dep::new();
        let kept = ReactiveEffect::new(|| {});

        {
            let dropped = ReactiveEffect::new(|| {});
            dep.add(&dropped);
            dep.add(&kept);
            assert_eq!(dep.len(), 2);
        }

        assert_eq!(dep.len(), 1);
        let snapshot = dep.effects();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), kept.id());
    }

    #[test]
    fn marker_bits_set_and_clear() {
        let dep = Dep::new();
        assert_eq!(dep.marker_bits(), (0, 0));

        dep.init_marker(1 << 1);
        assert_eq!(dep.marker_bits(), (1 << 1, 0));

        dep.set_new_bit(1 << 1);
        assert_eq!(dep.marker_bits(), (1 << 1, 1 << 1));

        // Markers at other depths are untouched.
        dep.init_marker(1 << 2);
        dep.clear_markers(1 << 1);
        assert_eq!(dep.marker_bits(), (1 << 2, 0));

        dep.clear_markers(1 << 2);
        assert_eq!(dep.marker_bits(), (0, 0));
    }

    #[test]
    fn handles_share_state() {
        let dep = Dep::new();
        let alias = dep.clone();
        let effect = ReactiveEffect::new(|| {});

        dep.add(&effect);
        assert!(alias.contains(&effect));
        assert!(Dep::ptr_eq(&dep, &alias));
        assert!(!Dep::ptr_eq(&dep, &Dep::new()));
    }
}
