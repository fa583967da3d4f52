//! Tracking registry.
//!
//! The registry is the three-level dependency index: target, then key, then
//! the dep holding that key's subscribers. The proxy layer drives it through
//! two entry points:
//!
//! 1. `track` on every property read. If an effect is running and tracking
//!    is enabled, the read binds that effect to the (target, key) dep.
//!
//! 2. `trigger` on every mutation. The mutation kind and the target's shape
//!    select the affected deps, and every subscribed effect is notified.
//!
//! # Selection rules
//!
//! - `Clear` invalidates every dep of the target.
//! - `Set` of a list's `Length` invalidates the length dep and every index
//!   at or past the new length.
//! - `Add` and `Delete` change what iteration observes, so non-list targets
//!   also fan out to `Iterate` (and `MapKeyIterate` for maps). `Add` at a
//!   list index grows the list, so it fans out to `Length`.
//! - `Set` on a map also fans out to `Iterate`. Map iteration observes
//!    values, not just keys.
//!
//! # Notification order
//!
//! The selected deps are flattened into one snapshot before anything runs,
//! so subscription changes made by the notified effects cannot affect the
//! current fan-out. Effects backing computed values run first; an ordinary
//! effect notified by the same trigger may read those values and must not
//! observe stale ones. Within each class, subscription order is preserved.
//!
//! The index is thread-local, one registry per execution context. Targets
//! are registered on first track and removed when the proxy layer reports
//! object teardown through `drop_target`.

use std::cell::RefCell;
use std::collections::HashMap;

use super::context::{self, MAX_MARKER_BITS};
use super::dep::Dep;
use super::effect::{DebuggerEvent, DebuggerOp, ReactiveEffect};
use super::target::{Target, TargetId, TargetKind, TrackOp, TrackedKey, TriggerOp};

thread_local! {
    static TARGET_MAP: RefCell<HashMap<TargetId, HashMap<TrackedKey, Dep>>> =
        RefCell::new(HashMap::new());
}

/// Record that the active effect read `key` of `target`.
///
/// No-op when tracking is paused or no effect is running.
pub fn track(target: Target, op: TrackOp, key: TrackedKey) {
    if !context::is_tracking() {
        return;
    }

    let dep = TARGET_MAP.with(|map| {
        map.borrow_mut()
            .entry(target.id())
            .or_default()
            .entry(key.clone())
            .or_insert_with(Dep::new)
            .clone()
    });

    let event = if cfg!(debug_assertions) {
        Some(DebuggerEvent {
            target: target.id(),
            op: DebuggerOp::Track(op),
            key: Some(key),
        })
    } else {
        None
    };
    track_effects_impl(&dep, event.as_ref());
}

/// Subscribe the active effect to a dep owned outside the registry.
///
/// Used by value wrappers that hold their own dep instead of a registry
/// entry.
pub fn track_effects(dep: &Dep) {
    if !context::is_tracking() {
        return;
    }
    track_effects_impl(dep, None);
}

fn track_effects_impl(dep: &Dep, event: Option<&DebuggerEvent>) {
    let active = match context::active_effect() {
        Some(active) => active,
        None => return,
    };

    let should_add = if context::effect_track_depth() <= MAX_MARKER_BITS {
        if dep.newly_tracked() {
            false
        } else {
            dep.set_new_bit(context::track_op_bit());
            // Already subscribed before this run; only first-time reads add.
            !dep.was_tracked()
        }
    } else {
        // Depth exceeded the marker range; fall back to a membership test.
        !dep.contains(&active)
    };

    if should_add {
        dep.add(&active);
        active.push_dep(dep.clone());
        if let Some(event) = event {
            active.fire_on_track(event);
        }
    }
}

/// Notify every dep affected by a mutation of `target`.
///
/// `new_len` carries the new length when a list is truncated or grown
/// through its `Length` key; it is ignored otherwise.
pub fn trigger(target: Target, op: TriggerOp, key: Option<TrackedKey>, new_len: Option<usize>) {
    let selected: Vec<Dep> = TARGET_MAP.with(|map| {
        let map = map.borrow();
        let key_map = match map.get(&target.id()) {
            Some(key_map) => key_map,
            // Never been tracked.
            None => return Vec::new(),
        };

        let mut selected = Vec::new();
        if op == TriggerOp::Clear {
            selected.extend(key_map.values().cloned());
        } else if matches!(key, Some(TrackedKey::Length)) && target.kind() == TargetKind::List {
            let new_len = new_len.unwrap_or(0);
            for (k, dep) in key_map.iter() {
                match k {
                    TrackedKey::Length => selected.push(dep.clone()),
                    TrackedKey::Index(index) if *index >= new_len => selected.push(dep.clone()),
                    _ => {}
                }
            }
        } else {
            if let Some(key) = &key {
                select(key_map, key, &mut selected);
            }
            match op {
                TriggerOp::Add => {
                    if target.kind() != TargetKind::List {
                        select(key_map, &TrackedKey::Iterate, &mut selected);
                        if target.kind() == TargetKind::Map {
                            select(key_map, &TrackedKey::MapKeyIterate, &mut selected);
                        }
                    } else if matches!(key, Some(TrackedKey::Index(_))) {
                        // Appending to a list changes its length.
                        select(key_map, &TrackedKey::Length, &mut selected);
                    }
                }
                TriggerOp::Delete => {
                    if target.kind() != TargetKind::List {
                        select(key_map, &TrackedKey::Iterate, &mut selected);
                        if target.kind() == TargetKind::Map {
                            select(key_map, &TrackedKey::MapKeyIterate, &mut selected);
                        }
                    }
                }
                TriggerOp::Set => {
                    if target.kind() == TargetKind::Map {
                        select(key_map, &TrackedKey::Iterate, &mut selected);
                    }
                }
                TriggerOp::Clear => {}
            }
        }
        selected
    });

    if selected.is_empty() {
        return;
    }

    let event = if cfg!(debug_assertions) {
        Some(DebuggerEvent {
            target: target.id(),
            op: DebuggerOp::Trigger(op),
            key,
        })
    } else {
        None
    };

    let mut effects = Vec::new();
    for dep in &selected {
        effects.extend(dep.effects());
    }
    trigger_effect_list(&effects, event.as_ref());
}

fn select(key_map: &HashMap<TrackedKey, Dep>, key: &TrackedKey, out: &mut Vec<Dep>) {
    if let Some(dep) = key_map.get(key) {
        out.push(dep.clone());
    }
}

/// Run every effect subscribed to `dep`, computed-backed effects first.
pub fn trigger_effects(dep: &Dep) {
    let effects = dep.effects();
    trigger_effect_list(&effects, None);
}

fn trigger_effect_list(effects: &[ReactiveEffect], event: Option<&DebuggerEvent>) {
    for effect in effects {
        if effect.is_computed() {
            trigger_effect(effect, event);
        }
    }
    for effect in effects {
        if !effect.is_computed() {
            trigger_effect(effect, event);
        }
    }
}

fn trigger_effect(effect: &ReactiveEffect, event: Option<&DebuggerEvent>) {
    let is_self = context::active_effect()
        .map_or(false, |active| ReactiveEffect::ptr_eq(&active, effect));
    if is_self && !effect.allow_recurse() {
        return;
    }
    if let Some(event) = event {
        effect.fire_on_trigger(event);
    }
    match effect.scheduler() {
        Some(scheduler) => scheduler(),
        None => effect.run(),
    }
}

/// The dep registered for `key` of `target`, if any.
pub fn get_dep_from_reactive(target: Target, key: &TrackedKey) -> Option<Dep> {
    TARGET_MAP.with(|map| {
        map.borrow()
            .get(&target.id())
            .and_then(|key_map| key_map.get(key))
            .cloned()
    })
}

/// Remove every dep registered for `target`.
///
/// The proxy layer calls this when the observed object is torn down. The
/// registry indexes targets by id and cannot observe the host object's
/// lifetime itself.
pub fn drop_target(target: Target) {
    TARGET_MAP.with(|map| {
        map.borrow_mut().remove(&target.id());
    });
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::effect::{effect, effect_with_options, EffectOptions};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn counting_effect(
        target: Target,
        key: TrackedKey,
    ) -> (crate::reactive::effect::EffectRunner, Rc<Cell<u32>>) {
        let runs = Rc::new(Cell::new(0));
        let runs_clone = runs.clone();
        let runner = effect(move || {
            track(target, TrackOp::Get, key.clone());
            runs_clone.set(runs_clone.get() + 1);
        });
        (runner, runs)
    }

    #[test]
    fn track_registers_a_dep() {
        let target = Target::new(TargetKind::Plain);
        let key = TrackedKey::prop("a");

        assert!(get_dep_from_reactive(target, &key).is_none());

        let (runner, _) = counting_effect(target, key.clone());

        let dep = get_dep_from_reactive(target, &key).expect("dep should exist");
        assert!(dep.contains(runner.effect()));
        assert_eq!(runner.effect().deps_len(), 1);
    }

    #[test]
    fn track_outside_an_effect_is_a_noop() {
        let target = Target::new(TargetKind::Plain);
        track(target, TrackOp::Get, TrackedKey::prop("a"));
        assert!(get_dep_from_reactive(target, &TrackedKey::prop("a")).is_none());
    }

    #[test]
    fn paused_tracking_leaves_the_registry_unchanged() {
        let target = Target::new(TargetKind::Plain);

        let _runner = effect(move || {
            context::pause_tracking();
            track(target, TrackOp::Get, TrackedKey::prop("hidden"));
            context::reset_tracking();
        });

        assert!(get_dep_from_reactive(target, &TrackedKey::prop("hidden")).is_none());
    }

    #[test]
    fn set_reruns_subscribed_effects() {
        let target = Target::new(TargetKind::Plain);
        let key = TrackedKey::prop("a");
        let (_runner, runs) = counting_effect(target, key.clone());
        assert_eq!(runs.get(), 1);

        trigger(target, TriggerOp::Set, Some(key.clone()), None);
        assert_eq!(runs.get(), 2);

        trigger(target, TriggerOp::Set, Some(TrackedKey::prop("other")), None);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn repeated_reads_subscribe_once() {
        let target = Target::new(TargetKind::Plain);
        let key = TrackedKey::prop("a");
        let runs = Rc::new(Cell::new(0));
        let runs_clone = runs.clone();

        let runner = effect(move || {
            track(target, TrackOp::Get, key.clone());
            track(target, TrackOp::Get, key.clone());
            runs_clone.set(runs_clone.get() + 1);
        });

        assert_eq!(runner.effect().deps_len(), 1);
        let dep = get_dep_from_reactive(target, &TrackedKey::prop("a")).unwrap();
        assert_eq!(dep.len(), 1);

        trigger(target, TriggerOp::Set, Some(TrackedKey::prop("a")), None);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn stale_branch_reads_are_unsubscribed() {
        let target = Target::new(TargetKind::Plain);
        let flag = Rc::new(Cell::new(true));
        let runs = Rc::new(Cell::new(0));

        let flag_clone = flag.clone();
        let runs_clone = runs.clone();
        let runner = effect(move || {
            track(target, TrackOp::Get, TrackedKey::prop("flag"));
            if flag_clone.get() {
                track(target, TrackOp::Get, TrackedKey::prop("x"));
            } else {
                track(target, TrackOp::Get, TrackedKey::prop("y"));
            }
            runs_clone.set(runs_clone.get() + 1);
        });
        assert_eq!(runs.get(), 1);
        assert_eq!(runner.effect().deps_len(), 2);

        flag.set(false);
        trigger(target, TriggerOp::Set, Some(TrackedKey::prop("flag")), None);
        assert_eq!(runs.get(), 2);
        assert_eq!(runner.effect().deps_len(), 2);

        // The x subscription must be gone after the branch switch.
        trigger(target, TriggerOp::Set, Some(TrackedKey::prop("x")), None);
        assert_eq!(runs.get(), 2);

        trigger(target, TriggerOp::Set, Some(TrackedKey::prop("y")), None);
        assert_eq!(runs.get(), 3);
    }

    #[test]
    fn marker_bits_are_clean_at_rest() {
        let target = Target::new(TargetKind::Plain);
        let key = TrackedKey::prop("a");
        let (_runner, _) = counting_effect(target, key.clone());

        let dep = get_dep_from_reactive(target, &key).unwrap();
        assert_eq!(dep.marker_bits(), (0, 0));

        trigger(target, TriggerOp::Set, Some(key.clone()), None);
        assert_eq!(dep.marker_bits(), (0, 0));
    }

    #[test]
    fn length_truncation_invalidates_removed_indices() {
        let list = Target::new(TargetKind::List);
        let (_runner, runs) = counting_effect(list, TrackedKey::Index(2));
        assert_eq!(runs.get(), 1);

        trigger(list, TriggerOp::Set, Some(TrackedKey::Length), Some(1));
        assert_eq!(runs.get(), 2);

        // Index 2 is within the new length; nothing to invalidate.
        trigger(list, TriggerOp::Set, Some(TrackedKey::Length), Some(5));
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn length_trigger_reaches_length_readers() {
        let list = Target::new(TargetKind::List);
        let (_runner, runs) = counting_effect(list, TrackedKey::Length);
        assert_eq!(runs.get(), 1);

        trigger(list, TriggerOp::Set, Some(TrackedKey::Length), Some(0));
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn list_append_fans_out_to_length() {
        let list = Target::new(TargetKind::List);
        let (_runner, runs) = counting_effect(list, TrackedKey::Length);
        assert_eq!(runs.get(), 1);

        trigger(list, TriggerOp::Add, Some(TrackedKey::Index(3)), None);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn add_and_delete_fan_out_to_iteration() {
        let map = Target::new(TargetKind::Map);
        let runs = Rc::new(Cell::new(0));
        let runs_clone = runs.clone();

        let _runner = effect(move || {
            track(map, TrackOp::Iterate, TrackedKey::Iterate);
            runs_clone.set(runs_clone.get() + 1);
        });
        assert_eq!(runs.get(), 1);

        trigger(map, TriggerOp::Add, Some(TrackedKey::prop("k2")), None);
        assert_eq!(runs.get(), 2);

        trigger(map, TriggerOp::Delete, Some(TrackedKey::prop("k2")), None);
        assert_eq!(runs.get(), 3);
    }

    #[test]
    fn map_set_reaches_value_iteration_but_not_key_iteration() {
        let map = Target::new(TargetKind::Map);
        let iter_runs = Rc::new(Cell::new(0));
        let key_iter_runs = Rc::new(Cell::new(0));

        let iter_clone = iter_runs.clone();
        let _iter = effect(move || {
            track(map, TrackOp::Iterate, TrackedKey::Iterate);
            iter_clone.set(iter_clone.get() + 1);
        });
        let key_iter_clone = key_iter_runs.clone();
        let _key_iter = effect(move || {
            track(map, TrackOp::Iterate, TrackedKey::MapKeyIterate);
            key_iter_clone.set(key_iter_clone.get() + 1);
        });

        trigger(map, TriggerOp::Set, Some(TrackedKey::prop("k")), None);
        assert_eq!(iter_runs.get(), 2);
        assert_eq!(key_iter_runs.get(), 1);

        trigger(map, TriggerOp::Add, Some(TrackedKey::prop("k2")), None);
        assert_eq!(iter_runs.get(), 3);
        assert_eq!(key_iter_runs.get(), 2);
    }

    #[test]
    fn list_set_at_an_index_does_not_reach_iteration() {
        let list = Target::new(TargetKind::List);
        let runs = Rc::new(Cell::new(0));
        let runs_clone = runs.clone();

        let _runner = effect(move || {
            track(list, TrackOp::Iterate, TrackedKey::Iterate);
            runs_clone.set(runs_clone.get() + 1);
        });
        assert_eq!(runs.get(), 1);

        trigger(list, TriggerOp::Set, Some(TrackedKey::Index(0)), None);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn clear_invalidates_every_key() {
        let map = Target::new(TargetKind::Map);
        let (_a, a_runs) = counting_effect(map, TrackedKey::prop("a"));
        let (_b, b_runs) = counting_effect(map, TrackedKey::prop("b"));

        trigger(map, TriggerOp::Clear, None, None);
        assert_eq!(a_runs.get(), 2);
        assert_eq!(b_runs.get(), 2);
    }

    #[test]
    fn self_trigger_does_not_recurse() {
        let target = Target::new(TargetKind::Plain);
        let key = TrackedKey::prop("n");
        let runs = Rc::new(Cell::new(0));
        let runs_clone = runs.clone();

        let _runner = effect(move || {
            runs_clone.set(runs_clone.get() + 1);
            track(target, TrackOp::Get, key.clone());
            // A write to the property this effect reads.
            trigger(target, TriggerOp::Set, Some(key.clone()), None);
        });

        assert_eq!(runs.get(), 1);

        trigger(target, TriggerOp::Set, Some(TrackedKey::prop("n")), None);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn allow_recurse_defers_to_the_scheduler() {
        let target = Target::new(TargetKind::Plain);
        let key = TrackedKey::prop("n");
        let scheduled = Rc::new(Cell::new(0));

        let scheduled_clone = scheduled.clone();
        let key_clone = key.clone();
        let _runner = effect_with_options(
            move || {
                track(target, TrackOp::Get, key_clone.clone());
                trigger(target, TriggerOp::Set, Some(key_clone.clone()), None);
            },
            EffectOptions {
                allow_recurse: true,
                scheduler: Some(Rc::new(move || {
                    scheduled_clone.set(scheduled_clone.get() + 1);
                })),
                ..Default::default()
            },
        );

        // The write inside the first run reaches the scheduler.
        assert_eq!(scheduled.get(), 1);
    }

    #[test]
    fn scheduler_replaces_the_synchronous_run() {
        let target = Target::new(TargetKind::Plain);
        let key = TrackedKey::prop("a");
        let runs = Rc::new(Cell::new(0));
        let scheduled = Rc::new(Cell::new(0));

        let runs_clone = runs.clone();
        let key_clone = key.clone();
        let scheduled_clone = scheduled.clone();
        let _runner = effect_with_options(
            move || {
                track(target, TrackOp::Get, key_clone.clone());
                runs_clone.set(runs_clone.get() + 1);
            },
            EffectOptions {
                scheduler: Some(Rc::new(move || {
                    scheduled_clone.set(scheduled_clone.get() + 1);
                })),
                ..Default::default()
            },
        );
        assert_eq!(runs.get(), 1);

        trigger(target, TriggerOp::Set, Some(key), None);
        assert_eq!(runs.get(), 1);
        assert_eq!(scheduled.get(), 1);
    }

    #[test]
    fn computed_effects_run_before_ordinary_ones() {
        let target = Target::new(TargetKind::Plain);
        let key = TrackedKey::prop("a");
        let order = Rc::new(RefCell::new(Vec::new()));

        // The ordinary effect subscribes first.
        let order_clone = order.clone();
        let key_clone = key.clone();
        let _plain = effect(move || {
            track(target, TrackOp::Get, key_clone.clone());
            order_clone.borrow_mut().push("plain");
        });

        let order_clone = order.clone();
        let key_clone = key.clone();
        let _computed = effect_with_options(
            move || {
                track(target, TrackOp::Get, key_clone.clone());
                order_clone.borrow_mut().push("computed");
            },
            EffectOptions {
                computed: true,
                ..Default::default()
            },
        );

        order.borrow_mut().clear();
        trigger(target, TriggerOp::Set, Some(key), None);

        assert_eq!(*order.borrow(), vec!["computed", "plain"]);
    }

    #[test]
    fn standalone_deps_track_and_trigger() {
        let dep = Dep::new();
        let runs = Rc::new(Cell::new(0));
        let runs_clone = runs.clone();

        let dep_clone = dep.clone();
        let runner = effect(move || {
            track_effects(&dep_clone);
            runs_clone.set(runs_clone.get() + 1);
        });
        assert_eq!(runs.get(), 1);
        assert!(dep.contains(runner.effect()));

        trigger_effects(&dep);
        assert_eq!(runs.get(), 2);

        // Outside any effect nothing subscribes.
        track_effects(&dep);
        assert_eq!(dep.len(), 1);
    }

    #[test]
    fn stopped_effects_are_not_notified() {
        let target = Target::new(TargetKind::Plain);
        let key = TrackedKey::prop("a");
        let (runner, runs) = counting_effect(target, key.clone());
        assert_eq!(runs.get(), 1);

        runner.effect().stop();
        trigger(target, TriggerOp::Set, Some(key), None);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn drop_target_clears_the_index() {
        let target = Target::new(TargetKind::Plain);
        let key = TrackedKey::prop("a");
        let (_runner, runs) = counting_effect(target, key.clone());

        drop_target(target);
        assert!(get_dep_from_reactive(target, &key).is_none());

        trigger(target, TriggerOp::Set, Some(key), None);
        assert_eq!(runs.get(), 1);
    }
}
