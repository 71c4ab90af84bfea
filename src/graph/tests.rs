use std::{cell::Cell, rc::Rc};

use rstest::rstest;

use super::dep_len;
use crate::{
    make_effect, stop, track, trigger, Effect, EffectOptions, PropKey, Target, TargetKind,
    TrackOp, TriggerOp,
};

/// Effect that reads `(target, key)` and counts its runs.
fn observe(target: &Target, key: PropKey) -> (Effect, Rc<Cell<u32>>) {
    let runs = Rc::new(Cell::new(0));
    let effect = make_effect(
        {
            let (target, key, runs) = (target.clone(), key.clone(), runs.clone());
            move || {
                track(&target, TrackOp::Get, key.clone());
                runs.set(runs.get() + 1);
            }
        },
        EffectOptions::default(),
    );
    (effect, runs)
}

#[test]
fn track_outside_effect_is_noop() {
    let target = Target::register(TargetKind::Plain);
    track(&target, TrackOp::Get, "x");
    assert_eq!(dep_len(&target, &PropKey::from("x")), 0);
}

#[test]
fn track_is_idempotent_within_a_run() {
    let target = Target::register(TargetKind::Plain);
    let _e = make_effect(
        {
            let target = target.clone();
            move || {
                track(&target, TrackOp::Get, "x");
                track(&target, TrackOp::Get, "x");
            }
        },
        EffectOptions::default(),
    );
    assert_eq!(dep_len(&target, &PropKey::from("x")), 1);
}

#[test]
fn trigger_reaches_only_the_written_key() {
    let target = Target::register(TargetKind::Plain);
    let (_ex, x_runs) = observe(&target, "x".into());
    let (_ey, y_runs) = observe(&target, "y".into());
    assert_eq!((x_runs.get(), y_runs.get()), (1, 1));

    trigger(&target, TriggerOp::Set, Some("x".into()), None);
    assert_eq!((x_runs.get(), y_runs.get()), (2, 1));
}

#[test]
fn trigger_on_absent_target_key_is_noop() {
    let target = Target::register(TargetKind::Plain);
    trigger(&target, TriggerOp::Set, Some("missing".into()), None);
}

#[test]
fn clear_fires_every_dep_of_the_target() {
    let target = Target::register(TargetKind::Map);
    let (_ex, x_runs) = observe(&target, "x".into());
    let (_ey, y_runs) = observe(&target, "y".into());
    let (_ei, iter_runs) = observe(&target, PropKey::Iterate);

    trigger(&target, TriggerOp::Clear, None, None);
    assert_eq!((x_runs.get(), y_runs.get(), iter_runs.get()), (2, 2, 2));
}

#[rstest]
#[case::add_plain(TargetKind::Plain, TriggerOp::Add, true)]
#[case::delete_plain(TargetKind::Plain, TriggerOp::Delete, true)]
#[case::set_plain(TargetKind::Plain, TriggerOp::Set, false)]
#[case::add_map(TargetKind::Map, TriggerOp::Add, true)]
#[case::delete_map(TargetKind::Map, TriggerOp::Delete, true)]
#[case::set_map(TargetKind::Map, TriggerOp::Set, true)]
fn iterate_dep_rules(
    #[case] kind: TargetKind,
    #[case] op: TriggerOp,
    #[case] expect_rerun: bool,
) {
    let target = Target::register(kind);
    let (_e, runs) = observe(&target, PropKey::Iterate);
    assert_eq!(runs.get(), 1);

    trigger(&target, op, Some("k".into()), None);
    assert_eq!(runs.get(), if expect_rerun { 2 } else { 1 });
}

#[rstest]
#[case::add(TriggerOp::Add, true)]
#[case::delete(TriggerOp::Delete, true)]
#[case::set(TriggerOp::Set, false)]
fn map_key_iterate_rules(#[case] op: TriggerOp, #[case] expect_rerun: bool) {
    let target = Target::register(TargetKind::Map);
    let (_e, runs) = observe(&target, PropKey::MapKeyIterate);

    trigger(&target, op, Some("k".into()), None);
    assert_eq!(runs.get(), if expect_rerun { 2 } else { 1 });
}

#[test]
fn list_add_at_index_fires_length_dep() {
    let target = Target::register(TargetKind::List);
    let (_e, length_runs) = observe(&target, PropKey::Length);
    let (_ei, iter_runs) = observe(&target, PropKey::Iterate);

    trigger(&target, TriggerOp::Add, Some(PropKey::Index(3)), None);
    assert_eq!(length_runs.get(), 2);
    // Lists do not use the iterate sentinel for adds.
    assert_eq!(iter_runs.get(), 1);
}

#[test]
fn length_write_fires_indices_at_or_past_new_len() {
    let target = Target::register(TargetKind::List);
    let (_e0, idx0) = observe(&target, PropKey::Index(0));
    let (_e1, idx1) = observe(&target, PropKey::Index(1));
    let (_e2, idx2) = observe(&target, PropKey::Index(2));
    let (_el, length) = observe(&target, PropKey::Length);

    trigger(&target, TriggerOp::Set, Some(PropKey::Length), Some(1));
    assert_eq!(idx0.get(), 1);
    assert_eq!(idx1.get(), 2);
    assert_eq!(idx2.get(), 2);
    assert_eq!(length.get(), 2);
}

#[test]
fn length_write_without_a_length_fires_every_index_dep() {
    let target = Target::register(TargetKind::List);
    let (_e0, idx0) = observe(&target, PropKey::Index(0));
    let (_e1, idx1) = observe(&target, PropKey::Index(1));
    let (_e2, idx2) = observe(&target, PropKey::Index(2));
    let (_el, length) = observe(&target, PropKey::Length);

    // No new length given: the new length is taken as 0, so no index dep
    // is spared.
    trigger(&target, TriggerOp::Set, Some(PropKey::Length), None);
    assert_eq!(idx0.get(), 2);
    assert_eq!(idx1.get(), 2);
    assert_eq!(idx2.get(), 2);
    assert_eq!(length.get(), 2);
}

#[test]
fn self_trigger_is_gated_on_allow_recurse() {
    for (allow_recurse, expect_scheduled) in [(false, 0), (true, 1)] {
        let target = Target::register(TargetKind::Plain);
        let scheduled = Rc::new(Cell::new(0));
        let _e = make_effect(
            {
                let target = target.clone();
                move || {
                    track(&target, TrackOp::Get, "x");
                    trigger(&target, TriggerOp::Set, Some("x".into()), None);
                }
            },
            EffectOptions {
                allow_recurse,
                scheduler: Some(Rc::new({
                    let scheduled = scheduled.clone();
                    move |_| scheduled.set(scheduled.get() + 1)
                })),
                ..EffectOptions::default()
            },
        );
        assert_eq!(scheduled.get(), expect_scheduled);
    }
}

#[test]
fn effects_collected_across_deps_run_once() {
    // One effect subscribed under two keys of the same target; a CLEAR
    // collects it through both deps but runs it once.
    let target = Target::register(TargetKind::Plain);
    let runs = Rc::new(Cell::new(0));
    let _e = make_effect(
        {
            let (target, runs) = (target.clone(), runs.clone());
            move || {
                track(&target, TrackOp::Get, "x");
                track(&target, TrackOp::Get, "y");
                runs.set(runs.get() + 1);
            }
        },
        EffectOptions::default(),
    );
    trigger(&target, TriggerOp::Clear, None, None);
    assert_eq!(runs.get(), 2);
}

#[test]
fn dropped_target_leaves_effect_consistent() {
    let target = Target::register(TargetKind::Plain);
    let (effect, runs) = observe(&target, "x".into());
    assert_eq!(effect.dep_count(), 1);

    drop(target);
    // The graph entry is gone; the effect's back-references still unwind.
    stop(&effect);
    assert_eq!(effect.dep_count(), 0);
    assert_eq!(runs.get(), 1);
}

#[test]
fn key_display_formats() {
    assert_eq!(PropKey::from("name").to_string(), "name");
    assert_eq!(PropKey::Index(3).to_string(), "[3]");
    assert_eq!(PropKey::Length.to_string(), "length");
    assert_eq!(TrackOp::Iterate.to_string(), "iterate");
    assert_eq!(TriggerOp::Delete.to_string(), "delete");
}
