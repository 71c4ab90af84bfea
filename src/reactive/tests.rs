use assert_call::{call, CallRecorder};

use crate::{make_effect, EffectOptions, ReactiveCell, ReactiveList, ReactiveMap};

#[test]
fn cell_set_reruns_reader() {
    let mut cr = CallRecorder::new();
    let cell = ReactiveCell::new(10);
    let c = cell.clone();
    let _e = make_effect(move || call!("{}", c.get()), EffectOptions::default());
    cr.verify("10");

    cell.set(20);
    cr.verify("20");
}

#[test]
fn cell_set_dedup_skips_unchanged_value() {
    let mut cr = CallRecorder::new();
    let cell = ReactiveCell::new(10);
    let c = cell.clone();
    let _e = make_effect(move || call!("{}", c.get()), EffectOptions::default());
    cr.verify("10");

    cell.set_dedup(10);
    cr.verify(());

    cell.set_dedup(11);
    cr.verify("11");
}

#[test]
fn cell_update_mutates_in_place() {
    let mut cr = CallRecorder::new();
    let cell = ReactiveCell::new(vec![1]);
    let c = cell.clone();
    let _e = make_effect(move || call!("{}", c.with(Vec::len)), EffectOptions::default());
    cr.verify("1");

    cell.update(|v| v.push(2));
    cr.verify("2");
}

#[test]
fn map_keyed_reads_follow_their_key() {
    let mut cr = CallRecorder::new();
    let map = ReactiveMap::new();
    map.insert("a", 1);
    map.insert("b", 2);
    let m = map.clone();
    let _e = make_effect(
        move || call!("a={:?}", m.get("a")),
        EffectOptions::default(),
    );
    cr.verify("a=Some(1)");

    map.insert("b", 3);
    cr.verify(());

    map.insert("a", 4);
    cr.verify("a=Some(4)");

    map.remove("a");
    cr.verify("a=None");
}

#[test]
fn map_len_follows_structural_changes() {
    let mut cr = CallRecorder::new();
    let map = ReactiveMap::new();
    let m = map.clone();
    let _e = make_effect(move || call!("len={}", m.len()), EffectOptions::default());
    cr.verify("len=0");

    map.insert("a", 1);
    cr.verify("len=1");

    // Value writes reach iteration-shaped readers on maps.
    map.insert("a", 2);
    cr.verify("len=1");

    map.remove("a");
    cr.verify("len=0");
}

#[test]
fn map_keys_ignore_value_writes() {
    let mut cr = CallRecorder::new();
    let map = ReactiveMap::new();
    map.insert("a", 1);
    let m = map.clone();
    let _e = make_effect(
        move || call!("keys={}", m.keys().len()),
        EffectOptions::default(),
    );
    cr.verify("keys=1");

    map.insert("a", 2);
    cr.verify(());

    map.insert("b", 1);
    cr.verify("keys=2");
}

#[test]
fn map_clear_reaches_every_reader() {
    let mut cr = CallRecorder::new();
    let map = ReactiveMap::new();
    map.insert("a", 1);
    let m = map.clone();
    let _e = make_effect(
        move || call!("a={:?}", m.get("a")),
        EffectOptions::default(),
    );
    cr.verify("a=Some(1)");

    map.clear();
    cr.verify("a=None");

    // Clearing an already-empty map notifies nobody.
    map.clear();
    cr.verify(());
}

#[test]
fn list_element_reads_follow_their_index() {
    let mut cr = CallRecorder::new();
    let list = ReactiveList::from_vec(vec![1, 2]);
    let l = list.clone();
    let _e = make_effect(
        move || call!("first={:?}", l.get(0)),
        EffectOptions::default(),
    );
    cr.verify("first=Some(1)");

    list.set(1, 20);
    cr.verify(());

    list.set(0, 10);
    cr.verify("first=Some(10)");
}

#[test]
fn list_push_reaches_length_readers() {
    let mut cr = CallRecorder::new();
    let list = ReactiveList::new();
    let l = list.clone();
    let _e = make_effect(move || call!("len={}", l.len()), EffectOptions::default());
    cr.verify("len=0");

    list.push(1);
    cr.verify("len=1");
}

#[test]
fn list_pop_reaches_popped_index_and_length() {
    let mut cr = CallRecorder::new();
    let list = ReactiveList::from_vec(vec![1, 2]);
    let l = list.clone();
    let _e = make_effect(
        move || call!("last={:?}", l.get(1)),
        EffectOptions::default(),
    );
    cr.verify("last=Some(2)");

    assert_eq!(list.pop(), Some(2));
    cr.verify("last=None");
}

#[test]
fn list_truncate_spares_surviving_indices() {
    let mut cr = CallRecorder::new();
    let list = ReactiveList::from_vec(vec![1, 2, 3]);
    let l = list.clone();
    let _keep = make_effect(
        {
            let l = l.clone();
            move || call!("keep={:?}", l.get(0))
        },
        EffectOptions::default(),
    );
    let _cut = make_effect(
        move || call!("cut={:?}", l.get(2)),
        EffectOptions::default(),
    );
    cr.verify(["keep=Some(1)", "cut=Some(3)"]);

    list.truncate(1);
    cr.verify("cut=None");
}

#[test]
fn list_iter_snapshot_follows_growth_and_element_writes() {
    let mut cr = CallRecorder::new();
    let list = ReactiveList::from_vec(vec![1]);
    let l = list.clone();
    let _e = make_effect(
        move || call!("{:?}", l.iter_snapshot()),
        EffectOptions::default(),
    );
    cr.verify("[1]");

    list.push(2);
    cr.verify("[1, 2]");

    list.set(0, 9);
    cr.verify("[9, 2]");
}
