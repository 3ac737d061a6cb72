//! End-to-end tests for the change tracker.
//!
//! Each test drives a real world through a [`ChangeTracker`] or
//! [`diff_worlds`] and checks what the resulting [`Changes`] report.

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use strata_diff::prelude::*;
use strata_ecs::prelude::*;

fn tracker(registry: &Arc<TypeRegistry>) -> ChangeTracker {
    ChangeTracker::with_config(Arc::clone(registry), TrackerConfig::sequential())
}

/// Capture a clone of every dispatched `Changes`.
fn record(tracker: &mut ChangeTracker) -> Arc<Mutex<Vec<Changes>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    tracker.register_change_callback(move |_, changes| sink.lock().unwrap().push(changes.clone()), 0);
    log
}

// ---------------------------------------------------------------------------
// No-op and idempotence
// ---------------------------------------------------------------------------

#[test]
fn diff_against_unmodified_clone_is_empty() {
    let registry = registry();
    let mut world = World::new(Arc::clone(&registry));
    let a = spawn(&mut world, 1, 0.0);
    let b = spawn(&mut world, 2, 1.0);
    world.insert(a, Target { entity: b }).unwrap();
    world.insert_shared(b, Team("blue".into())).unwrap();
    world.insert_buffer(b, &[Waypoint(3), Waypoint(4)]).unwrap();

    let changes = diff_worlds(&world, &world.clone(), &TrackerConfig::default());
    assert!(!changes.entities_were_created());
    assert!(!changes.entities_were_deleted());
    assert!(!changes.components_were_added());
    assert!(!changes.components_were_removed());
    assert!(!changes.components_were_modified());
    assert!(!changes.has_changes());
}

#[test]
fn second_update_without_mutation_does_not_dispatch() {
    let registry = registry();
    let mut world = World::new(Arc::clone(&registry));
    let mut tracker = tracker(&registry);
    let log = record(&mut tracker);

    spawn(&mut world, 1, 0.0);
    let first = tracker.update(&mut world);
    let second = tracker.update(&mut world);
    assert_eq!(first.dispatches, 1);
    assert_eq!(second.dispatches, 0);
    assert_eq!(second.passes, 1);
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
fn untracked_entities_are_never_reported() {
    let registry = registry();
    let mut world = World::new(Arc::clone(&registry));
    let mut tracker = tracker(&registry);
    let log = record(&mut tracker);

    let mut bundle = ComponentBundle::new();
    bundle.add(world.registry(), Health(3));
    let anonymous = world.spawn(bundle);
    tracker.update(&mut world);
    world.set(anonymous, Health(4)).unwrap();
    tracker.update(&mut world);
    assert!(log.lock().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Entity classification
// ---------------------------------------------------------------------------

#[test]
fn created_entities_are_reported_exactly_once() {
    let registry = registry();
    let mut world = world_with_capacity(&registry, 4);
    let mut tracker = tracker(&registry);
    let log = record(&mut tracker);

    for id in 0..23 {
        spawn(&mut world, id, id as f32);
    }
    tracker.update(&mut world);
    let changes = log.lock().unwrap().pop().unwrap();
    let mut created = changes.created_stable_ids().to_vec();
    created.sort();
    assert_eq!(created, (0..23).map(sid).collect::<Vec<_>>());
    assert!(changes.modified_stable_ids().is_empty());

    // Touching one chunk re-diffs only its entities, none of them as new.
    let e = world.find_by_stable_id(sid(5)).unwrap();
    world.set(e, Health(1)).unwrap();
    tracker.update(&mut world);
    let changes = log.lock().unwrap().pop().unwrap();
    assert!(!changes.entities_were_created());
    assert_eq!(changes.modified_stable_ids(), &[sid(5)]);
}

#[test]
fn destroyed_entities_are_reported() {
    let registry = registry();
    let mut world = World::new(Arc::clone(&registry));
    let mut tracker = tracker(&registry);
    let a = spawn(&mut world, 1, 0.0);
    spawn(&mut world, 2, 0.0);
    tracker.update(&mut world);

    world.despawn(a).unwrap();
    let changes = tracker.diff_once(&mut world).unwrap();
    assert_eq!(changes.destroyed_stable_ids(), &[sid(1)]);
    assert!(changes.entities_were_deleted());
    assert!(!changes.components_were_modified());
    assert_eq!(changes.inverse().created_ids(), &[sid(1)]);
}

#[test]
fn duplicate_ids_are_kept_as_separate_entries() {
    let registry = registry();
    let mut world = World::new(Arc::clone(&registry));
    let mut tracker = tracker(&registry);
    spawn(&mut world, 7, 0.0);
    spawn(&mut world, 7, 1.0);

    let changes = tracker.diff_once(&mut world).unwrap();
    assert_eq!(changes.created_stable_ids(), &[sid(7), sid(7)]);
    assert_eq!(changes.summary().created, 2);
}

// ---------------------------------------------------------------------------
// Component records
// ---------------------------------------------------------------------------

#[test]
fn position_update_decodes_to_new_value() {
    let registry = registry();
    let mut world = World::new(Arc::clone(&registry));
    let mut tracker = tracker(&registry);
    let g1 = spawn(&mut world, 1, 0.0);
    tracker.update(&mut world);

    let log = record(&mut tracker);
    world.set(g1, Position { x: 5.0, y: 0.0 }).unwrap();
    tracker.update(&mut world);

    let changes = log.lock().unwrap().pop().unwrap();
    assert_eq!(changes.entities_with_set::<Position>(), vec![sid(1)]);
    assert_eq!(changes.set_values::<Position>(), vec![(sid(1), Position { x: 5.0, y: 0.0 })]);
    assert!(changes.entities_with_set::<Health>().is_empty());
}

#[test]
fn replacing_a_component_with_a_same_size_one_is_remove_plus_add() {
    let registry = registry();
    let mut world = World::new(Arc::clone(&registry));
    let mut tracker = tracker(&registry);
    let e = spawn(&mut world, 1, 0.0);
    tracker.update(&mut world);

    world.remove::<Health>(e).unwrap();
    world.insert(e, Armor(100)).unwrap();
    let changes = tracker.diff_once(&mut world).unwrap();
    assert_eq!(changes.entities_with_removed::<Health>(), vec![sid(1)]);
    assert_eq!(changes.entities_with_added::<Armor>(), vec![sid(1)]);
    assert!(changes.forward().set().is_empty());
    assert_eq!(changes.forward().removed().len(), 1);
    assert_eq!(changes.forward().added().len(), 1);
}

#[test]
fn system_state_components_are_ignored() {
    let registry = registry();
    let mut world = World::new(Arc::clone(&registry));
    let mut tracker = tracker(&registry);
    let e = spawn(&mut world, 1, 0.0);
    tracker.update(&mut world);

    world.insert(e, RenderHandle(42)).unwrap();
    // The archetype changed, so the chunk is re-diffed, but nothing tracked
    // differs.
    assert!(tracker.diff_once(&mut world).is_none());
}

#[test]
fn shared_value_changes_are_reported_once() {
    let registry = registry();
    let mut world = World::new(Arc::clone(&registry));
    let mut tracker = tracker(&registry);
    let e = spawn(&mut world, 1, 0.0);
    world.insert_shared(e, Team("red".into())).unwrap();
    tracker.update(&mut world);

    world.insert_shared(e, Team("blue".into())).unwrap();
    let changes = tracker.diff_once(&mut world).unwrap();
    assert_eq!(changes.entities_with_set::<Team>(), vec![sid(1)]);
    assert_eq!(changes.shared_set_values::<Team>(), vec![(sid(1), &Team("blue".into()))]);
    assert!(changes.components_were_modified());
}

#[test]
fn enabled_toggles_cover_existing_entities_only() {
    let registry = registry();
    let mut world = World::new(Arc::clone(&registry));
    let mut tracker = tracker(&registry);
    let a = spawn(&mut world, 1, 0.0);
    let b = spawn(&mut world, 2, 0.0);
    world.insert_tag::<Disabled>(b).unwrap();
    tracker.update(&mut world);

    world.insert_tag::<Disabled>(a).unwrap();
    world.remove::<Disabled>(b).unwrap();
    let mut fresh = ComponentBundle::new();
    fresh.add_tag::<Disabled>(world.registry());
    world.spawn_with_stable_id(sid(3), fresh);

    let changes = tracker.diff_once(&mut world).unwrap();
    let mut toggles = changes.enabled_toggles();
    toggles.sort_by_key(|toggle| toggle.stable_id);
    assert_eq!(
        toggles,
        vec![
            EnabledToggle { stable_id: sid(1), enabled: false },
            EnabledToggle { stable_id: sid(2), enabled: true },
        ]
    );
}

// ---------------------------------------------------------------------------
// References
// ---------------------------------------------------------------------------

#[test]
fn destroyed_referent_yields_none_patch() {
    let registry = registry();
    let mut world = World::new(Arc::clone(&registry));
    let mut tracker = tracker(&registry);
    let g2 = spawn(&mut world, 2, 0.0);
    let g3 = spawn(&mut world, 3, 0.0);
    world.insert(g2, Target { entity: g3 }).unwrap();
    tracker.update(&mut world);

    world.despawn(g3).unwrap();
    let changes = tracker.diff_once(&mut world).unwrap();
    assert_eq!(changes.destroyed_stable_ids(), &[sid(3)]);

    let forward = changes.forward();
    let patch = forward
        .entity_patches()
        .iter()
        .find(|patch| forward.entity_id(patch.component.entity_index) == sid(2))
        .expect("patch for g2");
    assert_eq!(patch.target, None);
    // The tracker cleared the dangling handle in the world itself.
    assert_eq!(world.get::<Target>(g2), Some(Target { entity: EntityId::NULL }));
}

#[test]
fn retargeting_a_reference_is_a_set_with_patch() {
    let registry = registry();
    let mut world = World::new(Arc::clone(&registry));
    let mut tracker = tracker(&registry);
    let a = spawn(&mut world, 1, 0.0);
    let b = spawn(&mut world, 2, 0.0);
    let c = spawn(&mut world, 3, 0.0);
    world.insert(a, Target { entity: b }).unwrap();
    tracker.update(&mut world);

    world.set(a, Target { entity: c }).unwrap();
    let changes = tracker.diff_once(&mut world).unwrap();
    assert_eq!(changes.entities_with_set::<Target>(), vec![sid(1)]);
    assert_eq!(changes.forward().entity_patches()[0].target, Some(sid(3)));
    assert_eq!(changes.inverse().entity_patches()[0].target, Some(sid(2)));
}

#[test]
#[should_panic(expected = "embeds entity references")]
fn buffer_of_references_panics() {
    let mut reg = TypeRegistry::new();
    reg.register_buffer_with_entity_refs::<EntityId>("children", &[0]);
    let registry = Arc::new(reg);
    let mut world = World::new(Arc::clone(&registry));
    let mut tracker = tracker(&registry);
    let mut bundle = ComponentBundle::new();
    bundle.add_buffer(world.registry(), &[EntityId::NULL]);
    world.spawn_with_stable_id(sid(1), bundle);
    tracker.update(&mut world);
}

// ---------------------------------------------------------------------------
// Fixed point
// ---------------------------------------------------------------------------

#[test]
fn mutating_subscriber_triggers_another_pass_and_settles() {
    let registry = registry();
    let mut world = World::new(Arc::clone(&registry));
    let mut tracker = tracker(&registry);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    tracker.register_change_callback(
        move |ctx, changes| {
            sink.lock().unwrap().push(ctx.pass());
            for id in changes.entities_with_added::<Health>() {
                let entity = ctx.world().find_by_stable_id(id).unwrap();
                if ctx.world().get::<Health>(entity) != Some(Health(1)) {
                    ctx.world_mut().set(entity, Health(1)).unwrap();
                }
            }
        },
        0,
    );

    spawn(&mut world, 1, 0.0);
    let report = tracker.update(&mut world);
    assert_eq!(report.passes, 2);
    assert_eq!(report.dispatches, 2);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    assert_eq!(report.summaries[1].components_set, 1);

    let e = world.find_by_stable_id(sid(1)).unwrap();
    assert_eq!(world.get::<Health>(e), Some(Health(1)));
    assert_eq!(tracker.update(&mut world).dispatches, 0);
}

#[test]
fn subscriber_spawning_entities_sees_them_next_pass() {
    let registry = registry();
    let mut world = World::new(Arc::clone(&registry));
    let mut tracker = tracker(&registry);
    let created = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&created);
    tracker.register_change_callback(
        move |ctx, changes| {
            sink.lock().unwrap().extend_from_slice(changes.created_stable_ids());
            if ctx.pass() == 1 {
                spawn(ctx.world_mut(), 99, 0.0);
            }
        },
        0,
    );

    spawn(&mut world, 1, 0.0);
    let report = tracker.update(&mut world);
    assert_eq!(report.dispatches, 2);
    assert_eq!(*created.lock().unwrap(), vec![sid(1), sid(99)]);
}

// ---------------------------------------------------------------------------
// Undo / redo
// ---------------------------------------------------------------------------

fn populated() -> (Arc<TypeRegistry>, World) {
    let registry = registry();
    let mut world = world_with_capacity(&registry, 3);
    let ids: Vec<EntityId> = (1..=8).map(|id| spawn(&mut world, id, id as f32)).collect();
    world.insert(ids[0], Target { entity: ids[1] }).unwrap();
    world.insert(ids[2], Target { entity: ids[3] }).unwrap();
    world.insert_shared(ids[4], Team("red".into())).unwrap();
    world.insert_shared(ids[5], Team("red".into())).unwrap();
    world.insert_buffer(ids[6], &[Waypoint(1), Waypoint(2)]).unwrap();
    world.insert_tag::<Frozen>(ids[7]).unwrap();
    (registry, world)
}

fn mutate(world: &mut World) {
    fn find(world: &World, id: u128) -> EntityId {
        world.find_by_stable_id(sid(id)).unwrap()
    }
    let (e1, e2, e3, e4) = (find(world, 1), find(world, 2), find(world, 3), find(world, 4));
    let (e5, e6, e7, e8) = (find(world, 5), find(world, 6), find(world, 7), find(world, 8));

    world.set(e1, Position { x: -1.0, y: 2.0 }).unwrap();
    world.despawn(e2).unwrap();
    world.set(e3, Target { entity: e5 }).unwrap();
    world.insert_shared(e5, Team("green".into())).unwrap();
    world.remove::<Team>(e6).unwrap();
    world.set_buffer(e7, &[Waypoint(9)]).unwrap();
    world.remove::<Frozen>(e8).unwrap();
    world.insert_tag::<Disabled>(e4).unwrap();

    let mut bundle = ComponentBundle::new();
    bundle.add(world.registry(), Position { x: 10.0, y: 10.0 });
    bundle.add(world.registry(), Target { entity: e1 });
    bundle.add_shared(world.registry(), Team("new".into()));
    bundle.add_buffer(world.registry(), &[Waypoint(5)]);
    world.spawn_with_stable_id(sid(20), bundle);
}

#[test]
fn undo_restores_the_baseline() {
    let (_, before) = populated();
    let mut after = before.clone();
    mutate(&mut after);

    let changes = diff_worlds(&before, &after, &TrackerConfig::default());
    let mut replica = after.clone();
    changes.undo(&mut replica).unwrap();
    assert_eq!(fingerprint(&replica), fingerprint(&before));
}

#[test]
fn redo_reproduces_the_change_on_another_world() {
    let (_, before) = populated();
    let mut after = before.clone();
    mutate(&mut after);

    let changes = diff_worlds(&before, &after, &TrackerConfig::default());
    let mut replica = before.clone();
    let report = changes.redo(&mut replica).unwrap();
    assert_eq!(report.entities_created, 1);
    assert_eq!(report.entities_destroyed, 1);
    assert_eq!(fingerprint(&replica), fingerprint(&after));
}

#[test]
fn tracker_changes_undo_and_redo() {
    let (registry, mut world) = populated();
    let mut tracker = tracker(&registry);
    tracker.update(&mut world);
    let baseline = fingerprint(&world);

    mutate(&mut world);
    let changes = tracker.diff_once(&mut world).unwrap();
    let mutated = fingerprint(&world);

    changes.undo(&mut world).unwrap();
    assert_eq!(fingerprint(&world), baseline);
    let reverted = tracker.diff_once(&mut world).unwrap();
    assert_eq!(reverted.created_stable_ids(), changes.destroyed_stable_ids());

    changes.redo(&mut world).unwrap();
    assert_eq!(fingerprint(&world), mutated);
}

#[test]
fn parallel_and_sequential_diffs_agree() {
    let (_, before) = populated();
    let mut after = before.clone();
    mutate(&mut after);
    let parallel = diff_worlds(&before, &after, &TrackerConfig::default());
    let sequential = diff_worlds(&before, &after, &TrackerConfig::sequential());
    assert_eq!(parallel.summary(), sequential.summary());
    assert_eq!(parallel.forward().entity_ids(), sequential.forward().entity_ids());
}

#[test]
fn summary_serializes_to_json() {
    let (_, before) = populated();
    let mut after = before.clone();
    mutate(&mut after);
    let summary = diff_worlds(&before, &after, &TrackerConfig::default()).summary();
    let json = serde_json::to_value(summary).unwrap();
    assert_eq!(json["created"], 1);
    assert_eq!(json["destroyed"], 1);
}
