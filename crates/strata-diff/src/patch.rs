//! Applying a [`WorldDiff`] to a world.
//!
//! Entities are located by `StableId`. When several entities share an id,
//! destructions take the last of them in chunk order and every other record
//! lands on the first. The diff is checked against the world in full before
//! anything is written, so a diff that does not fit is rejected with the world
//! untouched. Records are then applied in this order: creations,
//! destructions, adds, removes, sets, shared sets, reference patches. Patches
//! run last so that they see every entity the diff creates.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use strata_ecs::component::{ComponentKind, ComponentTypeId, TypeInfo, TypeRegistry};
use strata_ecs::entity::EntityId;
use strata_ecs::identity::StableId;
use strata_ecs::world::{ComponentBundle, ComponentValue, World};
use strata_ecs::EcsError;

use crate::diff::{PackedComponent, WorldDiff};
use crate::DiffError;

/// Tracked entities of a world, grouped by `StableId`.
type Groups = HashMap<StableId, Vec<EntityId>>;

/// Counts from one [`apply_diff`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PatchReport {
    pub entities_created: usize,
    pub entities_destroyed: usize,
    pub components_added: usize,
    pub components_removed: usize,
    pub components_set: usize,
    pub shared_values_set: usize,
    pub references_patched: usize,
    /// Patches whose target is absent from the world after the diff was
    /// applied. The reference is written as [`EntityId::NULL`].
    pub unresolved_references: usize,
}

/// Apply `diff` to `world`. On error the world is left as it was.
pub fn apply_diff(world: &mut World, diff: &WorldDiff) -> Result<PatchReport, DiffError> {
    let registry = Arc::clone(world.registry());
    let types = resolve_types(&registry, diff)?;
    let mut groups = world.stable_id_groups();
    validate(world, &registry, diff, &types, &groups)?;

    let mut report = PatchReport::default();
    let info_of = |component: &PackedComponent| registry.info(types[component.type_index as usize]);

    // -- creations ------------------------------------------------------------

    let mut bundles: Vec<ComponentBundle> = (0..diff.created_count()).map(|_| ComponentBundle::new()).collect();
    for record in diff.added() {
        if !diff.is_created(record.component.entity_index) {
            continue;
        }
        let info = info_of(&record.component);
        let value = match info.kind {
            ComponentKind::Data => ComponentValue::Bytes(diff.payload(record.payload).to_vec()),
            ComponentKind::Tag => ComponentValue::Tag,
            ComponentKind::Buffer => ComponentValue::Buffer(diff.payload(record.payload).to_vec()),
            ComponentKind::Shared => continue,
        };
        bundles[record.component.entity_index as usize].add_raw(&registry, info.id, value);
        report.components_added += 1;
    }
    for record in diff.shared_sets() {
        if !diff.is_created(record.component.entity_index) {
            continue;
        }
        let info = info_of(&record.component);
        let value = ComponentValue::Shared(Arc::clone(&record.value));
        bundles[record.component.entity_index as usize].add_raw(&registry, info.id, value);
        report.components_added += 1;
        report.shared_values_set += 1;
    }
    for (&stable_id, bundle) in diff.created_ids().iter().zip(bundles) {
        let entity = world.spawn_with_stable_id(stable_id, bundle);
        groups.entry(stable_id).or_default().push(entity);
        report.entities_created += 1;
    }

    // -- destructions ---------------------------------------------------------

    for &stable_id in diff.destroyed_ids() {
        let entity = groups
            .get_mut(&stable_id)
            .and_then(Vec::pop)
            .ok_or(DiffError::MissingEntity { stable_id })?;
        world.despawn(entity)?;
        report.entities_destroyed += 1;
    }

    // -- modifications --------------------------------------------------------

    let entity_of = |groups: &Groups, component: &PackedComponent| {
        let stable_id = diff.entity_id(component.entity_index);
        first_of(groups, &stable_id).ok_or(DiffError::MissingEntity { stable_id })
    };

    for record in diff.added() {
        let info = info_of(&record.component);
        if diff.is_created(record.component.entity_index) || info.kind == ComponentKind::Shared {
            continue;
        }
        let entity = entity_of(&groups, &record.component)?;
        let value = match info.kind {
            ComponentKind::Buffer => ComponentValue::Buffer(diff.payload(record.payload).to_vec()),
            ComponentKind::Tag => ComponentValue::Tag,
            _ => ComponentValue::Bytes(diff.payload(record.payload).to_vec()),
        };
        world.insert_raw(entity, info.id, value)?;
        report.components_added += 1;
    }

    for component in diff.removed() {
        let entity = entity_of(&groups, component)?;
        if world.remove_by_id(entity, info_of(component).id)? {
            report.components_removed += 1;
        }
    }

    for record in diff.set() {
        let entity = entity_of(&groups, &record.component)?;
        let ty = info_of(&record.component).id;
        world.set_component_bytes(entity, ty, diff.payload(record.payload))?;
        report.components_set += 1;
    }

    for record in diff.shared_sets() {
        if diff.is_created(record.component.entity_index) {
            continue;
        }
        let entity = entity_of(&groups, &record.component)?;
        let ty = info_of(&record.component).id;
        world.set_shared_value(entity, ty, Arc::clone(&record.value))?;
        report.shared_values_set += 1;
    }

    // -- reference patches ----------------------------------------------------

    for patch in diff.entity_patches() {
        let entity = entity_of(&groups, &patch.component)?;
        let info = info_of(&patch.component);
        let handle = match patch.target {
            Some(target) => first_of(&groups, &target),
            None => Some(EntityId::NULL),
        };
        let handle = handle.unwrap_or_else(|| {
            report.unresolved_references += 1;
            EntityId::NULL
        });
        let mut element = world
            .component_bytes(entity, info.id)
            .ok_or_else(|| EcsError::MissingComponent {
                entity,
                component: info.name.clone(),
            })?
            .to_vec();
        let end = patch.offset + std::mem::size_of::<EntityId>();
        element[patch.offset..end].copy_from_slice(bytemuck::bytes_of(&handle));
        world.set_component_bytes(entity, info.id, &element)?;
        report.references_patched += 1;
    }

    debug!(
        created = report.entities_created,
        destroyed = report.entities_destroyed,
        added = report.components_added,
        removed = report.components_removed,
        set = report.components_set,
        patched = report.references_patched,
        "applied world diff"
    );
    Ok(report)
}

fn first_of(groups: &Groups, stable_id: &StableId) -> Option<EntityId> {
    groups.get(stable_id).and_then(|entities| entities.first()).copied()
}

fn resolve_types(registry: &TypeRegistry, diff: &WorldDiff) -> Result<Vec<ComponentTypeId>, DiffError> {
    diff.type_hashes()
        .iter()
        .map(|&hash| {
            registry
                .lookup_by_hash(hash)
                .ok_or(DiffError::UnknownTypeHash { hash })
        })
        .collect()
}

/// Reject a diff that cannot be applied to `world`, whose tracked entities
/// are `groups`. Everything the apply pass can fail on is checked here.
fn validate(
    world: &World,
    registry: &TypeRegistry,
    diff: &WorldDiff,
    types: &[ComponentTypeId],
    groups: &Groups,
) -> Result<(), DiffError> {
    let count = |stable_id: &StableId| groups.get(stable_id).map_or(0, Vec::len);
    for &stable_id in diff.created_ids() {
        if count(&stable_id) > 0 {
            return Err(DiffError::DuplicateEntity { stable_id });
        }
    }
    let mut destroyed: HashMap<StableId, usize> = HashMap::new();
    for &stable_id in diff.destroyed_ids() {
        let tally = destroyed.entry(stable_id).or_insert(0);
        *tally += 1;
        if *tally > count(&stable_id) {
            return Err(DiffError::MissingEntity { stable_id });
        }
    }

    // Entity a record lands on once destructions are done; `None` for
    // entities the diff creates.
    let target = |component: &PackedComponent| -> Result<Option<EntityId>, DiffError> {
        if diff.is_created(component.entity_index) {
            return Ok(None);
        }
        let stable_id = diff.entity_id(component.entity_index);
        let gone = destroyed.get(&stable_id).copied().unwrap_or(0);
        if count(&stable_id) <= gone {
            return Err(DiffError::MissingEntity { stable_id });
        }
        Ok(first_of(groups, &stable_id))
    };

    let info_of = |component: &PackedComponent| registry.info(types[component.type_index as usize]);
    let added: HashSet<PackedComponent> = diff.added().iter().map(|record| record.component).collect();
    let removed: HashSet<PackedComponent> = diff.removed().iter().copied().collect();
    // Whether the component exists once adds and removes have been applied.
    let require_present = |component: &PackedComponent, entity: Option<EntityId>, info: &TypeInfo| {
        let existing = entity.is_some_and(|entity| world.has_id(entity, info.id));
        if (existing || added.contains(component)) && !removed.contains(component) {
            Ok(())
        } else {
            Err(DiffError::MissingComponent {
                stable_id: diff.entity_id(component.entity_index),
                component: info.name.clone(),
            })
        }
    };

    for record in diff.added() {
        let info = info_of(&record.component);
        target(&record.component)?;
        check_payload(info, record.payload.len)?;
        if info.kind == ComponentKind::Shared {
            let covered = diff
                .shared_sets()
                .iter()
                .any(|set| set.component == record.component);
            if !covered {
                return Err(DiffError::MissingSharedValue {
                    stable_id: diff.entity_id(record.component.entity_index),
                    component: info.name.clone(),
                });
            }
        }
    }
    for component in diff.removed() {
        target(component)?;
    }
    for record in diff.set() {
        let info = info_of(&record.component);
        let entity = target(&record.component)?;
        check_kind(info, &[ComponentKind::Data, ComponentKind::Buffer], "set")?;
        check_payload(info, record.payload.len)?;
        require_present(&record.component, entity, info)?;
    }
    for record in diff.shared_sets() {
        let info = info_of(&record.component);
        target(&record.component)?;
        check_kind(info, &[ComponentKind::Shared], "shared set")?;
    }
    for patch in diff.entity_patches() {
        let info = info_of(&patch.component);
        let entity = target(&patch.component)?;
        check_kind(info, &[ComponentKind::Data], "entity patch")?;
        let end = patch.offset + std::mem::size_of::<EntityId>();
        if end > info.element_size {
            return Err(EcsError::SizeMismatch {
                component: info.name.clone(),
                expected: info.element_size,
                actual: end,
            }
            .into());
        }
        require_present(&patch.component, entity, info)?;
    }
    Ok(())
}

fn check_kind(info: &TypeInfo, allowed: &[ComponentKind], operation: &'static str) -> Result<(), EcsError> {
    if allowed.contains(&info.kind) {
        Ok(())
    } else {
        Err(EcsError::KindMismatch {
            component: info.name.clone(),
            kind: info.kind,
            operation,
        })
    }
}

fn check_payload(info: &TypeInfo, len: usize) -> Result<(), EcsError> {
    let fits = match info.kind {
        ComponentKind::Data => len == info.element_size,
        ComponentKind::Buffer => info.element_size == 0 || len % info.element_size == 0,
        ComponentKind::Tag | ComponentKind::Shared => len == 0,
    };
    if fits {
        Ok(())
    } else {
        Err(EcsError::SizeMismatch {
            component: info.name.clone(),
            expected: info.element_size,
            actual: len,
        })
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use strata_ecs::prelude::*;

    use super::*;
    use crate::builder::diff_worlds;
    use crate::config::TrackerConfig;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    struct Link {
        to: EntityId,
    }

    fn setup() -> World {
        let mut reg = TypeRegistry::new();
        reg.register::<u32>("health");
        reg.register_with_entity_refs::<Link>("link", &[0]);
        World::new(Arc::new(reg))
    }

    /// An empty world sharing `world`'s registry.
    fn setup_like(world: &World) -> World {
        World::new(Arc::clone(world.registry()))
    }

    fn spawn(world: &mut World, id: u128, hp: u32) -> EntityId {
        let mut b = ComponentBundle::new();
        b.add(world.registry(), hp);
        world.spawn_with_stable_id(StableId::from_u128(id), b)
    }

    #[test]
    fn redo_rebuilds_created_entities_with_links() {
        let before = setup();
        let mut after = before.clone();
        let a = spawn(&mut after, 1, 10);
        let b = spawn(&mut after, 2, 20);
        after.insert(a, Link { to: b }).unwrap();

        let changes = diff_worlds(&before, &after, &TrackerConfig::sequential());
        let mut replica = before.clone();
        let report = changes.redo(&mut replica).unwrap();
        assert_eq!(report.entities_created, 2);
        assert_eq!(report.references_patched, 1);
        assert_eq!(report.unresolved_references, 0);

        let ra = replica.find_by_stable_id(StableId::from_u128(1)).unwrap();
        let rb = replica.find_by_stable_id(StableId::from_u128(2)).unwrap();
        assert_eq!(replica.get::<Link>(ra), Some(Link { to: rb }));
        assert_eq!(replica.get::<u32>(rb), Some(20));
    }

    #[test]
    fn created_id_already_present_is_rejected_untouched() {
        let before = setup();
        let mut after = before.clone();
        spawn(&mut after, 1, 10);
        let changes = diff_worlds(&before, &after, &TrackerConfig::sequential());

        let version = after.version();
        let err = changes.redo(&mut after).unwrap_err();
        assert!(matches!(err, DiffError::DuplicateEntity { .. }));
        assert_eq!(after.version(), version);
    }

    #[test]
    fn missing_modified_entity_is_rejected() {
        let mut before = setup();
        let e = spawn(&mut before, 1, 10);
        let mut after = before.clone();
        after.set(e, 11u32).unwrap();
        let changes = diff_worlds(&before, &after, &TrackerConfig::sequential());

        let mut empty = setup();
        let err = changes.redo(&mut empty).unwrap_err();
        assert!(matches!(err, DiffError::MissingEntity { stable_id } if stable_id == StableId::from_u128(1)));
    }

    #[test]
    fn unknown_type_hash_is_rejected() {
        let before = setup();
        let mut after = before.clone();
        spawn(&mut after, 1, 10);
        let changes = diff_worlds(&before, &after, &TrackerConfig::sequential());

        let mut reg = TypeRegistry::new();
        reg.register::<u32>("hit_points");
        let mut other = World::new(Arc::new(reg));
        let err = apply_diff(&mut other, changes.forward()).unwrap_err();
        assert!(matches!(err, DiffError::UnknownTypeHash { .. }));
    }

    #[test]
    fn duplicate_ids_are_destroyed_one_entity_each() {
        let mut before = setup();
        spawn(&mut before, 5, 1);
        spawn(&mut before, 5, 2);
        spawn(&mut before, 9, 3);
        let mut after = setup_like(&before);
        spawn(&mut after, 9, 3);
        spawn(&mut after, 77, 4);
        let changes = diff_worlds(&before, &after, &TrackerConfig::sequential());
        assert_eq!(changes.destroyed_stable_ids(), &[StableId::from_u128(5); 2]);

        let mut replica = before.clone();
        let report = changes.redo(&mut replica).unwrap();
        assert_eq!(report.entities_destroyed, 2);
        assert_eq!(replica.find_by_stable_id(StableId::from_u128(5)), None);
        assert!(replica.find_by_stable_id(StableId::from_u128(77)).is_some());

        // Only one of the two duplicates is left to destroy.
        let mut short = before.clone();
        let first = short.find_by_stable_id(StableId::from_u128(5)).unwrap();
        short.despawn(first).unwrap();
        let version = short.version();
        let err = changes.redo(&mut short).unwrap_err();
        assert!(matches!(err, DiffError::MissingEntity { stable_id } if stable_id == StableId::from_u128(5)));
        assert_eq!(short.version(), version);
        assert_eq!(short.find_by_stable_id(StableId::from_u128(77)), None);
        assert!(short.find_by_stable_id(StableId::from_u128(5)).is_some());
    }

    #[test]
    fn set_on_missing_component_is_rejected_untouched() {
        let mut before = setup();
        let e = spawn(&mut before, 1, 10);
        let mut after = before.clone();
        after.set(e, 11u32).unwrap();
        spawn(&mut after, 2, 20);
        let changes = diff_worlds(&before, &after, &TrackerConfig::sequential());

        let mut replica = setup_like(&before);
        replica.spawn_with_stable_id(StableId::from_u128(1), ComponentBundle::new());
        let version = replica.version();
        let err = changes.redo(&mut replica).unwrap_err();
        assert!(matches!(err, DiffError::MissingComponent { stable_id, .. } if stable_id == StableId::from_u128(1)));
        assert_eq!(replica.version(), version);
        assert_eq!(replica.find_by_stable_id(StableId::from_u128(2)), None);
    }

    #[test]
    fn patch_to_absent_target_writes_null() {
        let mut world = setup();
        let a = spawn(&mut world, 1, 10);
        let b = spawn(&mut world, 2, 20);
        let before = world.clone();
        world.insert(a, Link { to: b }).unwrap();
        let changes = diff_worlds(&before, &world, &TrackerConfig::sequential());

        // Replica that lost the target.
        let mut replica = before.clone();
        let rb = replica.find_by_stable_id(StableId::from_u128(2)).unwrap();
        replica.despawn(rb).unwrap();
        let report = changes.redo(&mut replica).unwrap();
        assert_eq!(report.unresolved_references, 1);
        let ra = replica.find_by_stable_id(StableId::from_u128(1)).unwrap();
        assert_eq!(replica.get::<Link>(ra), Some(Link { to: EntityId::NULL }));
    }
}
