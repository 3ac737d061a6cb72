//! Component-level diff construction.
//!
//! Consumes the output of the entity matcher and turns it into a
//! [`WorldDiff`]. The same builder produces the inverse diff by swapping the
//! two sides and inverting the match.
//!
//! Shared components are not compared inline. Each candidate is queued and a
//! single pass at the end compares boxed values through the value stores.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use strata_ecs::chunk::Chunk;
use strata_ecs::component::{ComponentKind, ComponentTypeId, TypeInfo, TypeRegistry};
use strata_ecs::entity::EntityId;
use strata_ecs::identity::StableId;
use strata_ecs::shared::{SharedIndex, SharedValueStore};
use strata_ecs::world::World;

use crate::classify::{classify_chunks, ChunkClassification};
use crate::config::TrackerConfig;
use crate::diff::{
    AddComponent, Changes, EntityPatch, PackedComponent, PayloadRange, SetComponent, SharedSet,
    WorldDiff,
};
use crate::jobs;
use crate::matcher::{extract_entries, match_entities, EntityEntry, EntityMatch};
use crate::packed::PackedCollection;
use crate::shadow::ShadowWorld;

/// Entity handle -> `StableId` within one snapshot.
pub type HandleLookup = HashMap<EntityId, StableId>;

// ---------------------------------------------------------------------------
// Sides
// ---------------------------------------------------------------------------

/// One snapshot as seen by the builder.
pub struct DiffSide<'a> {
    /// Changed chunks; [`EntityEntry::chunk`] indexes into this.
    pub chunks: Vec<&'a Chunk>,
    pub shared: &'a SharedValueStore,
    /// Only built when some changed chunk carries a type embedding entity
    /// handles.
    pub lookup: Option<HandleLookup>,
}

impl<'a> DiffSide<'a> {
    /// Gather everything the builder needs from one snapshot: entity entries
    /// of the changed chunks and, if required, a handle lookup over every
    /// tracked chunk.
    pub fn prepare<I>(
        registry: &TypeRegistry,
        changed: Vec<&'a Chunk>,
        tracked: I,
        shared: &'a SharedValueStore,
        parallel: bool,
    ) -> (Self, Vec<EntityEntry>)
    where
        I: Iterator<Item = &'a Chunk>,
    {
        let stable_ty = registry.stable_id_type();
        let entries = extract_entries(&changed, stable_ty, parallel);
        let lookup = needs_handle_lookup(registry, &changed).then(|| {
            let tracked: Vec<&Chunk> = tracked.collect();
            build_handle_lookup(&tracked, stable_ty, parallel)
        });
        let side = Self {
            chunks: changed,
            shared,
            lookup,
        };
        (side, entries)
    }

    fn lookup(&self) -> &HandleLookup {
        self.lookup
            .as_ref()
            .expect("handle lookup is built whenever changed chunks embed entity references")
    }
}

/// Whether any of `chunks` carries a tracked type with embedded handles.
pub fn needs_handle_lookup(registry: &TypeRegistry, chunks: &[&Chunk]) -> bool {
    chunks.iter().any(|chunk| {
        chunk.types().iter().any(|&ty| {
            let info = registry.info(ty);
            !info.system_state && info.has_entity_refs()
        })
    })
}

/// Map every entity of `chunks` to its `StableId`, one task per chunk.
pub fn build_handle_lookup(chunks: &[&Chunk], stable_ty: ComponentTypeId, parallel: bool) -> HandleLookup {
    let per_chunk = jobs::par_map(parallel, chunks, |chunk| {
        let Some(column) = chunk.column_bytes(stable_ty) else {
            return Vec::new();
        };
        column
            .chunks_exact(std::mem::size_of::<StableId>())
            .zip(chunk.entities())
            .map(|(bytes, &entity)| (entity, bytemuck::pod_read_unaligned::<StableId>(bytes)))
            .collect::<Vec<_>>()
    });
    per_chunk.into_iter().flatten().collect()
}

fn resolve_handle(lookup: &HandleLookup, element: &[u8], offset: usize) -> Option<StableId> {
    let handle: EntityId =
        bytemuck::pod_read_unaligned(&element[offset..offset + std::mem::size_of::<EntityId>()]);
    if handle.is_null() {
        return None;
    }
    lookup.get(&handle).copied()
}

fn reject_buffer_references(info: &TypeInfo) {
    if info.has_entity_refs() {
        panic!(
            "buffer component '{}' embeds entity references; diffing such buffers is not supported",
            info.name
        );
    }
}

// ---------------------------------------------------------------------------
// ComponentDiffBuilder
// ---------------------------------------------------------------------------

/// A shared component whose value has to be compared after the main pass.
struct PendingShared {
    stable_id: StableId,
    /// Known up front for created entities only.
    entity_index: Option<u32>,
    component: ComponentTypeId,
    before: Option<SharedIndex>,
    after: SharedIndex,
}

/// Builds one [`WorldDiff`] from `before` to `after`.
pub struct ComponentDiffBuilder<'a> {
    registry: &'a TypeRegistry,
    stable_ty: ComponentTypeId,
    before: &'a DiffSide<'a>,
    after: &'a DiffSide<'a>,
    ids: PackedCollection<StableId>,
    types: PackedCollection<u64>,
    added: Vec<AddComponent>,
    removed: Vec<PackedComponent>,
    set: Vec<SetComponent>,
    patches: Vec<EntityPatch>,
    pending_shared: Vec<PendingShared>,
    shared_sets: Vec<SharedSet>,
    payload: Vec<u8>,
}

impl<'a> ComponentDiffBuilder<'a> {
    pub fn new(registry: &'a TypeRegistry, before: &'a DiffSide<'a>, after: &'a DiffSide<'a>) -> Self {
        Self {
            registry,
            stable_ty: registry.stable_id_type(),
            before,
            after,
            ids: PackedCollection::new(),
            types: PackedCollection::new(),
            added: Vec::new(),
            removed: Vec::new(),
            set: Vec::new(),
            patches: Vec::new(),
            pending_shared: Vec::new(),
            shared_sets: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Consume the builder and produce the diff for `matched`.
    pub fn build(mut self, matched: &EntityMatch) -> WorldDiff {
        // Created and destroyed ids are pushed, not interned: duplicates keep
        // their own slot so the counts stay meaningful.
        for entry in &matched.created {
            self.ids.push(entry.stable_id);
        }
        for entry in &matched.destroyed {
            self.ids.push(entry.stable_id);
        }

        for (index, entry) in matched.created.iter().enumerate() {
            self.add_created(index as u32, entry);
        }
        for (before, after) in &matched.modified {
            self.diff_modified(before, after);
        }
        self.resolve_shared();

        WorldDiff {
            created_count: matched.created.len(),
            destroyed_count: matched.destroyed.len(),
            entity_ids: self.ids.into_vec(),
            type_hashes: self.types.into_vec(),
            added: self.added,
            removed: self.removed,
            set: self.set,
            patches: self.patches,
            shared_sets: self.shared_sets,
            payload: self.payload,
        }
    }

    fn tracked(&self, info: &TypeInfo) -> bool {
        info.id != self.stable_ty && !info.system_state
    }

    fn type_index(&mut self, info: &TypeInfo) -> u32 {
        self.types.get_or_insert(info.stable_hash) as u32
    }

    fn push_payload(&mut self, bytes: &[u8]) -> PayloadRange {
        let range = PayloadRange {
            offset: self.payload.len(),
            len: bytes.len(),
        };
        self.payload.extend_from_slice(bytes);
        range
    }

    fn push_patches(&mut self, component: PackedComponent, info: &TypeInfo, element: &[u8]) {
        let lookup = self.after.lookup();
        for &offset in &info.entity_offsets {
            self.patches.push(EntityPatch {
                component,
                offset,
                target: resolve_handle(lookup, element, offset),
            });
        }
    }

    fn add_created(&mut self, entity_index: u32, entry: &EntityEntry) {
        let registry = self.registry;
        let chunk = self.after.chunks[entry.chunk];
        for &ty in chunk.types() {
            let info = registry.info(ty);
            if !self.tracked(info) {
                continue;
            }
            self.emit_add(entity_index, entry.stable_id, chunk, entry.row, info);
        }
    }

    fn emit_add(
        &mut self,
        entity_index: u32,
        stable_id: StableId,
        chunk: &'a Chunk,
        row: usize,
        info: &TypeInfo,
    ) {
        let component = PackedComponent {
            entity_index,
            type_index: self.type_index(info),
        };
        match info.kind {
            ComponentKind::Data => {
                let bytes = chunk
                    .component_bytes(row, info.id)
                    .expect("chunk carries every type of its layout");
                let payload = self.push_payload(bytes);
                self.added.push(AddComponent { component, payload });
                if info.has_entity_refs() {
                    self.push_patches(component, info, bytes);
                }
            }
            ComponentKind::Tag => self.added.push(AddComponent {
                component,
                payload: PayloadRange::default(),
            }),
            ComponentKind::Buffer => {
                reject_buffer_references(info);
                let bytes = chunk
                    .buffer_bytes(row, info.id)
                    .expect("chunk carries every type of its layout");
                let payload = self.push_payload(bytes);
                self.added.push(AddComponent { component, payload });
            }
            ComponentKind::Shared => {
                self.added.push(AddComponent {
                    component,
                    payload: PayloadRange::default(),
                });
                self.pending_shared.push(PendingShared {
                    stable_id,
                    entity_index: Some(entity_index),
                    component: info.id,
                    before: None,
                    after: chunk
                        .shared_index(info.id)
                        .expect("chunk carries every type of its layout"),
                });
            }
        }
    }

    fn diff_modified(&mut self, before: &EntityEntry, after: &EntityEntry) {
        let registry = self.registry;
        let before_chunk = self.before.chunks[before.chunk];
        let after_chunk = self.after.chunks[after.chunk];
        let stable_id = after.stable_id;

        for &ty in after_chunk.types() {
            let info = registry.info(ty);
            if !self.tracked(info) {
                continue;
            }
            if !before_chunk.has(ty) {
                let entity_index = self.ids.get_or_insert(stable_id) as u32;
                self.emit_add(entity_index, stable_id, after_chunk, after.row, info);
                continue;
            }
            match info.kind {
                ComponentKind::Tag => {}
                ComponentKind::Shared => self.pending_shared.push(PendingShared {
                    stable_id,
                    entity_index: None,
                    component: ty,
                    before: before_chunk.shared_index(ty),
                    after: after_chunk
                        .shared_index(ty)
                        .expect("chunk carries every type of its layout"),
                }),
                ComponentKind::Buffer => {
                    reject_buffer_references(info);
                    let old = before_chunk.buffer_bytes(before.row, ty).unwrap_or_default();
                    let new = after_chunk.buffer_bytes(after.row, ty).unwrap_or_default();
                    if old != new {
                        self.emit_set(stable_id, info, new);
                    }
                }
                ComponentKind::Data => {
                    let old = before_chunk.component_bytes(before.row, ty).unwrap_or_default();
                    let new = after_chunk.component_bytes(after.row, ty).unwrap_or_default();
                    if self.element_differs(info, old, new) {
                        self.emit_set(stable_id, info, new);
                    }
                }
            }
        }

        for &ty in before_chunk.types() {
            let info = registry.info(ty);
            if !self.tracked(info) || after_chunk.has(ty) {
                continue;
            }
            let component = PackedComponent {
                entity_index: self.ids.get_or_insert(stable_id) as u32,
                type_index: self.type_index(info),
            };
            self.removed.push(component);
        }
    }

    /// Byte comparison, except that embedded handles are compared by the
    /// `StableId` they resolve to on their own side.
    fn element_differs(&self, info: &TypeInfo, old: &[u8], new: &[u8]) -> bool {
        if !info.has_entity_refs() {
            return old != new;
        }
        if old.len() != new.len() {
            return true;
        }
        let handle = std::mem::size_of::<EntityId>();
        let mut masked_old = old.to_vec();
        let mut masked_new = new.to_vec();
        for &offset in &info.entity_offsets {
            masked_old[offset..offset + handle].fill(0);
            masked_new[offset..offset + handle].fill(0);
        }
        if masked_old != masked_new {
            return true;
        }
        let (before_lookup, after_lookup) = (self.before.lookup(), self.after.lookup());
        info.entity_offsets.iter().any(|&offset| {
            resolve_handle(before_lookup, old, offset) != resolve_handle(after_lookup, new, offset)
        })
    }

    fn emit_set(&mut self, stable_id: StableId, info: &TypeInfo, bytes: &[u8]) {
        let component = PackedComponent {
            entity_index: self.ids.get_or_insert(stable_id) as u32,
            type_index: self.type_index(info),
        };
        let payload = self.push_payload(bytes);
        self.set.push(SetComponent { component, payload });
        if info.kind == ComponentKind::Data && info.has_entity_refs() {
            self.push_patches(component, info, bytes);
        }
    }

    /// Compare queued shared values and emit a shared set for every value that
    /// is new or differs from its counterpart.
    fn resolve_shared(&mut self) {
        let registry = self.registry;
        let before_shared = self.before.shared;
        let after_shared = self.after.shared;
        for pending in std::mem::take(&mut self.pending_shared) {
            let unchanged = pending
                .before
                .is_some_and(|before| before_shared.values_equal(before, after_shared, pending.after));
            if unchanged {
                continue;
            }
            let value = Arc::clone(
                after_shared
                    .get(pending.after)
                    .expect("chunk shared index names a live value"),
            );
            let entity_index = match pending.entity_index {
                Some(index) => index,
                None => self.ids.get_or_insert(pending.stable_id) as u32,
            };
            let component = PackedComponent {
                entity_index,
                type_index: self.type_index(registry.info(pending.component)),
            };
            self.shared_sets.push(SharedSet { component, value });
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Diff the classified chunks of `current` against `shadow`, producing the
/// forward diff and its inverse.
pub fn compute_changes(
    registry: &Arc<TypeRegistry>,
    current: &World,
    shadow: &ShadowWorld,
    classification: &ChunkClassification,
    parallel: bool,
) -> Changes {
    let stable_ty = registry.stable_id_type();
    let before_chunks: Vec<&Chunk> = classification
        .destroyed
        .iter()
        .filter_map(|&seq| shadow.chunk(seq))
        .collect();
    let after_chunks: Vec<&Chunk> = classification
        .created
        .iter()
        .filter_map(|&seq| current.chunk(seq))
        .collect();

    let ((before, before_entries), (after, after_entries)) = jobs::join(
        parallel,
        || {
            DiffSide::prepare(
                registry,
                before_chunks,
                shadow.chunks(),
                shadow.shared_values(),
                parallel,
            )
        },
        || {
            DiffSide::prepare(
                registry,
                after_chunks,
                current.chunks_with(stable_ty),
                current.shared_values(),
                parallel,
            )
        },
    );

    let matched = match_entities(&before_entries, &after_entries);
    let forward = ComponentDiffBuilder::new(registry, &before, &after).build(&matched);
    let inverse = ComponentDiffBuilder::new(registry, &after, &before).build(&matched.inverted());

    debug!(
        created = forward.created_count(),
        destroyed = forward.destroyed_count(),
        modified = forward.modified_ids().len(),
        payload_bytes = forward.payload.len(),
        "computed world diff"
    );
    Changes::new(forward, inverse, Arc::clone(registry))
}

/// Diff two worlds directly, matching every tracked entity by `StableId`.
///
/// # Panics
///
/// Panics if the worlds do not share one type registry.
pub fn diff_worlds(before: &World, after: &World, config: &TrackerConfig) -> Changes {
    assert!(
        Arc::ptr_eq(before.registry(), after.registry()),
        "diffed worlds must share one type registry"
    );
    let shadow = ShadowWorld::snapshot_of(before);
    let classification = classify_chunks(after, &shadow, config.parallel);
    compute_changes(after.registry(), after, &shadow, &classification, config.parallel)
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use strata_ecs::prelude::*;

    use super::*;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    struct Target {
        entity: EntityId,
    }

    struct Frozen;

    fn setup() -> World {
        let mut reg = TypeRegistry::new();
        reg.register::<Position>("position");
        reg.register::<u32>("health");
        reg.register_with_entity_refs::<Target>("target", &[0]);
        reg.register_buffer::<u16>("path");
        reg.register_system_state::<u64>("render_handle");
        reg.register_tag::<Frozen>("frozen");
        World::new(Arc::new(reg))
    }

    fn spawn_at(world: &mut World, id: u128, x: f32) -> EntityId {
        let mut b = ComponentBundle::new();
        b.add(world.registry(), Position { x, y: 0.0 });
        world.spawn_with_stable_id(StableId::from_u128(id), b)
    }

    fn sid(id: u128) -> StableId {
        StableId::from_u128(id)
    }

    fn diff(before: &World, after: &World) -> Changes {
        diff_worlds(before, after, &TrackerConfig::sequential())
    }

    #[test]
    fn identical_worlds_produce_empty_diff() {
        let mut world = setup();
        spawn_at(&mut world, 1, 0.0);
        spawn_at(&mut world, 2, 3.0);
        let changes = diff(&world, &world.clone());
        assert!(changes.is_empty());
        assert!(changes.inverse().is_empty());
    }

    #[test]
    fn created_entity_adds_every_tracked_component() {
        let before = setup();
        let mut after = before.clone();
        let e = spawn_at(&mut after, 7, 1.0);
        after.insert_tag::<Frozen>(e).unwrap();
        after.insert(e, 5u64).unwrap();

        let changes = diff(&before, &after);
        let forward = changes.forward();
        assert_eq!(forward.created_ids(), &[sid(7)]);
        // position + frozen; the stable id and the system-state type are skipped.
        assert_eq!(forward.added().len(), 2);
        assert_eq!(changes.inverse().destroyed_ids(), &[sid(7)]);
        assert!(changes.inverse().added().is_empty());
    }

    #[test]
    fn modified_bytes_emit_set_with_payload() {
        let mut before = setup();
        let e = spawn_at(&mut before, 1, 0.0);
        let mut after = before.clone();
        after.set(e, Position { x: 5.0, y: 0.0 }).unwrap();

        let changes = diff(&before, &after);
        assert_eq!(changes.entities_with_set::<Position>(), vec![sid(1)]);
        assert_eq!(changes.set_values::<Position>(), vec![(sid(1), Position { x: 5.0, y: 0.0 })]);
        let inverse = changes.inverse();
        let record = inverse.set()[0];
        assert_eq!(
            bytemuck::pod_read_unaligned::<Position>(inverse.payload(record.payload)),
            Position { x: 0.0, y: 0.0 }
        );
    }

    #[test]
    fn system_state_changes_are_invisible() {
        let mut before = setup();
        let e = spawn_at(&mut before, 1, 0.0);
        before.insert(e, 1u64).unwrap();
        let mut after = before.clone();
        after.set(e, 2u64).unwrap();
        assert!(diff(&before, &after).is_empty());
    }

    #[test]
    fn buffer_changes_compare_whole_runs() {
        let mut before = setup();
        let e = spawn_at(&mut before, 1, 0.0);
        before.insert_buffer(e, &[1u16, 2]).unwrap();
        let mut after = before.clone();
        after.set_buffer(e, &[1u16, 2, 3]).unwrap();

        let changes = diff(&before, &after);
        let forward = changes.forward();
        assert_eq!(forward.set().len(), 1);
        assert_eq!(forward.payload(forward.set()[0].payload), bytemuck::cast_slice::<u16, u8>(&[1, 2, 3]));
    }

    #[test]
    fn references_become_patches() {
        let mut world = setup();
        let a = spawn_at(&mut world, 1, 0.0);
        let b = spawn_at(&mut world, 2, 0.0);
        let before = world.clone();
        world.insert(a, Target { entity: b }).unwrap();

        let changes = diff(&before, &world);
        let patches = changes.forward().entity_patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].target, Some(sid(2)));
        assert_eq!(changes.forward().entity_id(patches[0].component.entity_index), sid(1));
    }

    #[test]
    fn dead_reference_resolves_to_none() {
        let mut world = setup();
        let a = spawn_at(&mut world, 1, 0.0);
        let b = spawn_at(&mut world, 2, 0.0);
        world.insert(a, Target { entity: b }).unwrap();
        let before = world.clone();
        world.despawn(b).unwrap();
        world.clear_dangling_references(false);

        let changes = diff(&before, &world);
        assert_eq!(changes.destroyed_stable_ids(), &[sid(2)]);
        assert_eq!(changes.entities_with_set::<Target>(), vec![sid(1)]);
        assert_eq!(changes.forward().entity_patches()[0].target, None);
        assert_eq!(changes.inverse().entity_patches()[0].target, Some(sid(2)));
    }

    #[test]
    fn unchanged_shared_values_add_no_ids() {
        #[derive(Debug, PartialEq)]
        struct Team(u8);
        let mut reg = TypeRegistry::new();
        reg.register::<u32>("health");
        reg.register_shared::<Team>("team");
        let mut before = World::new(Arc::new(reg));
        let mut bundle = ComponentBundle::new();
        bundle.add(before.registry(), 1u32);
        bundle.add_shared(before.registry(), Team(1));
        let e = before.spawn_with_stable_id(sid(9), bundle);

        let mut after = before.clone();
        after.set(e, 2u32).unwrap();
        let changes = diff(&before, &after);
        assert!(changes.forward().shared_sets().is_empty());
        assert_eq!(changes.modified_stable_ids(), &[sid(9)]);

        after.insert_shared(e, Team(2)).unwrap();
        let changes = diff(&before, &after);
        assert_eq!(changes.entities_with_set::<Team>(), vec![sid(9)]);
        assert_eq!(changes.shared_set_values::<Team>(), vec![(sid(9), &Team(2))]);
    }

    #[test]
    #[should_panic(expected = "embeds entity references")]
    fn buffers_of_references_are_rejected() {
        let mut reg = TypeRegistry::new();
        reg.register_buffer_with_entity_refs::<EntityId>("links", &[0]);
        let before = World::new(Arc::new(reg));
        let mut after = before.clone();
        let mut bundle = ComponentBundle::new();
        bundle.add_buffer(after.registry(), &[EntityId::NULL]);
        after.spawn_with_stable_id(sid(1), bundle);
        diff(&before, &after);
    }

    #[test]
    fn handle_lookup_only_when_needed() {
        let mut world = setup();
        let e = spawn_at(&mut world, 1, 0.0);
        let registry = Arc::clone(world.registry());
        let plain: Vec<&Chunk> = world.chunks().collect();
        assert!(!needs_handle_lookup(&registry, &plain));

        world.insert(e, Target { entity: EntityId::NULL }).unwrap();
        let linked: Vec<&Chunk> = world.chunks().collect();
        assert!(needs_handle_lookup(&registry, &linked));
        let lookup = build_handle_lookup(&linked, registry.stable_id_type(), true);
        assert_eq!(lookup.get(&e), Some(&sid(1)));
    }
}
