//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use strata_ecs::prelude::*;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
pub struct Health(pub u32);

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
pub struct Armor(pub u32);

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
pub struct Target {
    pub entity: EntityId,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
pub struct Waypoint(pub u16);

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
pub struct RenderHandle(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct Team(pub String);

pub struct Frozen;

pub fn registry() -> Arc<TypeRegistry> {
    let mut reg = TypeRegistry::new();
    reg.register::<Position>("position");
    reg.register::<Health>("health");
    reg.register::<Armor>("armor");
    reg.register_with_entity_refs::<Target>("target", &[std::mem::offset_of!(Target, entity)]);
    reg.register_buffer::<Waypoint>("waypoints");
    reg.register_shared::<Team>("team");
    reg.register_tag::<Frozen>("frozen");
    reg.register_system_state::<RenderHandle>("render_handle");
    Arc::new(reg)
}

/// A world whose chunks hold at most `capacity` entities.
pub fn world_with_capacity(registry: &Arc<TypeRegistry>, capacity: usize) -> World {
    let config = StoreConfig {
        max_chunk_capacity: capacity,
        ..StoreConfig::default()
    };
    World::with_config(Arc::clone(registry), config)
}

pub fn sid(id: u128) -> StableId {
    StableId::from_u128(id)
}

pub fn spawn(world: &mut World, id: u128, x: f32) -> EntityId {
    let mut bundle = ComponentBundle::new();
    bundle.add(world.registry(), Position { x, y: 0.0 });
    bundle.add(world.registry(), Health(100));
    world.spawn_with_stable_id(sid(id), bundle)
}

/// Per-entity view of one component, with embedded handles replaced by the
/// `StableId` they point at.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Bytes { masked: Vec<u8>, refs: Vec<Option<StableId>> },
    Tag,
    Buffer(Vec<u8>),
    Shared(String),
}

/// Everything observable about the tracked entities of a world, keyed so that
/// two worlds with different handle assignments compare equal when they hold
/// the same entities.
pub type Fingerprint = BTreeMap<StableId, Vec<BTreeMap<String, Field>>>;

pub fn fingerprint(world: &World) -> Fingerprint {
    let registry = Arc::clone(world.registry());
    let stable_ty = registry.stable_id_type();
    let handle_size = std::mem::size_of::<EntityId>();
    let mut out = Fingerprint::new();
    for chunk in world.chunks_with(stable_ty) {
        for (row, &entity) in chunk.entities().iter().enumerate() {
            let mut fields = BTreeMap::new();
            for &ty in chunk.types() {
                let info = registry.info(ty);
                if ty == stable_ty || info.system_state {
                    continue;
                }
                let field = match info.kind {
                    ComponentKind::Data => {
                        let mut masked = chunk.component_bytes(row, ty).unwrap().to_vec();
                        let mut refs = Vec::new();
                        for &offset in &info.entity_offsets {
                            let slot = &mut masked[offset..offset + handle_size];
                            let handle: EntityId = bytemuck::pod_read_unaligned(slot);
                            refs.push(world.stable_id(handle));
                            slot.fill(0);
                        }
                        Field::Bytes { masked, refs }
                    }
                    ComponentKind::Tag => Field::Tag,
                    ComponentKind::Buffer => Field::Buffer(chunk.buffer_bytes(row, ty).unwrap().to_vec()),
                    ComponentKind::Shared => {
                        Field::Shared(format!("{:?}", world.shared_value(entity, ty).unwrap()))
                    }
                };
                fields.insert(info.name.clone(), field);
            }
            let id = world.stable_id(entity).unwrap();
            out.entry(id).or_default().push(fields);
        }
    }
    for entries in out.values_mut() {
        entries.sort_by_key(|fields| format!("{fields:?}"));
    }
    out
}
