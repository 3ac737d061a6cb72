//! The [`World`] is the top-level container of the store. It owns the entity
//! allocator, the chunks grouped by archetype and shared values, the shared
//! value store, and the global change version.
//!
//! Every mutation advances [`World::version`] by one and stamps the change
//! version of every column it touched with the new value. Structural changes
//! (spawn, despawn, adding or removing a component, changing a shared value)
//! stamp every column of both the chunk an entity leaves and the chunk it
//! enters. A chunk that becomes empty is freed; its sequence number is never
//! reused.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytemuck::Pod;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::chunk::{Chunk, ChunkLayout, RowData};
use crate::component::{ComponentKind, ComponentTypeId, TypeRegistry};
use crate::entity::{EntityAllocator, EntityId};
use crate::identity::StableId;
use crate::shared::{SharedIndex, SharedValue, SharedValueStore};
use crate::EcsError;

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

/// Chunk sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Target size in bytes of the fixed-column block plus entity handles.
    pub chunk_bytes: usize,
    /// Upper bound on entities per chunk regardless of row size.
    pub max_chunk_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: 16 * 1024,
            max_chunk_capacity: 128,
        }
    }
}

impl StoreConfig {
    /// Parse from JSON. Missing fields take their default.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// ---------------------------------------------------------------------------
// ComponentValue / ComponentBundle
// ---------------------------------------------------------------------------

/// A type-erased component value ready to be written into a chunk.
#[derive(Debug, Clone)]
pub enum ComponentValue {
    /// Fixed-size bytes of a `Data` component.
    Bytes(Vec<u8>),
    /// Presence of a tag.
    Tag,
    /// Concatenated element bytes of a buffer component.
    Buffer(Vec<u8>),
    /// A shared value.
    Shared(Arc<dyn SharedValue>),
}

impl ComponentValue {
    fn matches(&self, kind: ComponentKind, element_size: usize) -> bool {
        match (self, kind) {
            (ComponentValue::Bytes(bytes), ComponentKind::Data) => bytes.len() == element_size,
            (ComponentValue::Tag, ComponentKind::Tag) => true,
            (ComponentValue::Tag, ComponentKind::Data) => element_size == 0,
            (ComponentValue::Bytes(bytes), ComponentKind::Tag) => bytes.is_empty(),
            (ComponentValue::Buffer(bytes), ComponentKind::Buffer) => {
                element_size == 0 || bytes.len() % element_size == 0
            }
            (ComponentValue::Shared(_), ComponentKind::Shared) => true,
            _ => false,
        }
    }
}

/// A collection of component values used to spawn an entity.
#[derive(Debug, Default)]
pub struct ComponentBundle {
    entries: Vec<(ComponentTypeId, ComponentValue)>,
}

impl ComponentBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fixed-size component value.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not registered, is not a fixed-size type, or is
    /// already in the bundle.
    pub fn add<T: Pod>(&mut self, registry: &TypeRegistry, value: T) -> &mut Self {
        let ty = typed_component::<T>(registry, &[ComponentKind::Data, ComponentKind::Tag]);
        let value = if std::mem::size_of::<T>() == 0 {
            ComponentValue::Tag
        } else {
            ComponentValue::Bytes(bytemuck::bytes_of(&value).to_vec())
        };
        self.push(registry, ty, value)
    }

    /// Add a tag.
    pub fn add_tag<T: 'static>(&mut self, registry: &TypeRegistry) -> &mut Self {
        let ty = typed_component::<T>(registry, &[ComponentKind::Tag]);
        self.push(registry, ty, ComponentValue::Tag)
    }

    /// Add a buffer component.
    pub fn add_buffer<T: Pod>(&mut self, registry: &TypeRegistry, elements: &[T]) -> &mut Self {
        let ty = typed_component::<T>(registry, &[ComponentKind::Buffer]);
        let bytes = bytemuck::cast_slice(elements).to_vec();
        self.push(registry, ty, ComponentValue::Buffer(bytes))
    }

    /// Add a shared component.
    pub fn add_shared<T: SharedValue + PartialEq>(
        &mut self,
        registry: &TypeRegistry,
        value: T,
    ) -> &mut Self {
        let ty = typed_component::<T>(registry, &[ComponentKind::Shared]);
        self.push(registry, ty, ComponentValue::Shared(Arc::new(value)))
    }

    /// Add an already type-erased value.
    ///
    /// # Panics
    ///
    /// Panics if the value does not fit the registered kind and size.
    pub fn add_raw(
        &mut self,
        registry: &TypeRegistry,
        ty: ComponentTypeId,
        value: ComponentValue,
    ) -> &mut Self {
        self.push(registry, ty, value)
    }

    fn push(&mut self, registry: &TypeRegistry, ty: ComponentTypeId, value: ComponentValue) -> &mut Self {
        let info = registry
            .get_info(ty)
            .expect("component type not registered");
        assert!(
            value.matches(info.kind, info.element_size),
            "value does not fit component '{}' ({:?}, {} bytes)",
            info.name,
            info.kind,
            info.element_size
        );
        if self.entries.iter().any(|(existing, _)| *existing == ty) {
            panic!("bundle already contains component '{}'", info.name);
        }
        self.entries.push((ty, value));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolve `T` and check that it was registered with one of `kinds`.
fn typed_component<T: 'static>(registry: &TypeRegistry, kinds: &[ComponentKind]) -> ComponentTypeId {
    let ty = registry.lookup::<T>().unwrap_or_else(|| {
        panic!(
            "component type {} not registered",
            std::any::type_name::<T>()
        )
    });
    check_kind(registry, ty, kinds);
    ty
}

fn check_kind(registry: &TypeRegistry, ty: ComponentTypeId, kinds: &[ComponentKind]) {
    let info = registry.info(ty);
    if !kinds.contains(&info.kind) {
        panic!(
            "component '{}' is registered as {:?}, expected one of {:?}",
            info.name, info.kind, kinds
        );
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// Where an entity lives: which chunk and which row within that chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EntityLocation {
    chunk: u64,
    row: usize,
}

/// Archetype plus shared values. Chunks with equal keys are interchangeable.
type ChunkKey = (Vec<ComponentTypeId>, Vec<SharedIndex>);

/// A chunked entity/component store.
#[derive(Debug, Clone)]
pub struct World {
    registry: Arc<TypeRegistry>,
    config: StoreConfig,
    allocator: EntityAllocator,
    /// Indexed by `EntityId::index()`.
    locations: Vec<Option<EntityLocation>>,
    /// Keyed by sequence number.
    chunks: BTreeMap<u64, Chunk>,
    groups: HashMap<ChunkKey, Vec<u64>>,
    layouts: HashMap<Vec<ComponentTypeId>, Arc<ChunkLayout>>,
    shared: SharedValueStore,
    next_sequence: u64,
    version: u64,
}

impl World {
    /// Create an empty world over `registry`.
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self::with_config(registry, StoreConfig::default())
    }

    pub fn with_config(registry: Arc<TypeRegistry>, config: StoreConfig) -> Self {
        Self {
            registry,
            config,
            allocator: EntityAllocator::new(),
            locations: Vec::new(),
            chunks: BTreeMap::new(),
            groups: HashMap::new(),
            layouts: HashMap::new(),
            shared: SharedValueStore::new(),
            next_sequence: 1,
            version: 0,
        }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Global change version. Advances on every mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn shared_values(&self) -> &SharedValueStore {
        &self.shared
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Spawn an entity carrying the components in `bundle`.
    pub fn spawn(&mut self, bundle: ComponentBundle) -> EntityId {
        let version = self.bump_version();
        let entity = self.allocator.allocate();

        let mut types = Vec::with_capacity(bundle.entries.len());
        let mut shared_pairs = Vec::new();
        let mut data = RowData::default();
        for (ty, value) in bundle.entries {
            types.push(ty);
            match value {
                ComponentValue::Bytes(bytes) => data.fixed.push((ty, bytes)),
                ComponentValue::Tag => {}
                ComponentValue::Buffer(bytes) => data.buffers.push((ty, bytes)),
                ComponentValue::Shared(value) => {
                    shared_pairs.push((ty, self.shared.intern(ty, value)));
                }
            }
        }
        types.sort_unstable();
        let shared = shared_key(shared_pairs);

        let seq = self.chunk_for(types, shared.clone(), version);
        for index in shared {
            self.shared.release(index);
        }
        let chunk = self
            .chunks
            .get_mut(&seq)
            .expect("chunk_for returns a live chunk");
        let row = chunk.push_row(entity, data);
        chunk.mark_all_changed(version);
        self.set_location(entity, EntityLocation { chunk: seq, row });
        trace!(entity = %entity, chunk = seq, "spawned entity");
        entity
    }

    /// Spawn an entity with a [`StableId`] in addition to `bundle`.
    pub fn spawn_with_stable_id(&mut self, id: StableId, mut bundle: ComponentBundle) -> EntityId {
        let registry = Arc::clone(&self.registry);
        bundle.add(&registry, id);
        self.spawn(bundle)
    }

    /// Destroy an entity and all of its components.
    pub fn despawn(&mut self, entity: EntityId) -> Result<(), EcsError> {
        let location = self.location(entity)?;
        let version = self.bump_version();
        self.remove_row(location, version);
        self.locations[entity.index() as usize] = None;
        self.allocator.deallocate(entity);
        trace!(entity = %entity, "despawned entity");
        Ok(())
    }

    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.allocator.is_alive(entity)
    }

    pub fn entity_count(&self) -> usize {
        self.allocator.alive_count()
    }

    /// All live entities, in chunk order.
    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.chunks
            .values()
            .flat_map(|chunk| chunk.entities().iter().copied())
    }

    // -- typed access -------------------------------------------------------

    /// Copy of a fixed-size component.
    pub fn get<T: Pod>(&self, entity: EntityId) -> Option<T> {
        let ty = self.registry.lookup::<T>()?;
        check_kind(&self.registry, ty, &[ComponentKind::Data, ComponentKind::Tag]);
        self.component_bytes(entity, ty)
            .map(bytemuck::pod_read_unaligned)
    }

    /// Overwrite a fixed-size component the entity already has.
    pub fn set<T: Pod>(&mut self, entity: EntityId, value: T) -> Result<(), EcsError> {
        let ty = self.typed_id::<T>(&[ComponentKind::Data])?;
        self.set_component_bytes(entity, ty, bytemuck::bytes_of(&value))
    }

    /// Add a fixed-size component, or overwrite it if present.
    pub fn insert<T: Pod>(&mut self, entity: EntityId, value: T) -> Result<(), EcsError> {
        let ty = self.typed_id::<T>(&[ComponentKind::Data, ComponentKind::Tag])?;
        let value = if std::mem::size_of::<T>() == 0 {
            ComponentValue::Tag
        } else {
            ComponentValue::Bytes(bytemuck::bytes_of(&value).to_vec())
        };
        self.insert_raw(entity, ty, value)
    }

    /// Add a tag.
    pub fn insert_tag<T: 'static>(&mut self, entity: EntityId) -> Result<(), EcsError> {
        let ty = self.typed_id::<T>(&[ComponentKind::Tag])?;
        self.insert_raw(entity, ty, ComponentValue::Tag)
    }

    /// Remove a component of any kind. Returns whether it was present.
    pub fn remove<T: 'static>(&mut self, entity: EntityId) -> Result<bool, EcsError> {
        let ty = self.registry.lookup::<T>().ok_or_else(|| {
            self.unknown_component(std::any::type_name::<T>())
        })?;
        self.remove_by_id(entity, ty)
    }

    pub fn has<T: 'static>(&self, entity: EntityId) -> bool {
        self.registry
            .lookup::<T>()
            .is_some_and(|ty| self.has_id(entity, ty))
    }

    pub fn has_id(&self, entity: EntityId, ty: ComponentTypeId) -> bool {
        self.location(entity)
            .ok()
            .and_then(|loc| self.chunks.get(&loc.chunk))
            .is_some_and(|chunk| chunk.has(ty))
    }

    /// Add a buffer component, or replace its contents if present.
    pub fn insert_buffer<T: Pod>(&mut self, entity: EntityId, elements: &[T]) -> Result<(), EcsError> {
        let ty = self.typed_id::<T>(&[ComponentKind::Buffer])?;
        let bytes = bytemuck::cast_slice(elements).to_vec();
        self.insert_raw(entity, ty, ComponentValue::Buffer(bytes))
    }

    /// Replace the contents of a buffer the entity already has.
    pub fn set_buffer<T: Pod>(&mut self, entity: EntityId, elements: &[T]) -> Result<(), EcsError> {
        let ty = self.typed_id::<T>(&[ComponentKind::Buffer])?;
        self.set_component_bytes(entity, ty, bytemuck::cast_slice(elements))
    }

    /// Copy of a buffer component's elements.
    pub fn buffer<T: Pod>(&self, entity: EntityId) -> Option<Vec<T>> {
        let ty = self.registry.lookup::<T>()?;
        check_kind(&self.registry, ty, &[ComponentKind::Buffer]);
        let bytes = self.buffer_bytes(entity, ty)?;
        let size = std::mem::size_of::<T>().max(1);
        Some(
            bytes
                .chunks_exact(size)
                .map(bytemuck::pod_read_unaligned)
                .collect(),
        )
    }

    /// Add or change a shared component. The entity moves to the chunk
    /// holding its new combination of shared values.
    pub fn insert_shared<T: SharedValue + PartialEq>(
        &mut self,
        entity: EntityId,
        value: T,
    ) -> Result<(), EcsError> {
        let ty = self.typed_id::<T>(&[ComponentKind::Shared])?;
        self.insert_raw(entity, ty, ComponentValue::Shared(Arc::new(value)))
    }

    pub fn get_shared<T: 'static>(&self, entity: EntityId) -> Option<&T> {
        let ty = self.registry.lookup::<T>()?;
        let value = self.shared_value(entity, ty)?;
        (**value).as_any().downcast_ref::<T>()
    }

    /// The entity's [`StableId`], if it carries one.
    pub fn stable_id(&self, entity: EntityId) -> Option<StableId> {
        self.component_bytes(entity, self.registry.stable_id_type())
            .map(bytemuck::pod_read_unaligned)
    }

    /// Linear search for the entity carrying `id`.
    pub fn find_by_stable_id(&self, id: StableId) -> Option<EntityId> {
        let ty = self.registry.stable_id_type();
        self.chunks_with(ty).find_map(|chunk| {
            let column = chunk.column_bytes(ty)?;
            column
                .chunks_exact(std::mem::size_of::<StableId>())
                .position(|bytes| bytemuck::pod_read_unaligned::<StableId>(bytes) == id)
                .and_then(|row| chunk.entity(row))
        })
    }

    /// Map every [`StableId`] in the world to its entity. On duplicates the
    /// first entity in chunk order wins.
    pub fn stable_id_map(&self) -> HashMap<StableId, EntityId> {
        let ty = self.registry.stable_id_type();
        let mut map = HashMap::new();
        for chunk in self.chunks_with(ty) {
            let Some(column) = chunk.column_bytes(ty) else {
                continue;
            };
            for (bytes, &entity) in column
                .chunks_exact(std::mem::size_of::<StableId>())
                .zip(chunk.entities())
            {
                map.entry(bytemuck::pod_read_unaligned(bytes))
                    .or_insert(entity);
            }
        }
        map
    }

    /// Every entity carrying each [`StableId`], in chunk order.
    pub fn stable_id_groups(&self) -> HashMap<StableId, Vec<EntityId>> {
        let ty = self.registry.stable_id_type();
        let mut groups: HashMap<StableId, Vec<EntityId>> = HashMap::new();
        for chunk in self.chunks_with(ty) {
            let Some(column) = chunk.column_bytes(ty) else {
                continue;
            };
            for (bytes, &entity) in column
                .chunks_exact(std::mem::size_of::<StableId>())
                .zip(chunk.entities())
            {
                groups
                    .entry(bytemuck::pod_read_unaligned(bytes))
                    .or_default()
                    .push(entity);
            }
        }
        groups
    }

    // -- raw access ---------------------------------------------------------

    /// Bytes of a fixed-size component. Empty for tags.
    pub fn component_bytes(&self, entity: EntityId, ty: ComponentTypeId) -> Option<&[u8]> {
        let loc = self.location(entity).ok()?;
        self.chunks.get(&loc.chunk)?.component_bytes(loc.row, ty)
    }

    /// Element bytes of a buffer component.
    pub fn buffer_bytes(&self, entity: EntityId, ty: ComponentTypeId) -> Option<&[u8]> {
        let loc = self.location(entity).ok()?;
        self.chunks.get(&loc.chunk)?.buffer_bytes(loc.row, ty)
    }

    /// The shared value an entity sees for `ty`.
    pub fn shared_value(&self, entity: EntityId, ty: ComponentTypeId) -> Option<&Arc<dyn SharedValue>> {
        let loc = self.location(entity).ok()?;
        let index = self.chunks.get(&loc.chunk)?.shared_index(ty)?;
        self.shared.get(index)
    }

    /// Overwrite the bytes of a fixed-size or buffer component the entity
    /// already has.
    pub fn set_component_bytes(
        &mut self,
        entity: EntityId,
        ty: ComponentTypeId,
        bytes: &[u8],
    ) -> Result<(), EcsError> {
        let loc = self.location(entity)?;
        let info = self
            .registry
            .get_info(ty)
            .ok_or_else(|| self.unknown_component(&format!("{ty:?}")))?;
        let value = match info.kind {
            ComponentKind::Data => ComponentValue::Bytes(bytes.to_vec()),
            ComponentKind::Buffer => ComponentValue::Buffer(bytes.to_vec()),
            kind => {
                return Err(EcsError::KindMismatch {
                    component: info.name.clone(),
                    kind,
                    operation: "set_component_bytes",
                })
            }
        };
        if !value.matches(info.kind, info.element_size) {
            return Err(EcsError::SizeMismatch {
                component: info.name.clone(),
                expected: info.element_size,
                actual: bytes.len(),
            });
        }
        if !self.chunks.get(&loc.chunk).is_some_and(|c| c.has(ty)) {
            return Err(EcsError::MissingComponent {
                entity,
                component: info.name.clone(),
            });
        }
        let version = self.bump_version();
        self.write_value(loc, ty, value, version);
        Ok(())
    }

    /// Add a component of any kind, or overwrite it if present.
    pub fn insert_raw(
        &mut self,
        entity: EntityId,
        ty: ComponentTypeId,
        value: ComponentValue,
    ) -> Result<(), EcsError> {
        let loc = self.location(entity)?;
        let registry = Arc::clone(&self.registry);
        let info = registry
            .get_info(ty)
            .ok_or_else(|| self.unknown_component(&format!("{ty:?}")))?;
        if !value.matches(info.kind, info.element_size) {
            return Err(match value {
                ComponentValue::Bytes(bytes) | ComponentValue::Buffer(bytes)
                    if matches!(info.kind, ComponentKind::Data | ComponentKind::Buffer) =>
                {
                    EcsError::SizeMismatch {
                        component: info.name.clone(),
                        expected: info.element_size,
                        actual: bytes.len(),
                    }
                }
                _ => EcsError::KindMismatch {
                    component: info.name.clone(),
                    kind: info.kind,
                    operation: "insert_raw",
                },
            });
        }

        let version = self.bump_version();
        let source = self.chunks.get(&loc.chunk).expect("entity location names a live chunk");
        let mut types = source.types().to_vec();
        let mut pairs = shared_pairs(source);

        if let ComponentValue::Shared(value) = value {
            let index = self.shared.intern(ty, value);
            pairs.retain(|(existing, _)| *existing != ty);
            pairs.push((ty, index));
            if !types.contains(&ty) {
                types.push(ty);
                types.sort_unstable();
            }
            self.move_entity(entity, loc, types, shared_key(pairs), version);
            self.shared.release(index);
            return Ok(());
        }

        let loc = if source.has(ty) {
            loc
        } else {
            types.push(ty);
            types.sort_unstable();
            self.move_entity(entity, loc, types, shared_key(pairs), version)
        };
        self.write_value(loc, ty, value, version);
        Ok(())
    }

    /// Replace a shared value.
    pub fn set_shared_value(
        &mut self,
        entity: EntityId,
        ty: ComponentTypeId,
        value: Arc<dyn SharedValue>,
    ) -> Result<(), EcsError> {
        self.insert_raw(entity, ty, ComponentValue::Shared(value))
    }

    /// Remove a component of any kind. Returns whether it was present.
    pub fn remove_by_id(&mut self, entity: EntityId, ty: ComponentTypeId) -> Result<bool, EcsError> {
        let loc = self.location(entity)?;
        let source = self.chunks.get(&loc.chunk).expect("entity location names a live chunk");
        if !source.has(ty) {
            return Ok(false);
        }
        let mut types = source.types().to_vec();
        types.retain(|&existing| existing != ty);
        let mut pairs = shared_pairs(source);
        pairs.retain(|(existing, _)| *existing != ty);

        let version = self.bump_version();
        self.move_entity(entity, loc, types, shared_key(pairs), version);
        Ok(true)
    }

    // -- chunk enumeration --------------------------------------------------

    /// All chunks in ascending sequence order.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    /// Chunks whose archetype includes `ty`.
    pub fn chunks_with(&self, ty: ComponentTypeId) -> impl Iterator<Item = &Chunk> {
        self.chunks.values().filter(move |chunk| chunk.has(ty))
    }

    /// Chunks whose archetype includes every type in `types`.
    pub fn chunks_with_all<'a>(
        &'a self,
        types: &'a [ComponentTypeId],
    ) -> impl Iterator<Item = &'a Chunk> + 'a {
        self.chunks
            .values()
            .filter(move |chunk| types.iter().all(|&ty| chunk.has(ty)))
    }

    pub fn chunk(&self, sequence_number: u64) -> Option<&Chunk> {
        self.chunks.get(&sequence_number)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    // -- reference maintenance ----------------------------------------------

    /// Overwrite every embedded reference to a dead entity with
    /// [`EntityId::NULL`]. With `parallel` set, chunks are scanned on the
    /// rayon pool; otherwise on the calling thread.
    ///
    /// Returns the number of references cleared. The world version only
    /// advances if something was cleared.
    pub fn clear_dangling_references(&mut self, parallel: bool) -> usize {
        let version = self.version + 1;
        let registry: &TypeRegistry = &self.registry;
        let allocator = &self.allocator;
        let is_alive = |entity: EntityId| allocator.is_alive(entity);
        let cleared: usize = if parallel {
            self.chunks
                .par_iter_mut()
                .map(|(_, chunk)| chunk.clear_dangling(registry, &is_alive, version))
                .sum()
        } else {
            self.chunks
                .iter_mut()
                .map(|(_, chunk)| chunk.clear_dangling(registry, &is_alive, version))
                .sum()
        };
        if cleared > 0 {
            self.version = version;
            debug!(cleared, version, "cleared dangling entity references");
        }
        cleared
    }

    // -- internals ----------------------------------------------------------

    fn bump_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn location(&self, entity: EntityId) -> Result<EntityLocation, EcsError> {
        if !self.allocator.is_alive(entity) {
            return Err(EcsError::StaleEntity { entity });
        }
        self.locations
            .get(entity.index() as usize)
            .copied()
            .flatten()
            .ok_or(EcsError::StaleEntity { entity })
    }

    fn set_location(&mut self, entity: EntityId, location: EntityLocation) {
        let idx = entity.index() as usize;
        if idx >= self.locations.len() {
            self.locations.resize(idx + 1, None);
        }
        self.locations[idx] = Some(location);
    }

    fn typed_id<T: 'static>(&self, kinds: &[ComponentKind]) -> Result<ComponentTypeId, EcsError> {
        let ty = self
            .registry
            .lookup::<T>()
            .ok_or_else(|| self.unknown_component(std::any::type_name::<T>()))?;
        check_kind(&self.registry, ty, kinds);
        Ok(ty)
    }

    fn unknown_component(&self, name: &str) -> EcsError {
        EcsError::UnknownComponent {
            name: name.to_owned(),
            registered: self.registry.registered_names().join(", "),
        }
    }

    fn layout_for(&mut self, types: &[ComponentTypeId]) -> Arc<ChunkLayout> {
        if let Some(layout) = self.layouts.get(types) {
            return Arc::clone(layout);
        }
        let layout = Arc::new(ChunkLayout::new(
            &self.registry,
            types,
            self.config.chunk_bytes,
            self.config.max_chunk_capacity,
        ));
        self.layouts.insert(types.to_vec(), Arc::clone(&layout));
        layout
    }

    /// Find a chunk with room for one more entity under `(types, shared)`,
    /// allocating one if needed. A new chunk takes its own reference to each
    /// shared index.
    fn chunk_for(&mut self, types: Vec<ComponentTypeId>, shared: Vec<SharedIndex>, version: u64) -> u64 {
        let key = (types, shared);
        if let Some(list) = self.groups.get(&key) {
            if let Some(&seq) = list.iter().find(|&&seq| !self.chunks[&seq].is_full()) {
                return seq;
            }
        }

        let layout = self.layout_for(&key.0);
        for &index in &key.1 {
            self.shared.retain(index);
        }
        let seq = self.next_sequence;
        self.next_sequence += 1;
        self.chunks
            .insert(seq, Chunk::new(seq, layout, key.1.clone(), version));
        self.groups.entry(key).or_default().push(seq);
        trace!(chunk = seq, "allocated chunk");
        seq
    }

    /// Remove the row at `location`, fixing up the entity moved into its
    /// place and freeing the chunk if it became empty.
    fn remove_row(&mut self, location: EntityLocation, version: u64) -> RowData {
        let chunk = self
            .chunks
            .get_mut(&location.chunk)
            .expect("entity location names a live chunk");
        let (data, moved) = chunk.swap_remove(location.row);
        chunk.mark_all_changed(version);
        let emptied = chunk.is_empty();
        if let Some(moved) = moved {
            self.set_location(moved, location);
        }
        if emptied {
            self.free_chunk(location.chunk);
        }
        data
    }

    fn free_chunk(&mut self, seq: u64) {
        let Some(chunk) = self.chunks.remove(&seq) else {
            return;
        };
        let key = (chunk.types().to_vec(), chunk.shared_indices().to_vec());
        if let Some(list) = self.groups.get_mut(&key) {
            list.retain(|&other| other != seq);
            if list.is_empty() {
                self.groups.remove(&key);
            }
        }
        for &index in chunk.shared_indices() {
            self.shared.release(index);
        }
        trace!(chunk = seq, "freed chunk");
    }

    /// Move `entity` to a chunk of `(types, shared)`, carrying over the data
    /// of every type both archetypes have in common.
    fn move_entity(
        &mut self,
        entity: EntityId,
        from: EntityLocation,
        types: Vec<ComponentTypeId>,
        shared: Vec<SharedIndex>,
        version: u64,
    ) -> EntityLocation {
        let source = &self.chunks[&from.chunk];
        if source.types() == types.as_slice() && source.shared_indices() == shared.as_slice() {
            return from;
        }
        let target = self.chunk_for(types, shared, version);
        let data = self.remove_row(from, version);
        let chunk = self
            .chunks
            .get_mut(&target)
            .expect("chunk_for returns a live chunk");
        let row = chunk.push_row(entity, data);
        chunk.mark_all_changed(version);
        let location = EntityLocation { chunk: target, row };
        self.set_location(entity, location);
        location
    }

    fn write_value(&mut self, loc: EntityLocation, ty: ComponentTypeId, value: ComponentValue, version: u64) {
        let chunk = self
            .chunks
            .get_mut(&loc.chunk)
            .expect("entity location names a live chunk");
        match value {
            ComponentValue::Bytes(bytes) => {
                if let Some(dst) = chunk.component_bytes_mut(loc.row, ty) {
                    dst.copy_from_slice(&bytes);
                }
            }
            ComponentValue::Buffer(bytes) => {
                if let Some(dst) = chunk.buffer_mut(loc.row, ty) {
                    *dst = bytes;
                }
            }
            ComponentValue::Tag | ComponentValue::Shared(_) => {}
        }
        chunk.mark_changed(ty, version);
    }
}

fn shared_pairs(chunk: &Chunk) -> Vec<(ComponentTypeId, SharedIndex)> {
    chunk
        .layout()
        .shared_types()
        .zip(chunk.shared_indices().iter().copied())
        .collect()
}

/// Shared indices ordered by component type, matching the layout's shared
/// column order.
fn shared_key(mut pairs: Vec<(ComponentTypeId, SharedIndex)>) -> Vec<SharedIndex> {
    pairs.sort_unstable_by_key(|(ty, _)| *ty);
    pairs.into_iter().map(|(_, index)| index).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
