//! Chunk storage.
//!
//! A [`Chunk`] holds up to [`ChunkLayout::capacity`] entities of one archetype
//! (one sorted set of component types) and one combination of shared values.
//! Fixed-size components live in a single byte block, one column per type
//! (Structure-of-Arrays). Buffer components are one byte run per entity and
//! per buffer type. Shared components are a single [`SharedIndex`] per chunk.
//!
//! Every chunk carries a sequence number that is unique within its store and
//! never changes while the chunk exists, plus one change version per component
//! type. Writers stamp the version of every column they touch with the world
//! version current at the time of the write.

use std::sync::Arc;

use crate::component::{ComponentKind, ComponentTypeId, TypeRegistry};
use crate::entity::EntityId;
use crate::shared::SharedIndex;

// ---------------------------------------------------------------------------
// ChunkLayout
// ---------------------------------------------------------------------------

/// Where one component type's data lives within a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnSlot {
    /// Fixed-size column at `offset` in the byte block, `size` bytes per row.
    Fixed { offset: usize, size: usize },
    /// Zero-sized marker; nothing is stored.
    Tag,
    /// Index into the chunk's buffer columns.
    Buffer { column: usize, element_size: usize },
    /// Index into the chunk's shared value indices.
    Shared { index: usize },
}

/// Per-archetype column layout, shared by every chunk of the archetype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLayout {
    /// Sorted, deduplicated.
    types: Vec<ComponentTypeId>,
    /// Parallel to `types`.
    slots: Vec<ColumnSlot>,
    capacity: usize,
    block_size: usize,
    buffer_columns: usize,
    shared_columns: usize,
}

impl ChunkLayout {
    /// Compute the layout for `types` with chunks of roughly `chunk_bytes`
    /// bytes holding at most `max_capacity` entities.
    pub fn new(
        registry: &TypeRegistry,
        types: &[ComponentTypeId],
        chunk_bytes: usize,
        max_capacity: usize,
    ) -> Self {
        let mut sorted = types.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        // Every row carries its entity handle, so a row is never empty.
        let mut row_bytes = std::mem::size_of::<EntityId>();
        for &ty in &sorted {
            let info = registry.info(ty);
            if info.kind == ComponentKind::Data {
                row_bytes += info.element_size;
            }
        }
        let capacity = (chunk_bytes / row_bytes).min(max_capacity).max(1);

        let mut slots = Vec::with_capacity(sorted.len());
        let mut offset = 0;
        let mut buffer_columns = 0;
        let mut shared_columns = 0;
        for &ty in &sorted {
            let info = registry.info(ty);
            let slot = match info.kind {
                ComponentKind::Data if info.element_size > 0 => {
                    let slot = ColumnSlot::Fixed {
                        offset,
                        size: info.element_size,
                    };
                    offset += info.element_size * capacity;
                    slot
                }
                ComponentKind::Data | ComponentKind::Tag => ColumnSlot::Tag,
                ComponentKind::Buffer => {
                    buffer_columns += 1;
                    ColumnSlot::Buffer {
                        column: buffer_columns - 1,
                        element_size: info.element_size,
                    }
                }
                ComponentKind::Shared => {
                    shared_columns += 1;
                    ColumnSlot::Shared {
                        index: shared_columns - 1,
                    }
                }
            };
            slots.push(slot);
        }

        Self {
            types: sorted,
            slots,
            capacity,
            block_size: offset,
            buffer_columns,
            shared_columns,
        }
    }

    /// Component types in ascending id order.
    pub fn types(&self) -> &[ComponentTypeId] {
        &self.types
    }

    /// Position of `ty` in [`types`](Self::types).
    #[inline]
    pub fn position(&self, ty: ComponentTypeId) -> Option<usize> {
        self.types.binary_search(&ty).ok()
    }

    #[inline]
    pub fn contains(&self, ty: ComponentTypeId) -> bool {
        self.position(ty).is_some()
    }

    pub fn slot(&self, ty: ComponentTypeId) -> Option<ColumnSlot> {
        self.position(ty).map(|pos| self.slots[pos])
    }

    /// Maximum number of entities per chunk.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size in bytes of the fixed-column block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn buffer_columns(&self) -> usize {
        self.buffer_columns
    }

    pub fn shared_columns(&self) -> usize {
        self.shared_columns
    }

    /// Shared component types in shared-column order.
    pub fn shared_types(&self) -> impl Iterator<Item = ComponentTypeId> + '_ {
        self.types
            .iter()
            .zip(&self.slots)
            .filter(|(_, slot)| matches!(slot, ColumnSlot::Shared { .. }))
            .map(|(&ty, _)| ty)
    }
}

// ---------------------------------------------------------------------------
// RowData
// ---------------------------------------------------------------------------

/// The per-entity data of one row, detached from its chunk while an entity
/// moves between archetypes.
#[derive(Debug, Default)]
pub(crate) struct RowData {
    pub fixed: Vec<(ComponentTypeId, Vec<u8>)>,
    pub buffers: Vec<(ComponentTypeId, Vec<u8>)>,
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// A fixed-capacity block of entities sharing one layout.
#[derive(Debug, Clone)]
pub struct Chunk {
    sequence_number: u64,
    layout: Arc<ChunkLayout>,
    entities: Vec<EntityId>,
    block: Vec<u8>,
    /// `[buffer column][row]`.
    buffers: Vec<Vec<Vec<u8>>>,
    /// One per shared column.
    shared: Vec<SharedIndex>,
    /// One per type in `layout.types()`.
    change_versions: Vec<u64>,
}

impl Chunk {
    pub(crate) fn new(
        sequence_number: u64,
        layout: Arc<ChunkLayout>,
        shared: Vec<SharedIndex>,
        version: u64,
    ) -> Self {
        debug_assert_eq!(shared.len(), layout.shared_columns());
        let capacity = layout.capacity();
        Self {
            sequence_number,
            entities: Vec::with_capacity(capacity),
            block: vec![0; layout.block_size()],
            buffers: vec![Vec::with_capacity(capacity); layout.buffer_columns()],
            shared,
            change_versions: vec![version; layout.types().len()],
            layout,
        }
    }

    /// A byte-for-byte copy of this chunk under a new sequence number and
    /// with shared indices re-interned into another store.
    ///
    /// Change versions and entity handles are kept as they are.
    pub fn duplicate(&self, sequence_number: u64, shared: Vec<SharedIndex>) -> Chunk {
        assert_eq!(
            shared.len(),
            self.shared.len(),
            "duplicate must supply one shared index per shared column"
        );
        Chunk {
            sequence_number,
            layout: Arc::clone(&self.layout),
            entities: self.entities.clone(),
            block: self.block.clone(),
            buffers: self.buffers.clone(),
            shared,
            change_versions: self.change_versions.clone(),
        }
    }

    // -- identity and shape -------------------------------------------------

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn layout(&self) -> &Arc<ChunkLayout> {
        &self.layout
    }

    pub fn types(&self) -> &[ComponentTypeId] {
        self.layout.types()
    }

    pub fn has(&self, ty: ComponentTypeId) -> bool {
        self.layout.contains(ty)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entities.len() >= self.layout.capacity()
    }

    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    pub fn entity(&self, row: usize) -> Option<EntityId> {
        self.entities.get(row).copied()
    }

    // -- versions -----------------------------------------------------------

    /// Change version of `ty`, if the chunk carries it.
    pub fn change_version(&self, ty: ComponentTypeId) -> Option<u64> {
        self.layout
            .position(ty)
            .map(|pos| self.change_versions[pos])
    }

    /// Change versions in [`types`](Self::types) order.
    pub fn change_versions(&self) -> &[u64] {
        &self.change_versions
    }

    pub(crate) fn mark_changed(&mut self, ty: ComponentTypeId, version: u64) {
        if let Some(pos) = self.layout.position(ty) {
            self.change_versions[pos] = version;
        }
    }

    pub(crate) fn mark_all_changed(&mut self, version: u64) {
        self.change_versions.fill(version);
    }

    // -- data access --------------------------------------------------------

    /// Bytes of a fixed-size component at `row`.
    ///
    /// Tags and zero-sized types yield an empty slice.
    pub fn component_bytes(&self, row: usize, ty: ComponentTypeId) -> Option<&[u8]> {
        if row >= self.entities.len() {
            return None;
        }
        match self.layout.slot(ty)? {
            ColumnSlot::Fixed { offset, size } => {
                let start = offset + row * size;
                self.block.get(start..start + size)
            }
            ColumnSlot::Tag => Some(&[]),
            _ => None,
        }
    }

    pub(crate) fn component_bytes_mut(
        &mut self,
        row: usize,
        ty: ComponentTypeId,
    ) -> Option<&mut [u8]> {
        if row >= self.entities.len() {
            return None;
        }
        match self.layout.slot(ty)? {
            ColumnSlot::Fixed { offset, size } => {
                let start = offset + row * size;
                self.block.get_mut(start..start + size)
            }
            ColumnSlot::Tag => Some(&mut []),
            _ => None,
        }
    }

    /// The whole column of a fixed-size component, `len() * size` bytes.
    pub fn column_bytes(&self, ty: ComponentTypeId) -> Option<&[u8]> {
        match self.layout.slot(ty)? {
            ColumnSlot::Fixed { offset, size } => {
                self.block.get(offset..offset + size * self.entities.len())
            }
            _ => None,
        }
    }

    /// Element bytes of a buffer component at `row`.
    pub fn buffer_bytes(&self, row: usize, ty: ComponentTypeId) -> Option<&[u8]> {
        match self.layout.slot(ty)? {
            ColumnSlot::Buffer { column, .. } => {
                self.buffers[column].get(row).map(Vec::as_slice)
            }
            _ => None,
        }
    }

    pub(crate) fn buffer_mut(&mut self, row: usize, ty: ComponentTypeId) -> Option<&mut Vec<u8>> {
        match self.layout.slot(ty)? {
            ColumnSlot::Buffer { column, .. } => self.buffers[column].get_mut(row),
            _ => None,
        }
    }

    /// The shared value index for a shared component type.
    pub fn shared_index(&self, ty: ComponentTypeId) -> Option<SharedIndex> {
        match self.layout.slot(ty)? {
            ColumnSlot::Shared { index } => Some(self.shared[index]),
            _ => None,
        }
    }

    /// All shared indices in shared-column order.
    pub fn shared_indices(&self) -> &[SharedIndex] {
        &self.shared
    }

    // -- structural ---------------------------------------------------------

    /// Append a zero-initialized row for `entity`. Returns the row.
    pub(crate) fn push(&mut self, entity: EntityId) -> usize {
        debug_assert!(!self.is_full(), "push into a full chunk");
        self.entities.push(entity);
        for column in &mut self.buffers {
            column.push(Vec::new());
        }
        self.entities.len() - 1
    }

    /// Append `entity` and fill it from `data`. Types not carried by this
    /// chunk are dropped; types not present in `data` stay zeroed.
    pub(crate) fn push_row(&mut self, entity: EntityId, data: RowData) -> usize {
        let row = self.push(entity);
        for (ty, bytes) in data.fixed {
            if let Some(dst) = self.component_bytes_mut(row, ty) {
                if dst.len() == bytes.len() {
                    dst.copy_from_slice(&bytes);
                }
            }
        }
        for (ty, bytes) in data.buffers {
            if let Some(dst) = self.buffer_mut(row, ty) {
                *dst = bytes;
            }
        }
        row
    }

    /// Remove `row` by moving the last row into its place.
    ///
    /// Returns the removed row's data and the entity that now occupies `row`,
    /// if any row was moved.
    pub(crate) fn swap_remove(&mut self, row: usize) -> (RowData, Option<EntityId>) {
        let last = self.entities.len() - 1;
        let mut data = RowData::default();

        for (pos, &ty) in self.layout.types().iter().enumerate() {
            match self.layout.slots[pos] {
                ColumnSlot::Fixed { offset, size } => {
                    let start = offset + row * size;
                    data.fixed.push((ty, self.block[start..start + size].to_vec()));
                    if row != last {
                        let src = offset + last * size;
                        self.block.copy_within(src..src + size, start);
                    }
                    let tail = offset + last * size;
                    self.block[tail..tail + size].fill(0);
                }
                ColumnSlot::Buffer { column, .. } => {
                    data.buffers
                        .push((ty, self.buffers[column].swap_remove(row)));
                }
                ColumnSlot::Tag | ColumnSlot::Shared { .. } => {}
            }
        }

        self.entities.swap_remove(row);
        let moved = (row != last).then(|| self.entities[row]);
        (data, moved)
    }

    /// Overwrite references to entities for which `is_alive` is false with
    /// [`EntityId::NULL`], stamping affected types with `version`.
    ///
    /// Returns the number of references cleared.
    pub(crate) fn clear_dangling(
        &mut self,
        registry: &TypeRegistry,
        is_alive: &(dyn Fn(EntityId) -> bool + Sync),
        version: u64,
    ) -> usize {
        let mut cleared_total = 0;
        for pos in 0..self.layout.types().len() {
            let ty = self.layout.types()[pos];
            let info = registry.info(ty);
            if info.entity_offsets.is_empty() {
                continue;
            }
            let mut cleared = 0;
            match self.layout.slots[pos] {
                ColumnSlot::Fixed { offset, size } => {
                    for row in 0..self.entities.len() {
                        let base = offset + row * size;
                        let element = &mut self.block[base..base + size];
                        cleared += clear_element(element, &info.entity_offsets, is_alive);
                    }
                }
                ColumnSlot::Buffer {
                    column,
                    element_size,
                } => {
                    for run in &mut self.buffers[column] {
                        for element in run.chunks_exact_mut(element_size.max(1)) {
                            cleared += clear_element(element, &info.entity_offsets, is_alive);
                        }
                    }
                }
                ColumnSlot::Tag | ColumnSlot::Shared { .. } => {}
            }
            if cleared > 0 {
                self.change_versions[pos] = version;
                cleared_total += cleared;
            }
        }
        cleared_total
    }
}

fn clear_element(
    element: &mut [u8],
    offsets: &[usize],
    is_alive: &(dyn Fn(EntityId) -> bool + Sync),
) -> usize {
    let mut cleared = 0;
    for &offset in offsets {
        let slot = &mut element[offset..offset + std::mem::size_of::<EntityId>()];
        let handle: EntityId = bytemuck::pod_read_unaligned(slot);
        if !handle.is_null() && !is_alive(handle) {
            slot.copy_from_slice(bytemuck::bytes_of(&EntityId::NULL));
            cleared += 1;
        }
    }
    cleared
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
