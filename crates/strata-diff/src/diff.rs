//! The diff payload and the query surface handed to subscribers.
//!
//! A [`WorldDiff`] describes how to turn one snapshot into another. Entities
//! and component types are dictionary-encoded: records carry indices into the
//! diff's own table of `StableId`s and table of type hashes. The id table
//! starts with the created entities, followed by the destroyed entities,
//! followed by every entity some modification record refers to.
//!
//! Component bytes are not stored in the records themselves; each record
//! points at a range of one shared payload buffer. Embedded entity handles
//! inside those bytes are meaningless outside the snapshot they came from, so
//! every such handle is accompanied by an [`EntityPatch`] naming the
//! referenced entity by `StableId`.
//!
//! Diffs always come in pairs. [`Changes`] bundles a diff with its inverse.

use std::sync::Arc;

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

use strata_ecs::component::{ComponentTypeId, TypeRegistry};
use strata_ecs::identity::StableId;
use strata_ecs::shared::SharedValue;
use strata_ecs::world::World;

use crate::patch::{apply_diff, PatchReport};
use crate::DiffError;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// An entity and a component type, both as indices into the owning diff's
/// tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackedComponent {
    pub entity_index: u32,
    pub type_index: u32,
}

/// A byte range of a diff's payload buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PayloadRange {
    pub offset: usize,
    pub len: usize,
}

/// A component that exists after but not before, with its initial bytes.
/// The payload is empty for tags and shared components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddComponent {
    pub component: PackedComponent,
    pub payload: PayloadRange,
}

/// A component present on both sides whose bytes differ. Buffers carry the
/// whole element run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetComponent {
    pub component: PackedComponent,
    pub payload: PayloadRange,
}

/// Rewrite of one embedded entity handle. `offset` is the byte offset of the
/// handle within the component element; `None` means "no entity".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityPatch {
    pub component: PackedComponent,
    pub offset: usize,
    pub target: Option<StableId>,
}

/// New value of a shared component.
#[derive(Debug, Clone)]
pub struct SharedSet {
    pub component: PackedComponent,
    pub value: Arc<dyn SharedValue>,
}

// ---------------------------------------------------------------------------
// WorldDiff
// ---------------------------------------------------------------------------

/// Everything that changed between two snapshots.
#[derive(Debug, Clone, Default)]
pub struct WorldDiff {
    pub(crate) created_count: usize,
    pub(crate) destroyed_count: usize,
    pub(crate) entity_ids: Vec<StableId>,
    pub(crate) type_hashes: Vec<u64>,
    pub(crate) added: Vec<AddComponent>,
    pub(crate) removed: Vec<PackedComponent>,
    pub(crate) set: Vec<SetComponent>,
    pub(crate) patches: Vec<EntityPatch>,
    pub(crate) shared_sets: Vec<SharedSet>,
    pub(crate) payload: Vec<u8>,
}

impl WorldDiff {
    pub fn created_count(&self) -> usize {
        self.created_count
    }

    pub fn destroyed_count(&self) -> usize {
        self.destroyed_count
    }

    /// The whole id table.
    pub fn entity_ids(&self) -> &[StableId] {
        &self.entity_ids
    }

    pub fn created_ids(&self) -> &[StableId] {
        &self.entity_ids[..self.created_count]
    }

    pub fn destroyed_ids(&self) -> &[StableId] {
        &self.entity_ids[self.created_count..self.created_count + self.destroyed_count]
    }

    /// Ids that only appear because a modification record refers to them.
    pub fn modified_ids(&self) -> &[StableId] {
        &self.entity_ids[self.created_count + self.destroyed_count..]
    }

    pub fn entity_id(&self, index: u32) -> StableId {
        self.entity_ids[index as usize]
    }

    pub fn type_hashes(&self) -> &[u64] {
        &self.type_hashes
    }

    pub fn type_hash(&self, index: u32) -> u64 {
        self.type_hashes[index as usize]
    }

    pub fn added(&self) -> &[AddComponent] {
        &self.added
    }

    pub fn removed(&self) -> &[PackedComponent] {
        &self.removed
    }

    pub fn set(&self) -> &[SetComponent] {
        &self.set
    }

    pub fn entity_patches(&self) -> &[EntityPatch] {
        &self.patches
    }

    pub fn shared_sets(&self) -> &[SharedSet] {
        &self.shared_sets
    }

    pub fn payload(&self, range: PayloadRange) -> &[u8] {
        &self.payload[range.offset..range.offset + range.len]
    }

    /// Whether the entity at `index` was created by this diff.
    pub fn is_created(&self, entity_index: u32) -> bool {
        (entity_index as usize) < self.created_count
    }

    pub fn is_empty(&self) -> bool {
        self.created_count == 0
            && self.destroyed_count == 0
            && self.added.is_empty()
            && self.removed.is_empty()
            && self.set.is_empty()
            && self.patches.is_empty()
            && self.shared_sets.is_empty()
    }

    pub fn summary(&self) -> DiffSummary {
        DiffSummary {
            created: self.created_count,
            destroyed: self.destroyed_count,
            modified_entities: self.modified_ids().len(),
            components_added: self.added.len(),
            components_removed: self.removed.len(),
            components_set: self.set.len(),
            shared_sets: self.shared_sets.len(),
            entity_patches: self.patches.len(),
            payload_bytes: self.payload.len(),
        }
    }

    fn type_index_of(&self, hash: u64) -> Option<u32> {
        self.type_hashes
            .iter()
            .position(|&h| h == hash)
            .map(|index| index as u32)
    }
}

/// Record counts of one diff, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub created: usize,
    pub destroyed: usize,
    pub modified_entities: usize,
    pub components_added: usize,
    pub components_removed: usize,
    pub components_set: usize,
    pub shared_sets: usize,
    pub entity_patches: usize,
    pub payload_bytes: usize,
}

// ---------------------------------------------------------------------------
// Changes
// ---------------------------------------------------------------------------

/// Enabled-state change of an entity that exists on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnabledToggle {
    pub stable_id: StableId,
    /// `true` when the `Disabled` tag was removed.
    pub enabled: bool,
}

/// A diff and its inverse, plus the registry needed to interpret them.
#[derive(Debug, Clone)]
pub struct Changes {
    forward: WorldDiff,
    inverse: WorldDiff,
    registry: Arc<TypeRegistry>,
}

impl Changes {
    pub(crate) fn new(forward: WorldDiff, inverse: WorldDiff, registry: Arc<TypeRegistry>) -> Self {
        Self {
            forward,
            inverse,
            registry,
        }
    }

    /// Baseline -> current.
    pub fn forward(&self) -> &WorldDiff {
        &self.forward
    }

    /// Current -> baseline.
    pub fn inverse(&self) -> &WorldDiff {
        &self.inverse
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn summary(&self) -> DiffSummary {
        self.forward.summary()
    }

    // -- flags --------------------------------------------------------------

    pub fn entities_were_created(&self) -> bool {
        self.forward.created_count > 0
    }

    pub fn entities_were_deleted(&self) -> bool {
        self.forward.destroyed_count > 0
    }

    /// Any add record, including those describing created entities.
    pub fn components_were_added(&self) -> bool {
        !self.forward.added.is_empty()
    }

    pub fn components_were_removed(&self) -> bool {
        !self.forward.removed.is_empty()
    }

    /// Any changed bytes, shared value, or entity reference.
    pub fn components_were_modified(&self) -> bool {
        !self.forward.set.is_empty()
            || !self.forward.shared_sets.is_empty()
            || !self.forward.patches.is_empty()
    }

    pub fn has_changes(&self) -> bool {
        !self.forward.is_empty()
    }

    // -- id queries ---------------------------------------------------------

    /// Every id the diff mentions: created, then destroyed, then modified.
    pub fn changed_stable_ids(&self) -> &[StableId] {
        self.forward.entity_ids()
    }

    pub fn created_stable_ids(&self) -> &[StableId] {
        self.forward.created_ids()
    }

    pub fn destroyed_stable_ids(&self) -> &[StableId] {
        self.forward.destroyed_ids()
    }

    pub fn modified_stable_ids(&self) -> &[StableId] {
        self.forward.modified_ids()
    }

    /// Entities that exist on both sides and gained or lost `Disabled`.
    pub fn enabled_toggles(&self) -> Vec<EnabledToggle> {
        let hash = self.registry.info(self.registry.disabled_type()).stable_hash;
        let Some(type_index) = self.forward.type_index_of(hash) else {
            return Vec::new();
        };
        let diff = &self.forward;
        let disabled = diff
            .added
            .iter()
            .map(|record| (record.component, false));
        let enabled = diff.removed.iter().map(|&component| (component, true));
        disabled
            .chain(enabled)
            .filter(|(component, _)| {
                component.type_index == type_index && !diff.is_created(component.entity_index)
            })
            .map(|(component, enabled)| EnabledToggle {
                stable_id: diff.entity_id(component.entity_index),
                enabled,
            })
            .collect()
    }

    // -- per-type queries ---------------------------------------------------

    /// Entities that gained `T`, created entities included.
    pub fn entities_with_added<T: 'static>(&self) -> Vec<StableId> {
        let Some(type_index) = self.type_index::<T>() else {
            return Vec::new();
        };
        self.forward
            .added
            .iter()
            .filter(|record| record.component.type_index == type_index)
            .map(|record| self.forward.entity_id(record.component.entity_index))
            .collect()
    }

    pub fn entities_with_removed<T: 'static>(&self) -> Vec<StableId> {
        let Some(type_index) = self.type_index::<T>() else {
            return Vec::new();
        };
        self.forward
            .removed
            .iter()
            .filter(|component| component.type_index == type_index)
            .map(|component| self.forward.entity_id(component.entity_index))
            .collect()
    }

    /// Entities whose `T` changed. For shared types this is every entity
    /// with a new shared value.
    pub fn entities_with_set<T: 'static>(&self) -> Vec<StableId> {
        let Some(type_index) = self.type_index::<T>() else {
            return Vec::new();
        };
        let set = self
            .forward
            .set
            .iter()
            .map(|record| record.component);
        let shared = self.forward.shared_sets.iter().map(|record| record.component);
        set.chain(shared)
            .filter(|component| component.type_index == type_index)
            .map(|component| self.forward.entity_id(component.entity_index))
            .collect()
    }

    /// Decoded new values of every set record of a fixed-size `T`.
    pub fn set_values<T: Pod>(&self) -> Vec<(StableId, T)> {
        let Some(type_index) = self.type_index::<T>() else {
            return Vec::new();
        };
        self.forward
            .set
            .iter()
            .filter(|record| record.component.type_index == type_index)
            .filter(|record| record.payload.len == std::mem::size_of::<T>())
            .map(|record| {
                (
                    self.forward.entity_id(record.component.entity_index),
                    bytemuck::pod_read_unaligned(self.forward.payload(record.payload)),
                )
            })
            .collect()
    }

    /// New values of every shared set of `T`.
    pub fn shared_set_values<T: 'static>(&self) -> Vec<(StableId, &T)> {
        let Some(type_index) = self.type_index::<T>() else {
            return Vec::new();
        };
        self.forward
            .shared_sets
            .iter()
            .filter(|record| record.component.type_index == type_index)
            .filter_map(|record| {
                let value = (*record.value).as_any().downcast_ref::<T>()?;
                Some((self.forward.entity_id(record.component.entity_index), value))
            })
            .collect()
    }

    /// Index of `T` in the forward diff's type table.
    fn type_index<T: 'static>(&self) -> Option<u32> {
        let ty: ComponentTypeId = self.registry.lookup::<T>()?;
        self.forward
            .type_index_of(self.registry.info(ty).stable_hash)
    }

    // -- application --------------------------------------------------------

    /// Apply the inverse to `world`, turning the current state back into the
    /// baseline.
    pub fn undo(&self, world: &mut World) -> Result<PatchReport, DiffError> {
        apply_diff(world, &self.inverse)
    }

    /// Apply the forward diff to `world`, turning the baseline into the
    /// current state.
    pub fn redo(&self, world: &mut World) -> Result<PatchReport, DiffError> {
        apply_diff(world, &self.forward)
    }
}
