//! The shadow baseline a tracker diffs against.
//!
//! A [`ShadowWorld`] is a set of byte-for-byte chunk copies taken from the
//! observed world, plus a map from each source chunk's sequence number to the
//! sequence number of its copy. It is not a [`World`]: it has no allocator
//! and no locations, and the entity handles inside its chunks are the observed
//! world's handles as they were when the chunk was copied. Shared values are
//! re-interned into the shadow's own [`SharedValueStore`].
//!
//! Only chunks whose archetype carries `StableId` are mirrored.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::trace;

use strata_ecs::chunk::Chunk;
use strata_ecs::shared::SharedValueStore;
use strata_ecs::world::World;

use crate::classify::ChunkClassification;

/// Counts from one [`ShadowWorld::synchronize`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub chunks_released: usize,
    pub chunks_cloned: usize,
}

/// The mirrored baseline owned by one tracker.
#[derive(Debug, Clone)]
pub struct ShadowWorld {
    /// Keyed by shadow sequence number.
    chunks: BTreeMap<u64, Chunk>,
    /// Observed-world sequence number -> shadow sequence number.
    forward: HashMap<u64, u64>,
    /// Shadow sequence number -> observed-world sequence number.
    reverse: HashMap<u64, u64>,
    shared: SharedValueStore,
    next_sequence: u64,
}

impl ShadowWorld {
    /// An empty baseline. Diffing against it reports every entity as created.
    pub fn new() -> Self {
        Self {
            chunks: BTreeMap::new(),
            forward: HashMap::new(),
            reverse: HashMap::new(),
            shared: SharedValueStore::new(),
            next_sequence: 1,
        }
    }

    /// Copy every tracked chunk of `world` without recording sequence
    /// mappings. Diffing another world against the result matches every
    /// entity by `StableId`.
    pub fn snapshot_of(world: &World) -> Self {
        let mut shadow = Self::new();
        let stable_ty = world.registry().stable_id_type();
        for chunk in world.chunks_with(stable_ty) {
            shadow.clone_chunk(chunk, world.shared_values());
        }
        shadow
    }

    pub fn chunk(&self, sequence_number: u64) -> Option<&Chunk> {
        self.chunks.get(&sequence_number)
    }

    /// All mirrored chunks in ascending shadow sequence order.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn entity_count(&self) -> usize {
        self.chunks.values().map(Chunk::len).sum()
    }

    /// The shadow chunk mirroring the observed chunk `current_sequence`.
    pub fn mapped_sequence(&self, current_sequence: u64) -> Option<u64> {
        self.forward.get(&current_sequence).copied()
    }

    pub fn shared_values(&self) -> &SharedValueStore {
        &self.shared
    }

    /// Drop everything. The next diff reports every entity as created.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Bring the baseline in line with `current`: release every destroyed
    /// shadow chunk, then copy every created chunk.
    pub fn synchronize(&mut self, current: &World, classification: &ChunkClassification) -> SyncReport {
        let mut report = SyncReport::default();
        for &seq in &classification.destroyed {
            if self.release_chunk(seq) {
                report.chunks_released += 1;
            }
        }
        for &seq in &classification.created {
            let Some(source) = current.chunk(seq) else {
                continue;
            };
            let shadow_seq = self.clone_chunk(source, current.shared_values());
            self.forward.insert(seq, shadow_seq);
            self.reverse.insert(shadow_seq, seq);
            report.chunks_cloned += 1;
        }
        trace!(
            released = report.chunks_released,
            cloned = report.chunks_cloned,
            "shadow synchronized"
        );
        report
    }

    /// Build a complete copy of `source` and insert it. Returns its shadow
    /// sequence number.
    fn clone_chunk(&mut self, source: &Chunk, source_shared: &SharedValueStore) -> u64 {
        let shared = source
            .shared_indices()
            .iter()
            .map(|&index| self.shared.import(source_shared, index))
            .collect();
        let seq = self.next_sequence;
        self.next_sequence += 1;
        let copy = source.duplicate(seq, shared);
        self.chunks.insert(seq, copy);
        seq
    }

    fn release_chunk(&mut self, seq: u64) -> bool {
        let Some(chunk) = self.chunks.remove(&seq) else {
            return false;
        };
        for &index in chunk.shared_indices() {
            self.shared.release(index);
        }
        if let Some(current) = self.reverse.remove(&seq) {
            if self.forward.get(&current) == Some(&seq) {
                self.forward.remove(&current);
            }
        }
        true
    }
}

impl Default for ShadowWorld {
    fn default() -> Self {
        Self::new()
    }
}
