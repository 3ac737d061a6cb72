//! Entity correlation by `StableId`.
//!
//! Entities of the changed chunks on each side are flattened into
//! [`EntityEntry`] lists sorted by `StableId`, then paired up with a single
//! two-pointer merge-join. Matching is strict equality on the id. Duplicate
//! ids on one side are paired in encounter order with the next equal id on
//! the other side; whatever is left over is reported as created or
//! destroyed.

use std::cmp::Ordering;

use strata_ecs::chunk::Chunk;
use strata_ecs::component::ComponentTypeId;
use strata_ecs::identity::StableId;

use crate::jobs;

/// One entity of a changed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityEntry {
    pub stable_id: StableId,
    /// Index into the side's list of changed chunks.
    pub chunk: usize,
    pub row: usize,
}

/// Output of [`match_entities`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityMatch {
    /// Only on the after side.
    pub created: Vec<EntityEntry>,
    /// Only on the before side.
    pub destroyed: Vec<EntityEntry>,
    /// `(before, after)` pairs sharing an id.
    pub modified: Vec<(EntityEntry, EntityEntry)>,
}

impl EntityMatch {
    /// The same match seen from the other side.
    pub fn inverted(&self) -> EntityMatch {
        EntityMatch {
            created: self.destroyed.clone(),
            destroyed: self.created.clone(),
            modified: self.modified.iter().map(|&(b, a)| (a, b)).collect(),
        }
    }
}

/// Read the `StableId` of every entity in `chunks`, one task per chunk, and
/// return them stably sorted by id.
pub fn extract_entries(chunks: &[&Chunk], stable_ty: ComponentTypeId, parallel: bool) -> Vec<EntityEntry> {
    let indexed: Vec<(usize, &Chunk)> = chunks.iter().copied().enumerate().collect();
    let per_chunk = jobs::par_map(parallel, &indexed, |&(chunk_index, chunk)| {
        let Some(column) = chunk.column_bytes(stable_ty) else {
            return Vec::new();
        };
        column
            .chunks_exact(std::mem::size_of::<StableId>())
            .enumerate()
            .map(|(row, bytes)| EntityEntry {
                stable_id: bytemuck::pod_read_unaligned(bytes),
                chunk: chunk_index,
                row,
            })
            .collect::<Vec<_>>()
    });
    let mut entries: Vec<EntityEntry> = per_chunk.into_iter().flatten().collect();
    entries.sort_by_key(|entry| entry.stable_id);
    entries
}

/// Merge-join two id-sorted entry lists.
pub fn match_entities(before: &[EntityEntry], after: &[EntityEntry]) -> EntityMatch {
    let mut result = EntityMatch::default();
    let (mut i, mut j) = (0, 0);
    while i < before.len() && j < after.len() {
        match before[i].stable_id.cmp(&after[j].stable_id) {
            Ordering::Less => {
                result.destroyed.push(before[i]);
                i += 1;
            }
            Ordering::Greater => {
                result.created.push(after[j]);
                j += 1;
            }
            Ordering::Equal => {
                result.modified.push((before[i], after[j]));
                i += 1;
                j += 1;
            }
        }
    }
    result.destroyed.extend_from_slice(&before[i..]);
    result.created.extend_from_slice(&after[j..]);
    result
}
