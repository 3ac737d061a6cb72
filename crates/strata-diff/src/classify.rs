//! Chunk-granular change detection.
//!
//! Chunks of the observed world are matched against the shadow baseline by
//! sequence number. A matched pair whose entity count, archetype and every
//! per-type change version agree is unchanged and is skipped outright. Any
//! other observed chunk is treated as created, and any shadow chunk not
//! claimed by an unchanged pair as destroyed. A chunk is never partially
//! diffed: a single touched column sends every entity in it to the entity
//! matcher.

use std::collections::HashSet;

use tracing::trace;

use strata_ecs::chunk::Chunk;
use strata_ecs::world::World;

use crate::jobs;
use crate::shadow::ShadowWorld;

/// Result of comparing the observed world's chunks with the baseline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkClassification {
    /// Sequence numbers of observed chunks that need diffing.
    pub created: Vec<u64>,
    /// Sequence numbers of shadow chunks that need diffing.
    pub destroyed: Vec<u64>,
    /// Number of observed chunks skipped as unchanged.
    pub unchanged: usize,
}

impl ChunkClassification {
    pub fn has_changes(&self) -> bool {
        !self.created.is_empty() || !self.destroyed.is_empty()
    }
}

enum Verdict {
    Unchanged { shadow_sequence: u64 },
    Changed,
}

/// Classify every `StableId`-carrying chunk of `current` against `shadow`.
/// One task per chunk when `parallel` is set.
pub fn classify_chunks(current: &World, shadow: &ShadowWorld, parallel: bool) -> ChunkClassification {
    let stable_ty = current.registry().stable_id_type();
    let chunks: Vec<&Chunk> = current.chunks_with(stable_ty).collect();
    let verdicts = jobs::par_map(parallel, &chunks, |chunk| classify_one(chunk, shadow));

    let mut classification = ChunkClassification::default();
    let mut claimed = HashSet::new();
    for (chunk, verdict) in chunks.iter().zip(verdicts) {
        match verdict {
            Verdict::Unchanged { shadow_sequence } => {
                claimed.insert(shadow_sequence);
                classification.unchanged += 1;
            }
            Verdict::Changed => classification.created.push(chunk.sequence_number()),
        }
    }
    classification.destroyed = shadow
        .chunks()
        .map(Chunk::sequence_number)
        .filter(|seq| !claimed.contains(seq))
        .collect();

    trace!(
        created = classification.created.len(),
        destroyed = classification.destroyed.len(),
        unchanged = classification.unchanged,
        "classified chunks"
    );
    classification
}

fn classify_one(chunk: &Chunk, shadow: &ShadowWorld) -> Verdict {
    let baseline = shadow
        .mapped_sequence(chunk.sequence_number())
        .and_then(|seq| shadow.chunk(seq).map(|baseline| (seq, baseline)));
    match baseline {
        Some((shadow_sequence, baseline)) if same_contents(chunk, baseline) => {
            Verdict::Unchanged { shadow_sequence }
        }
        _ => Verdict::Changed,
    }
}

fn same_contents(current: &Chunk, baseline: &Chunk) -> bool {
    current.len() == baseline.len()
        && current.types() == baseline.types()
        && current.change_versions() == baseline.change_versions()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use strata_ecs::prelude::*;

    use super::*;

    fn setup_world() -> World {
        let mut reg = TypeRegistry::new();
        reg.register::<u32>("health");
        reg.register::<u64>("score");
        let config = StoreConfig {
            chunk_bytes: 1024,
            max_chunk_capacity: 2,
        };
        World::with_config(Arc::new(reg), config)
    }

    fn spawn(world: &mut World, id: u128) -> EntityId {
        let mut b = ComponentBundle::new();
        b.add(world.registry(), 1u32);
        world.spawn_with_stable_id(StableId::from_u128(id), b)
    }

    fn synced(world: &World) -> ShadowWorld {
        let mut shadow = ShadowWorld::new();
        let classification = classify_chunks(world, &shadow, true);
        shadow.synchronize(world, &classification);
        shadow
    }

    #[test]
    fn empty_baseline_sees_everything_created() {
        let mut world = setup_world();
        for id in 0..5 {
            spawn(&mut world, id);
        }
        let classification = classify_chunks(&world, &ShadowWorld::new(), true);
        assert_eq!(classification.created.len(), 3);
        assert!(classification.destroyed.is_empty());
    }

    #[test]
    fn untouched_chunks_are_skipped() {
        let mut world = setup_world();
        let ids: Vec<_> = (0..6).map(|id| spawn(&mut world, id)).collect();
        let shadow = synced(&world);

        world.set(ids[0], 9u32).unwrap();
        let classification = classify_chunks(&world, &shadow, true);
        assert_eq!(classification.created.len(), 1);
        assert_eq!(classification.destroyed.len(), 1);
        assert_eq!(classification.unchanged, 2);
    }

    #[test]
    fn untracked_chunks_are_ignored() {
        let mut world = setup_world();
        spawn(&mut world, 1);
        let shadow = synced(&world);
        let mut b = ComponentBundle::new();
        b.add(world.registry(), 3u64);
        world.spawn(b);
        assert!(!classify_chunks(&world, &shadow, true).has_changes());
    }

    #[test]
    fn despawn_of_last_entity_destroys_chunk() {
        let mut world = setup_world();
        let e = spawn(&mut world, 1);
        let shadow = synced(&world);
        world.despawn(e).unwrap();
        let classification = classify_chunks(&world, &shadow, false);
        assert!(classification.created.is_empty());
        assert_eq!(classification.destroyed.len(), 1);
    }

    #[test]
    fn parallel_and_sequential_agree() {
        let mut world = setup_world();
        let ids: Vec<_> = (0..20).map(|id| spawn(&mut world, id)).collect();
        let shadow = synced(&world);
        for e in ids.iter().step_by(3) {
            world.set(*e, 2u32).unwrap();
        }
        assert_eq!(
            classify_chunks(&world, &shadow, true),
            classify_chunks(&world, &shadow, false)
        );
    }
}
