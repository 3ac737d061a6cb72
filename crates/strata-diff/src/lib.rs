//! Strata Diff -- change tracking for chunked worlds.
//!
//! A [`ChangeTracker`](dispatch::ChangeTracker) keeps a private shadow copy of
//! every chunk of a [`World`](strata_ecs::world::World) that carries a
//! [`StableId`](strata_ecs::identity::StableId). On each update it finds the
//! chunks that were touched since the last update, matches their entities
//! against the baseline by `StableId`, and builds a
//! [`WorldDiff`](diff::WorldDiff) plus its inverse. Subscribers are notified
//! once per settled state.
//!
//! Diffs are relocatable: entity handles embedded in component bytes are
//! rewritten to `StableId`s, so a diff can be applied to any world holding the
//! same entities ([`patch::apply_diff`]).
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use strata_ecs::prelude::*;
//! use strata_diff::prelude::*;
//!
//! let mut registry = TypeRegistry::new();
//! registry.register::<u32>("health");
//! let registry = Arc::new(registry);
//! let mut world = World::new(Arc::clone(&registry));
//! let mut tracker = ChangeTracker::new(registry);
//!
//! let mut bundle = ComponentBundle::new();
//! bundle.add(world.registry(), 10u32);
//! let entity = world.spawn_with_stable_id(StableId::from_u128(1), bundle);
//! tracker.update(&mut world);
//!
//! world.set(entity, 7u32).unwrap();
//! let changes = tracker.diff_once(&mut world).unwrap();
//! assert_eq!(changes.set_values::<u32>(), vec![(StableId::from_u128(1), 7)]);
//! ```

#![deny(unsafe_code)]

pub mod builder;
pub mod classify;
pub mod config;
pub mod diff;
pub mod dispatch;
pub mod jobs;
pub mod matcher;
pub mod packed;
pub mod patch;
pub mod shadow;

use strata_ecs::identity::StableId;
use strata_ecs::EcsError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced when applying a diff to a world.
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    /// A record refers to an entity the world does not hold.
    #[error("no entity with stable id {stable_id}")]
    MissingEntity { stable_id: StableId },

    /// The diff creates an entity the world already holds.
    #[error("entity with stable id {stable_id} already exists")]
    DuplicateEntity { stable_id: StableId },

    /// The diff names a component type the world's registry does not know.
    #[error("no registered component type has stable hash {hash:#018x}")]
    UnknownTypeHash { hash: u64 },

    /// A shared component is added without a value to add.
    #[error("shared component '{component}' added to {stable_id} without a value")]
    MissingSharedValue { stable_id: StableId, component: String },

    /// A set or reference patch targets a component the entity will not
    /// carry once the diff's adds and removes are applied.
    #[error("entity {stable_id} has no component '{component}' to write")]
    MissingComponent { stable_id: StableId, component: String },

    /// The store rejected a write.
    #[error(transparent)]
    Store(#[from] EcsError),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::builder::diff_worlds;
    pub use crate::config::TrackerConfig;
    pub use crate::diff::{Changes, DiffSummary, EnabledToggle, WorldDiff};
    pub use crate::dispatch::{
        ChangeTracker, DispatchContext, SubscriberId, TrackerState, TrackingSignal, UpdateReport,
    };
    pub use crate::patch::{apply_diff, PatchReport};
    pub use crate::shadow::ShadowWorld;
    pub use crate::DiffError;
}
