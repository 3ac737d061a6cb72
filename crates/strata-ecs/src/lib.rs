//! Strata ECS -- chunked entity/component store with durable identities.
//!
//! Entities are grouped into fixed-capacity chunks, one family of chunks per
//! archetype (set of component types) and combination of shared values.
//! Fixed-size component data lives in a Structure-of-Arrays byte block per
//! chunk; buffers and shared values are stored alongside. Each chunk keeps a
//! change version per component type and the world keeps a global version, so
//! an observer can tell which chunks were touched since it last looked.
//!
//! Entities that need to be correlated across stores carry a
//! [`StableId`](identity::StableId) component.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use strata_ecs::prelude::*;
//!
//! let mut registry = TypeRegistry::new();
//! registry.register::<[f32; 2]>("position");
//! let mut world = World::new(Arc::new(registry));
//!
//! let mut bundle = ComponentBundle::new();
//! bundle.add(world.registry(), [1.0f32, 2.0]);
//! let entity = world.spawn_with_stable_id(StableId::from_u128(1), bundle);
//!
//! assert_eq!(world.get::<[f32; 2]>(entity), Some([1.0, 2.0]));
//! assert_eq!(world.find_by_stable_id(StableId::from_u128(1)), Some(entity));
//! ```

#![deny(unsafe_code)]

pub mod chunk;
pub mod component;
#[allow(unsafe_code)]
pub mod entity;
#[allow(unsafe_code)]
pub mod identity;
pub mod shared;
pub mod world;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity does not exist (stale generation or never allocated).
    #[error("entity {entity:?} does not exist (stale or never allocated)")]
    StaleEntity { entity: entity::EntityId },

    /// A component type was referenced that has not been registered.
    #[error("component type '{name}' not registered. Registered components: [{registered}]")]
    UnknownComponent { name: String, registered: String },

    /// The entity does not carry the component an operation needs.
    #[error("entity {entity:?} has no component '{component}'")]
    MissingComponent {
        entity: entity::EntityId,
        component: String,
    },

    /// Raw bytes do not match the registered element size.
    #[error("component '{component}' expects {expected} bytes per element, got {actual}")]
    SizeMismatch {
        component: String,
        expected: usize,
        actual: usize,
    },

    /// The operation does not apply to the component's storage kind.
    #[error("{operation} does not apply to component '{component}' of kind {kind:?}")]
    KindMismatch {
        component: String,
        kind: component::ComponentKind,
        operation: &'static str,
    },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::chunk::{Chunk, ChunkLayout, ColumnSlot};
    pub use crate::component::{ComponentKind, ComponentTypeId, Disabled, TypeInfo, TypeRegistry};
    pub use crate::entity::EntityId;
    pub use crate::identity::{StableId, StableIdGenerator};
    pub use crate::shared::{SharedIndex, SharedValue, SharedValueStore};
    pub use crate::world::{ComponentBundle, ComponentValue, StoreConfig, World};
    pub use crate::EcsError;
}
