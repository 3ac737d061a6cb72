//! Component type registration and metadata.
//!
//! Every component type must be registered in a [`TypeRegistry`] before it is
//! used. The registry is built once at startup and then shared as an
//! `Arc<TypeRegistry>` between every store that holds data of those types and
//! every consumer that needs the metadata (the diff engine in particular).
//! There is exactly one registry per family of worlds; a world and its mirror
//! must share it.
//!
//! Registration produces a [`ComponentTypeId`], a dense index into the
//! registry, and a [`TypeInfo`] with the static facts the rest of the system
//! needs: byte size, kind, the byte offsets of embedded [`EntityId`]s, and a
//! stable 64-bit hash derived from the registered name.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::identity::StableId;
use crate::shared::SharedValue;

/// Registered name of the built-in [`StableId`] component.
pub const STABLE_ID_NAME: &str = "__stable_id";

/// Registered name of the built-in [`Disabled`] tag.
pub const DISABLED_NAME: &str = "__disabled";

// ---------------------------------------------------------------------------
// ComponentTypeId
// ---------------------------------------------------------------------------

/// Opaque, lightweight identifier for a registered component type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentTypeId(pub(crate) u32);

impl ComponentTypeId {
    /// Dense index into the registry.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentKind
// ---------------------------------------------------------------------------

/// How a component's data is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    /// Fixed-size plain bytes, one element per entity, stored in the chunk block.
    Data,
    /// Zero-sized marker. Presence is the only information.
    Tag,
    /// Variable-length run of fixed-size elements, one run per entity.
    Buffer,
    /// A boxed value shared by every entity of a chunk, stored in a
    /// reference-counted value store and compared by value, not by bytes.
    Shared,
}

// ---------------------------------------------------------------------------
// Built-in components
// ---------------------------------------------------------------------------

/// Built-in tag marking an entity as disabled.
///
/// Adding or removing it on an existing entity is what change consumers see as
/// an enabled-state toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Disabled;

// ---------------------------------------------------------------------------
// TypeInfo
// ---------------------------------------------------------------------------

/// Static metadata about a registered component type.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    /// Unique ID assigned at registration time.
    pub id: ComponentTypeId,
    /// Human-readable name (supplied by the caller).
    pub name: String,
    /// Storage kind.
    pub kind: ComponentKind,
    /// Size in bytes of one element. Zero for tags and shared types; for
    /// buffers this is the size of a single buffer element.
    pub element_size: usize,
    /// First eight bytes of the BLAKE3 hash of `name`, little endian.
    pub stable_hash: u64,
    /// Byte offsets (within one element) at which an [`EntityId`] is embedded.
    pub entity_offsets: Vec<usize>,
    /// System-state components belong to the local process and never take
    /// part in change tracking.
    pub system_state: bool,
    /// Rust `TypeId` for typed lookup.
    pub type_id: TypeId,
}

impl TypeInfo {
    /// Whether one element of this type occupies no bytes.
    #[inline]
    pub fn is_zero_sized(&self) -> bool {
        self.element_size == 0
    }

    /// Whether elements of this type embed entity handles.
    #[inline]
    pub fn has_entity_refs(&self) -> bool {
        !self.entity_offsets.is_empty()
    }
}

/// Hash a registered name into a stable 64-bit type identifier.
pub fn stable_type_hash(name: &str) -> u64 {
    let digest = blake3::hash(name.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

// ---------------------------------------------------------------------------
// TypeRegistry
// ---------------------------------------------------------------------------

/// Registry mapping Rust types to [`ComponentTypeId`]s and their metadata.
///
/// A Rust type can only be registered once; subsequent registrations of the
/// same `TypeId` return the existing [`ComponentTypeId`].
#[derive(Debug)]
pub struct TypeRegistry {
    /// TypeId -> ComponentTypeId for dedup.
    by_type: HashMap<TypeId, ComponentTypeId>,
    /// Name -> ComponentTypeId.
    by_name: HashMap<String, ComponentTypeId>,
    /// Stable hash -> ComponentTypeId.
    by_hash: HashMap<u64, ComponentTypeId>,
    /// Indexed by ComponentTypeId.0.
    infos: Vec<TypeInfo>,
    stable_id: ComponentTypeId,
    disabled: ComponentTypeId,
}

impl TypeRegistry {
    /// Create a registry with the built-in [`StableId`] component and
    /// [`Disabled`] tag already registered.
    pub fn new() -> Self {
        let mut registry = Self {
            by_type: HashMap::new(),
            by_name: HashMap::new(),
            by_hash: HashMap::new(),
            infos: Vec::new(),
            stable_id: ComponentTypeId(0),
            disabled: ComponentTypeId(0),
        };
        registry.stable_id = registry.register::<StableId>(STABLE_ID_NAME);
        registry.disabled = registry.register_tag::<Disabled>(DISABLED_NAME);
        registry
    }

    /// Register a fixed-size component. Zero-sized `T` registers as a tag.
    pub fn register<T: Pod>(&mut self, name: &str) -> ComponentTypeId {
        let kind = if std::mem::size_of::<T>() == 0 {
            ComponentKind::Tag
        } else {
            ComponentKind::Data
        };
        self.insert::<T>(name, kind, std::mem::size_of::<T>(), &[], false)
    }

    /// Register a fixed-size component that embeds [`EntityId`]s at the given
    /// byte offsets (use `std::mem::offset_of!`).
    ///
    /// # Panics
    ///
    /// Panics if an offset does not leave room for a whole `EntityId`.
    pub fn register_with_entity_refs<T: Pod>(
        &mut self,
        name: &str,
        entity_offsets: &[usize],
    ) -> ComponentTypeId {
        self.insert::<T>(
            name,
            ComponentKind::Data,
            std::mem::size_of::<T>(),
            entity_offsets,
            false,
        )
    }

    /// Register a zero-sized marker component.
    pub fn register_tag<T: 'static>(&mut self, name: &str) -> ComponentTypeId {
        self.insert::<T>(name, ComponentKind::Tag, 0, &[], false)
    }

    /// Register a variable-length buffer component whose elements are `T`.
    pub fn register_buffer<T: Pod>(&mut self, name: &str) -> ComponentTypeId {
        self.insert::<T>(
            name,
            ComponentKind::Buffer,
            std::mem::size_of::<T>(),
            &[],
            false,
        )
    }

    /// Register a buffer whose elements embed [`EntityId`]s.
    ///
    /// The store supports these fully; the change tracker refuses to diff them.
    pub fn register_buffer_with_entity_refs<T: Pod>(
        &mut self,
        name: &str,
        entity_offsets: &[usize],
    ) -> ComponentTypeId {
        self.insert::<T>(
            name,
            ComponentKind::Buffer,
            std::mem::size_of::<T>(),
            entity_offsets,
            false,
        )
    }

    /// Register a shared (boxed, compared-by-value) component.
    pub fn register_shared<T: SharedValue + PartialEq>(&mut self, name: &str) -> ComponentTypeId {
        self.insert::<T>(name, ComponentKind::Shared, 0, &[], false)
    }

    /// Register a fixed-size component that is excluded from change tracking.
    pub fn register_system_state<T: Pod>(&mut self, name: &str) -> ComponentTypeId {
        let kind = if std::mem::size_of::<T>() == 0 {
            ComponentKind::Tag
        } else {
            ComponentKind::Data
        };
        self.insert::<T>(name, kind, std::mem::size_of::<T>(), &[], true)
    }

    fn insert<T: 'static>(
        &mut self,
        name: &str,
        kind: ComponentKind,
        element_size: usize,
        entity_offsets: &[usize],
        system_state: bool,
    ) -> ComponentTypeId {
        let rust_type_id = TypeId::of::<T>();
        if let Some(&existing) = self.by_type.get(&rust_type_id) {
            return existing;
        }
        if self.by_name.contains_key(name) {
            panic!(
                "component name '{}' is already registered for a different type",
                name
            );
        }
        let entity_size = std::mem::size_of::<EntityId>();
        for &offset in entity_offsets {
            assert!(
                offset + entity_size <= element_size,
                "entity offset {offset} of component '{name}' does not fit in {element_size} bytes"
            );
        }
        let stable_hash = stable_type_hash(name);
        if let Some(&clash) = self.by_hash.get(&stable_hash) {
            panic!(
                "stable hash of component '{}' collides with '{}'",
                name, self.infos[clash.index()].name
            );
        }

        let id = ComponentTypeId(self.infos.len() as u32);
        let mut offsets = entity_offsets.to_vec();
        offsets.sort_unstable();
        offsets.dedup();
        self.infos.push(TypeInfo {
            id,
            name: name.to_owned(),
            kind,
            element_size,
            stable_hash,
            entity_offsets: offsets,
            system_state,
            type_id: rust_type_id,
        });
        self.by_type.insert(rust_type_id, id);
        self.by_name.insert(name.to_owned(), id);
        self.by_hash.insert(stable_hash, id);
        id
    }

    /// Look up a component type by its Rust `TypeId`.
    pub fn lookup<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Look up a component type by its registered name.
    pub fn lookup_by_name(&self, name: &str) -> Option<ComponentTypeId> {
        self.by_name.get(name).copied()
    }

    /// Look up a component type by its stable hash.
    pub fn lookup_by_hash(&self, hash: u64) -> Option<ComponentTypeId> {
        self.by_hash.get(&hash).copied()
    }

    /// Get the [`TypeInfo`] for a registered component type ID.
    pub fn get_info(&self, id: ComponentTypeId) -> Option<&TypeInfo> {
        self.infos.get(id.index())
    }

    /// Get the [`TypeInfo`] for a component type ID known to be registered.
    ///
    /// # Panics
    ///
    /// Panics if `id` did not come from this registry.
    pub fn info(&self, id: ComponentTypeId) -> &TypeInfo {
        &self.infos[id.index()]
    }

    /// The built-in [`StableId`] component.
    pub fn stable_id_type(&self) -> ComponentTypeId {
        self.stable_id
    }

    /// The built-in [`Disabled`] tag.
    pub fn disabled_type(&self) -> ComponentTypeId {
        self.disabled
    }

    /// Total number of registered component types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether any component types have been registered. Always `false`
    /// because of the built-ins.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Iterate all registered types in id order.
    pub fn iter(&self) -> impl Iterator<Item = &TypeInfo> {
        self.infos.iter()
    }

    /// Returns the names of all registered component types, sorted.
    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
