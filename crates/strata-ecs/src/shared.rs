//! Shared (boxed) component values.
//!
//! A shared component is not stored per entity. Every entity in a chunk sees
//! the same value, and the chunk only records a [`SharedIndex`] into the
//! world's [`SharedValueStore`]. Equal values of the same component type are
//! interned into a single reference-counted slot, so two chunks carrying
//! equal values carry equal indices within one store.
//!
//! Indices are store-local. Comparing a value held by one world with a value
//! held by another goes through [`SharedValue::dyn_eq`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::component::ComponentTypeId;

// ---------------------------------------------------------------------------
// SharedValue
// ---------------------------------------------------------------------------

/// Object-safe view of a shared component value.
pub trait SharedValue: Any + Debug + Send + Sync {
    /// Upcast for downcasting to the concrete type.
    fn as_any(&self) -> &dyn Any;

    /// Dynamic equality. Values of different concrete types are never equal.
    fn dyn_eq(&self, other: &dyn SharedValue) -> bool;
}

impl<T> SharedValue for T
where
    T: PartialEq + Debug + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn SharedValue) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }
}

/// Compare two boxed values.
pub fn shared_values_equal(a: &Arc<dyn SharedValue>, b: &Arc<dyn SharedValue>) -> bool {
    Arc::ptr_eq(a, b) || (**a).dyn_eq(&**b)
}

// ---------------------------------------------------------------------------
// SharedIndex
// ---------------------------------------------------------------------------

/// Index of an interned value inside one [`SharedValueStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SharedIndex(u32);

impl SharedIndex {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// SharedValueStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Slot {
    component: ComponentTypeId,
    value: Arc<dyn SharedValue>,
    refcount: u32,
}

/// Reference-counted interning table for shared component values.
#[derive(Debug, Clone, Default)]
pub struct SharedValueStore {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    /// Live slot indices per component type, searched on intern.
    by_type: HashMap<ComponentTypeId, Vec<u32>>,
}

impl SharedValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `value` for `component` and take one reference to its slot.
    ///
    /// If an equal value of the same type is already stored its slot is
    /// reused.
    pub fn intern(&mut self, component: ComponentTypeId, value: Arc<dyn SharedValue>) -> SharedIndex {
        if let Some(candidates) = self.by_type.get(&component) {
            for &raw in candidates {
                if let Some(slot) = self.slots[raw as usize].as_mut() {
                    if shared_values_equal(&slot.value, &value) {
                        slot.refcount += 1;
                        return SharedIndex(raw);
                    }
                }
            }
        }

        let slot = Slot {
            component,
            value,
            refcount: 1,
        };
        let raw = match self.free.pop() {
            Some(raw) => {
                self.slots[raw as usize] = Some(slot);
                raw
            }
            None => {
                self.slots.push(Some(slot));
                (self.slots.len() - 1) as u32
            }
        };
        self.by_type.entry(component).or_default().push(raw);
        SharedIndex(raw)
    }

    /// Take an additional reference to a live slot.
    ///
    /// # Panics
    ///
    /// Panics if `index` does not name a live slot.
    pub fn retain(&mut self, index: SharedIndex) {
        let slot = self.slots[index.index()]
            .as_mut()
            .expect("retain on a freed shared value slot");
        slot.refcount += 1;
    }

    /// Drop one reference. The slot is freed when its count reaches zero.
    ///
    /// Returns `true` if the slot was freed.
    pub fn release(&mut self, index: SharedIndex) -> bool {
        let Some(slot) = self.slots.get_mut(index.index()).and_then(Option::as_mut) else {
            return false;
        };
        slot.refcount -= 1;
        if slot.refcount > 0 {
            return false;
        }
        let component = slot.component;
        self.slots[index.index()] = None;
        if let Some(list) = self.by_type.get_mut(&component) {
            list.retain(|&raw| raw != index.0);
            if list.is_empty() {
                self.by_type.remove(&component);
            }
        }
        self.free.push(index.0);
        true
    }

    /// The value stored at `index`.
    pub fn get(&self, index: SharedIndex) -> Option<&Arc<dyn SharedValue>> {
        self.slots
            .get(index.index())
            .and_then(Option::as_ref)
            .map(|slot| &slot.value)
    }

    /// The component type the value at `index` was interned for.
    pub fn component_of(&self, index: SharedIndex) -> Option<ComponentTypeId> {
        self.slots
            .get(index.index())
            .and_then(Option::as_ref)
            .map(|slot| slot.component)
    }

    /// Current reference count of `index` (zero if freed).
    pub fn refcount(&self, index: SharedIndex) -> u32 {
        self.slots
            .get(index.index())
            .and_then(Option::as_ref)
            .map_or(0, |slot| slot.refcount)
    }

    /// Copy the value at `index` in `other` into this store, taking one
    /// reference to the resulting slot.
    ///
    /// # Panics
    ///
    /// Panics if `index` does not name a live slot of `other`.
    pub fn import(&mut self, other: &SharedValueStore, index: SharedIndex) -> SharedIndex {
        let slot = other.slots[index.index()]
            .as_ref()
            .expect("import of a freed shared value slot");
        self.intern(slot.component, Arc::clone(&slot.value))
    }

    /// Compare a value of this store with a value of another store.
    pub fn values_equal(
        &self,
        index: SharedIndex,
        other: &SharedValueStore,
        other_index: SharedIndex,
    ) -> bool {
        match (self.get(index), other.get(other_index)) {
            (Some(a), Some(b)) => shared_values_equal(a, b),
            _ => false,
        }
    }

    /// Number of live slots.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
