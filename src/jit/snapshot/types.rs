//! Type, type-handler and equivalent-type-set views

use crate::runtime::{PropertyId, RuntimeType, TypeId};
use serde::{Deserialize, Serialize};

/// Frozen slot layout of a type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeHandlerView {
    property_ids: Vec<PropertyId>,
    inline_slot_capacity: u32,
    is_path_type: bool,
}

impl TypeHandlerView {
    pub fn property_count(&self) -> u32 {
        self.property_ids.len() as u32
    }

    pub fn inline_slot_capacity(&self) -> u32 {
        self.inline_slot_capacity
    }

    /// Whether the type was reached through transitions from the root
    pub fn is_path_type(&self) -> bool {
        self.is_path_type
    }

    pub fn slot_of(&self, prop: PropertyId) -> Option<u32> {
        self.property_ids.iter().position(|p| *p == prop).map(|i| i as u32)
    }
}

/// Frozen view of one object type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeView {
    id: TypeId,
    handler: TypeHandlerView,
}

impl TypeView {
    /// Copy the layout of a live type
    pub fn capture(ty: &RuntimeType) -> Self {
        Self {
            id: ty.id,
            handler: TypeHandlerView {
                property_ids: ty.properties.clone(),
                inline_slot_capacity: (ty.properties.len() as u32).next_power_of_two().max(4),
                is_path_type: ty.parent.is_some() || ty.properties.is_empty(),
            },
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn handler(&self) -> &TypeHandlerView {
        &self.handler
    }

    pub fn slot_count(&self) -> u32 {
        self.handler.property_count()
    }

    pub fn slot_of(&self, prop: PropertyId) -> Option<u32> {
        self.handler.slot_of(prop)
    }
}

/// Set of types a value was observed with at one program point
///
/// Comparisons (`are_identical`, `is_subset_of`) are only defined after
/// `sort_and_remove_duplicates`; `contains` works either way.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EquivalentTypeSet {
    types: Vec<TypeId>,
    sorted: bool,
}

impl EquivalentTypeSet {
    /// An unnormalized set (observation order, duplicates allowed)
    pub fn new(types: Vec<TypeId>) -> Self {
        let sorted = types.len() <= 1;
        Self { types, sorted }
    }

    /// A normalized set
    pub fn normalized(types: Vec<TypeId>) -> Self {
        let mut set = Self::new(types);
        set.sort_and_remove_duplicates();
        set
    }

    pub fn single(t: TypeId) -> Self {
        Self {
            types: vec![t],
            sorted: true,
        }
    }

    pub fn insert(&mut self, t: TypeId) {
        self.types.push(t);
        self.sorted = self.types.len() <= 1;
    }

    pub fn sort_and_remove_duplicates(&mut self) {
        self.types.sort_unstable();
        self.types.dedup();
        self.sorted = true;
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub fn types(&self) -> &[TypeId] {
        &self.types
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn first(&self) -> Option<TypeId> {
        self.types.first().copied()
    }

    pub fn contains(&self, t: TypeId) -> bool {
        if self.sorted {
            self.types.binary_search(&t).is_ok()
        } else {
            self.types.contains(&t)
        }
    }

    fn normalized_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.sort_and_remove_duplicates();
        copy
    }

    pub fn are_identical(&self, other: &EquivalentTypeSet) -> bool {
        debug_assert!(
            self.sorted && other.sorted,
            "comparing equivalent type sets before normalization"
        );
        if !(self.sorted && other.sorted) {
            return self.normalized_copy().types == other.normalized_copy().types;
        }
        self.types == other.types
    }

    pub fn is_subset_of(&self, other: &EquivalentTypeSet) -> bool {
        debug_assert!(
            self.sorted && other.sorted,
            "comparing equivalent type sets before normalization"
        );
        if !(self.sorted && other.sorted) {
            return self.normalized_copy().is_subset_of(&other.normalized_copy());
        }
        // Both sorted: merge walk
        let mut theirs = other.types.iter();
        'outer: for t in &self.types {
            while let Some(o) = theirs.next() {
                if o == t {
                    continue 'outer;
                }
                if o > t {
                    return false;
                }
            }
            return false;
        }
        true
    }
}

impl FromIterator<TypeId> for EquivalentTypeSet {
    fn from_iter<I: IntoIterator<Item = TypeId>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
