//! Object shapes and property names
//!
//! Objects start at the root type and move along transition edges as
//! properties are added, so objects built the same way share a type and a
//! slot layout.

use super::value::{PropertyId, TypeId};
use rustc_hash::FxHashMap as HashMap;
use string_interner::{DefaultStringInterner, DefaultSymbol, Symbol};

/// A shape: ordered property list and outgoing transitions
#[derive(Debug, Clone)]
pub struct RuntimeType {
    pub id: TypeId,
    pub parent: Option<TypeId>,
    /// Property stored in each slot
    pub properties: Vec<PropertyId>,
    transitions: HashMap<PropertyId, TypeId>,
}

impl RuntimeType {
    pub fn slot_of(&self, prop: PropertyId) -> Option<u32> {
        self.properties.iter().position(|p| *p == prop).map(|i| i as u32)
    }

    pub fn slot_count(&self) -> u32 {
        self.properties.len() as u32
    }
}

/// All shapes created so far
#[derive(Debug)]
pub struct TypeRegistry {
    types: Vec<RuntimeType>,
}

impl TypeRegistry {
    /// Type of a freshly created empty object
    pub const ROOT: TypeId = TypeId(0);

    pub fn new() -> Self {
        Self {
            types: vec![RuntimeType {
                id: Self::ROOT,
                parent: None,
                properties: Vec::new(),
                transitions: HashMap::default(),
            }],
        }
    }

    pub fn get(&self, id: TypeId) -> Option<&RuntimeType> {
        self.types.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn slot_of(&self, id: TypeId, prop: PropertyId) -> Option<u32> {
        self.get(id).and_then(|t| t.slot_of(prop))
    }

    /// Type reached by adding `prop` to an object of type `from`
    pub fn transition(&mut self, from: TypeId, prop: PropertyId) -> TypeId {
        if let Some(next) = self.types[from.0 as usize].transitions.get(&prop) {
            return *next;
        }
        let id = TypeId(self.types.len() as u32);
        let mut properties = self.types[from.0 as usize].properties.clone();
        properties.push(prop);
        self.types.push(RuntimeType {
            id,
            parent: Some(from),
            properties,
            transitions: HashMap::default(),
        });
        self.types[from.0 as usize].transitions.insert(prop, id);
        tracing::trace!(from = from.0, to = id.0, prop = prop.0, "type transition");
        id
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Property-name interner
#[derive(Debug, Default)]
pub struct PropertyNames {
    interner: DefaultStringInterner,
}

impl PropertyNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, name: &str) -> PropertyId {
        PropertyId(self.interner.get_or_intern(name).to_usize() as u32)
    }

    pub fn lookup(&self, name: &str) -> Option<PropertyId> {
        self.interner.get(name).map(|s| PropertyId(s.to_usize() as u32))
    }

    pub fn resolve(&self, id: PropertyId) -> &str {
        DefaultSymbol::try_from_usize(id.0 as usize)
            .and_then(|s| self.interner.resolve(s))
            .unwrap_or("<unknown>")
    }
}
