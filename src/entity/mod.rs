//! Entity registration.
//!
//! An entity type describes itself once through [`Entity::describe`] (usually
//! generated by `#[derive(Entity)]`). The resulting [`EntityDescriptor`] is
//! cached per type by [`descriptor`] and drives filter translation, row
//! mapping and upsert generation.
//!
//! ```rust,ignore
//! use dbstore::Entity;
//!
//! #[derive(Entity, Default, Clone, Debug)]
//! pub struct Person {
//!     #[store(primary_key, auto)]
//!     pub id: i64,
//!     pub name: String,
//!     #[store(key = "years")]
//!     pub age: i32,
//!     pub created_at: chrono::DateTime<chrono::Utc>,
//!     #[store(ignore)]
//!     pub scratch: String,
//! }
//! ```

pub mod coerce;
mod registry;

pub use coerce::{CoercionError, FromValue, ToValue};
pub use registry::{descriptor, registered_count};

use crate::value::Value;

/// Implemented by every type persisted through a store.
pub trait Entity: Default + Send + Sync + 'static {
    /// Build the field mapping. Called at most once per type; use
    /// [`descriptor`] to obtain the cached value.
    fn describe() -> EntityDescriptor;

    /// Current value of a mapped field, by entity field name.
    fn get(&self, field: &str) -> Option<Value>;

    /// Coerce `value` into the named field.
    fn set(&mut self, field: &str, value: Value) -> Result<(), CoercionError>;
}

/// One mapped field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Rust field name.
    pub name: &'static str,
    /// Column name or document key.
    pub key: &'static str,
    pub primary_key: bool,
    /// The backend generates the key when the value is unset.
    pub auto_generated: bool,
    pub created: bool,
    pub updated: bool,
}

impl FieldDescriptor {
    pub const fn new(name: &'static str, key: &'static str) -> Self {
        Self {
            name,
            key,
            primary_key: false,
            auto_generated: false,
            created: false,
            updated: false,
        }
    }

    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub const fn auto_generated(mut self) -> Self {
        self.auto_generated = true;
        self
    }

    pub const fn created(mut self) -> Self {
        self.created = true;
        self
    }

    pub const fn updated(mut self) -> Self {
        self.updated = true;
        self
    }
}

const CREATED_NAMES: &[&str] = &["created_at", "createdAt", "created"];
const UPDATED_NAMES: &[&str] = &["updated_at", "updatedAt", "updated"];

/// Cached mapping between an entity's fields and storage keys.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub type_name: &'static str,
    fields: Vec<FieldDescriptor>,
    ignored: Vec<&'static str>,
    primary_key: usize,
    created: Option<usize>,
    updated: Option<usize>,
}

impl EntityDescriptor {
    /// Build a descriptor from its mapped fields.
    ///
    /// The primary key is the field marked as such, else the field named
    /// `id`, else the first field. Lifecycle timestamps are the fields marked
    /// `created`/`updated`, else the ones following the naming convention.
    ///
    /// # Panics
    ///
    /// Panics when `fields` is empty; every entity needs a primary key.
    pub fn new(
        type_name: &'static str,
        fields: Vec<FieldDescriptor>,
        ignored: Vec<&'static str>,
    ) -> Self {
        assert!(!fields.is_empty(), "entity `{}` maps no fields", type_name);

        let primary_key = fields
            .iter()
            .position(|f| f.primary_key)
            .or_else(|| fields.iter().position(|f| f.name == "id"))
            .unwrap_or(0);

        let created = fields.iter().position(|f| f.created).or_else(|| {
            fields
                .iter()
                .position(|f| CREATED_NAMES.contains(&f.name))
        });
        let updated = fields.iter().position(|f| f.updated).or_else(|| {
            fields
                .iter()
                .position(|f| UPDATED_NAMES.contains(&f.name))
        });

        Self {
            type_name,
            fields,
            ignored,
            primary_key,
            created,
            updated,
        }
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Fields excluded from storage.
    pub fn ignored(&self) -> &[&'static str] {
        &self.ignored
    }

    pub fn primary_key(&self) -> &FieldDescriptor {
        &self.fields[self.primary_key]
    }

    pub fn created(&self) -> Option<&FieldDescriptor> {
        self.created.map(|i| &self.fields[i])
    }

    pub fn updated(&self) -> Option<&FieldDescriptor> {
        self.updated.map(|i| &self.fields[i])
    }

    /// Look up a field by its Rust name.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up a field by its storage key.
    pub fn field_by_key(&self, key: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.key == key)
    }

    /// Resolve a caller-supplied name (field name or storage key) to a storage key.
    pub fn storage_key(&self, name: &str) -> Option<&'static str> {
        self.field_by_key(name)
            .or_else(|| self.field(name))
            .map(|f| f.key)
    }

    /// Resolve a sort key loosely: exact matches first, then ignoring case
    /// and underscores so `createdAt` finds `created_at`.
    pub fn resolve_sort_key(&self, name: &str) -> Option<&'static str> {
        if let Some(key) = self.storage_key(name) {
            return Some(key);
        }
        let wanted = normalize_name(name);
        self.fields
            .iter()
            .find(|f| normalize_name(f.key) == wanted || normalize_name(f.name) == wanted)
            .map(|f| f.key)
    }

    /// Sort key used when the caller does not pick one.
    pub fn default_sort_key(&self) -> &'static str {
        self.created()
            .map(|f| f.key)
            .unwrap_or_else(|| self.primary_key().key)
    }
}

fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}
