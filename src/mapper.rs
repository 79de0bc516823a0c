//! Entity ↔ storage record conversion.
//!
//! The write path flattens an entity into ordered `(storage key, value)`
//! pairs. The read path rebuilds an entity from a decoded row or document,
//! coercing each value into its field type and collecting every field that
//! could not be converted instead of failing on the first one.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::entity::{Entity, EntityDescriptor, FieldDescriptor, descriptor};
use crate::error::{CoercionIssue, StoreError, StoreResult};
use crate::value::Value;

/// How the read path treats values that do not fit their field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoercionPolicy {
    /// Leave the field at its zero value and log the issues.
    #[default]
    Lenient,
    /// Fail the read with [`StoreError::TypeCoercion`].
    Strict,
}

/// An entity rebuilt from a record plus the fields that could not be coerced.
#[derive(Debug, Clone)]
pub struct Mapped<E> {
    pub entity: E,
    pub issues: Vec<CoercionIssue>,
}

/// Values the store generated for an entity and wrote back onto it.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Generated {
    pub id: Value,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Column-level view of an entity type.
#[derive(Debug)]
pub struct EntityMapper<E> {
    descriptor: &'static EntityDescriptor,
    _marker: PhantomData<fn() -> E>,
}

impl<E> Clone for EntityMapper<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for EntityMapper<E> {}

impl<E: Entity> Default for EntityMapper<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> EntityMapper<E> {
    pub fn new() -> Self {
        Self {
            descriptor: descriptor::<E>(),
            _marker: PhantomData,
        }
    }

    pub fn descriptor(&self) -> &'static EntityDescriptor {
        self.descriptor
    }

    fn value(entity: &E, field: &FieldDescriptor) -> Value {
        entity.get(field.name).unwrap_or(Value::Null)
    }

    pub fn key_value(&self, entity: &E) -> Value {
        Self::value(entity, self.descriptor.primary_key())
    }

    /// True when the primary key is left for the backend to generate.
    pub fn key_is_generated(&self, entity: &E) -> bool {
        self.descriptor.primary_key().auto_generated && self.key_value(entity).is_unset_key()
    }

    /// Columns written by an insert, in declaration order.
    pub fn insert_columns(&self, entity: &E) -> Vec<(&'static str, Value)> {
        let skip_key = self.key_is_generated(entity);
        self.descriptor
            .fields()
            .iter()
            .filter(|f| !(skip_key && is_primary(self.descriptor, f)))
            .map(|f| (f.key, Self::value(entity, f)))
            .collect()
    }

    /// Columns written by an update: everything except the primary key.
    pub fn update_columns(&self, entity: &E) -> Vec<(&'static str, Value)> {
        self.descriptor
            .fields()
            .iter()
            .filter(|f| !is_primary(self.descriptor, f))
            .map(|f| (f.key, Self::value(entity, f)))
            .collect()
    }

    /// Rebuild an entity from `(storage key, value)` pairs.
    ///
    /// Keys the descriptor does not know are skipped. A value that cannot be
    /// coerced leaves its field at the zero value and is reported in
    /// [`Mapped::issues`].
    pub fn from_record<I, K>(&self, record: I) -> Mapped<E>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let mut entity = E::default();
        let mut issues = Vec::new();

        for (key, value) in record {
            let Some(field) = self.descriptor.field_by_key(key.as_ref()) else {
                continue;
            };
            if let Err(err) = entity.set(field.name, value) {
                issues.push(CoercionIssue {
                    field: field.name.to_string(),
                    message: err.to_string(),
                });
            }
        }

        Mapped { entity, issues }
    }

    /// [`from_record`](Self::from_record) with `policy` applied to the issues.
    pub fn decode<I, K>(&self, record: I, policy: CoercionPolicy) -> StoreResult<E>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let Mapped { entity, issues } = self.from_record(record);
        if issues.is_empty() {
            return Ok(entity);
        }

        match policy {
            CoercionPolicy::Strict => Err(StoreError::TypeCoercion(issues)),
            CoercionPolicy::Lenient => {
                tracing::warn!(
                    entity = self.descriptor.type_name,
                    issues = ?issues,
                    "Fields left at zero value after failed coercion"
                );
                Ok(entity)
            }
        }
    }

    /// Stamp lifecycle timestamps before an insert or upsert.
    ///
    /// The creation timestamp is kept when the caller already set one.
    pub fn stamp_insert(&self, entity: &mut E, now: DateTime<Utc>) -> StoreResult<Generated> {
        let mut generated = Generated {
            id: self.key_value(entity),
            ..Default::default()
        };

        if let Some(created) = self.descriptor.created() {
            let current = Self::value(entity, created);
            if is_unset_timestamp(&current) {
                self.assign(entity, created, Value::Timestamp(now))?;
                generated.created_at = Some(now);
            } else {
                generated.created_at = timestamp_of(&current);
            }
        }
        generated.updated_at = self.stamp_update(entity, now)?;

        Ok(generated)
    }

    /// Stamp the update timestamp, if the entity has one.
    pub fn stamp_update(&self, entity: &mut E, now: DateTime<Utc>) -> StoreResult<Option<DateTime<Utc>>> {
        match self.descriptor.updated() {
            Some(updated) => {
                self.assign(entity, updated, Value::Timestamp(now))?;
                Ok(Some(now))
            }
            None => Ok(None),
        }
    }

    /// Write a generated primary key back onto the entity.
    pub fn apply_key(&self, entity: &mut E, generated: &mut Generated, id: Value) -> StoreResult<()> {
        self.assign(entity, self.descriptor.primary_key(), id)?;
        generated.id = self.key_value(entity);
        Ok(())
    }

    /// Write an existing record's creation timestamp back onto the entity.
    pub fn apply_created(&self, entity: &mut E, generated: &mut Generated, value: Value) -> StoreResult<()> {
        let Some(created) = self.descriptor.created() else {
            return Ok(());
        };
        self.assign(entity, created, value)?;
        generated.created_at = timestamp_of(&Self::value(entity, created));
        Ok(())
    }

    fn assign(&self, entity: &mut E, field: &FieldDescriptor, value: Value) -> StoreResult<()> {
        entity.set(field.name, value).map_err(|err| {
            StoreError::TypeCoercion(vec![CoercionIssue {
                field: field.name.to_string(),
                message: err.to_string(),
            }])
        })
    }
}

fn is_primary(descriptor: &EntityDescriptor, field: &FieldDescriptor) -> bool {
    field.name == descriptor.primary_key().name
}

fn is_unset_timestamp(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Timestamp(t) => *t == DateTime::<Utc>::default(),
        Value::Text(s) => s.is_empty(),
        _ => false,
    }
}

fn timestamp_of(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Timestamp(t) => Some(*t),
        Value::Text(s) => crate::value::parse_timestamp(s),
        _ => None,
    }
}
