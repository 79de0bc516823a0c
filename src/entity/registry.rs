//! Process-wide descriptor cache.

use std::any::TypeId;
use std::collections::HashMap;

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::RwLock;

use super::{Entity, EntityDescriptor};

type Slot = &'static OnceCell<EntityDescriptor>;

static DESCRIPTORS: Lazy<RwLock<HashMap<TypeId, Slot>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Cached descriptor for `E`, built on first use.
///
/// Each type owns a slot; the map lock only guards slot creation, so a
/// `describe` that asks for another entity's descriptor does not block.
/// Concurrent first use of one type waits on its slot and `E::describe()`
/// runs at most once. Descriptors live for the rest of the process.
pub fn descriptor<E: Entity>() -> &'static EntityDescriptor {
    slot(TypeId::of::<E>()).get_or_init(|| {
        let built = E::describe();
        tracing::debug!(entity = built.type_name, fields = built.fields().len(), "Registered entity descriptor");
        built
    })
}

fn slot(type_id: TypeId) -> Slot {
    let cached = DESCRIPTORS.read().get(&type_id).copied();
    if let Some(found) = cached {
        return found;
    }
    *DESCRIPTORS
        .write()
        .entry(type_id)
        .or_insert_with(|| Box::leak(Box::new(OnceCell::new())))
}

/// Number of entity types registered so far.
pub fn registered_count() -> usize {
    DESCRIPTORS.read().values().filter(|slot| slot.get().is_some()).count()
}
