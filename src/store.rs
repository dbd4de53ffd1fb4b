use std::future::Future;

use ulid::Ulid;

use crate::error::Result;
use crate::models::{Database, Entity, EntityId, EntityType, PersistedId};

/// Source of fresh identifiers, both provisional and authoritative.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// 26-character, lexicographically sortable ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct UlidGenerator;

impl IdGenerator for UlidGenerator {
    fn generate(&self) -> String {
        Ulid::new().to_string()
    }
}

/// Read side of the persistence ports plus the transaction factory.
pub trait EntityStore: Send + Sync {
    type Tx: EntityTransaction;

    /// Current, non-deleted state of one schema.
    fn load_snapshot(
        &self,
        schema_id: &EntityId,
    ) -> impl Future<Output = Result<Database>> + Send;

    fn begin(&self) -> impl Future<Output = Result<Self::Tx>> + Send;
}

/// Write side of the persistence ports. Dropping a transaction without calling
/// [`EntityTransaction::commit`] discards every write made through it.
pub trait EntityTransaction: Send {
    /// Inserts the row when its id is unknown, assigning a fresh authoritative id, and
    /// updates it in place otherwise. Updating a row that was deleted meanwhile is a
    /// conflict.
    fn save(&mut self, entity: &Entity) -> impl Future<Output = Result<PersistedId>> + Send;

    fn find_by_id_and_not_deleted(
        &mut self,
        entity_type: EntityType,
        id: &EntityId,
    ) -> impl Future<Output = Result<Option<Entity>>> + Send;

    /// Sets the deletion marker. The row stays addressable by id.
    fn mark_deleted(
        &mut self,
        entity_type: EntityType,
        id: &EntityId,
    ) -> impl Future<Output = Result<()>> + Send;

    fn commit(self) -> impl Future<Output = Result<()>> + Send;
}
