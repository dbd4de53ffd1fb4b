//! Transactional in-memory [`EntityStore`].
//!
//! A transaction reads from a private copy of the committed rows and records its writes.
//! On commit the writes are replayed against the current committed state, so a row that
//! another transaction deleted in the meantime surfaces as a conflict.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{LibError, Result};
use crate::models::{
    Constraint, Database, Entity, EntityId, EntityType, Index, PersistedId, Relationship, Schema,
    Table,
};
use crate::snapshot::walk;
use crate::store::{EntityStore, EntityTransaction, IdGenerator};

type RowKey = (EntityType, EntityId);

#[derive(Debug, Clone)]
struct Row {
    entity: Entity,
    deleted_at: Option<DateTime<Utc>>,
    seq: u64,
}

impl Row {
    fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    rows: HashMap<RowKey, Row>,
    next_seq: u64,
    inserted: Vec<(EntityType, PersistedId)>,
    deleted: Vec<(EntityType, EntityId)>,
}

impl MemoryState {
    fn live(&self, entity_type: EntityType, id: &EntityId) -> Option<&Row> {
        self.rows
            .get(&(entity_type, id.clone()))
            .filter(|row| row.is_live())
    }

    fn put(&mut self, entity: Entity) {
        let key = (entity.entity_type(), entity.id().clone());
        let seq = match self.rows.get(&key) {
            Some(row) => row.seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        self.rows.insert(
            key,
            Row {
                entity,
                deleted_at: None,
                seq,
            },
        );
    }

    fn apply(&mut self, write: &Write) -> Result<()> {
        match write {
            Write::Insert(entity) => {
                self.ensure_references(entity)?;
                self.put(entity.clone());
                self.inserted.push((
                    entity.entity_type(),
                    PersistedId::from_store(entity.id().as_str()),
                ));
            }
            Write::Update(entity) => {
                self.ensure_live(entity.entity_type(), entity.id())?;
                self.ensure_references(entity)?;
                self.put(entity.clone());
            }
            Write::Delete(entity_type, id, at) => {
                let key = (*entity_type, id.clone());
                let Some(row) = self.rows.get_mut(&key).filter(|row| row.is_live()) else {
                    return Err(conflict(*entity_type, id));
                };
                row.deleted_at = Some(*at);
                self.deleted.push(key);
            }
        }
        Ok(())
    }

    fn ensure_live(&self, entity_type: EntityType, id: &EntityId) -> Result<()> {
        if self.live(entity_type, id).is_none() {
            return Err(conflict(entity_type, id));
        }
        Ok(())
    }

    fn ensure_references(&self, entity: &Entity) -> Result<()> {
        for (entity_type, id) in entity.references() {
            if self.live(entity_type, id).is_none() {
                return Err(LibError::database(
                    "Referenced entity does not exist",
                    anyhow!(
                        "{} {} references missing {} {}",
                        entity.entity_type(),
                        entity.id(),
                        entity_type,
                        id
                    ),
                ));
            }
        }
        Ok(())
    }

    fn live_of<'a, T: 'a>(
        &'a self,
        select: impl Fn(&'a Entity) -> Option<&'a T>,
    ) -> Vec<(u64, &'a T)> {
        let mut out = self
            .rows
            .values()
            .filter(|row| row.is_live())
            .filter_map(|row| select(&row.entity).map(|value| (row.seq, value)))
            .collect::<Vec<_>>();
        out.sort_by_key(|(seq, _)| *seq);
        out
    }

    /// Rebuilds the nested tree of one schema from live rows.
    fn snapshot(&self, schema_id: &EntityId) -> Result<Database> {
        let Some(Row {
            entity: Entity::Schema(schema),
            ..
        }) = self.live(EntityType::Schema, schema_id)
        else {
            return Err(LibError::not_found(
                "Schema not found",
                anyhow!("schema {} not found", schema_id),
            ));
        };

        let tables = self
            .live_of(|entity| match entity {
                Entity::Table(table) if &table.schema_id == schema_id => Some(table),
                _ => None,
            })
            .into_iter()
            .map(|(_, table)| self.hydrate_table(table))
            .collect();

        Ok(Database {
            id: schema.project_id.clone(),
            schemas: vec![Schema {
                tables,
                ..schema.clone()
            }],
        })
    }

    fn hydrate_table(&self, table: &Table) -> Table {
        let mut out = table.detached();

        out.columns = self
            .live_of(|entity| match entity {
                Entity::Column(column) if column.table_id == table.id => Some(column),
                _ => None,
            })
            .into_iter()
            .map(|(_, column)| column.clone())
            .collect();
        out.columns.sort_by_key(|column| column.ordinal_position);

        out.indexes = self
            .live_of(|entity| match entity {
                Entity::Index(index) if index.table_id == table.id => Some(index),
                _ => None,
            })
            .into_iter()
            .map(|(_, index)| self.hydrate_index(index))
            .collect();

        out.constraints = self
            .live_of(|entity| match entity {
                Entity::Constraint(constraint) if constraint.table_id == table.id => {
                    Some(constraint)
                }
                _ => None,
            })
            .into_iter()
            .map(|(_, constraint)| self.hydrate_constraint(constraint))
            .collect();

        out.relationships = self
            .live_of(|entity| match entity {
                Entity::Relationship(relationship) if relationship.fk_table_id == table.id => {
                    Some(relationship)
                }
                _ => None,
            })
            .into_iter()
            .map(|(_, relationship)| self.hydrate_relationship(relationship))
            .collect();

        out
    }

    fn hydrate_index(&self, index: &Index) -> Index {
        let mut out = index.detached();
        out.columns = self
            .live_of(|entity| match entity {
                Entity::IndexColumn(column) if column.index_id == index.id => Some(column),
                _ => None,
            })
            .into_iter()
            .map(|(_, column)| column.clone())
            .collect();
        out.columns.sort_by_key(|column| column.seq_no);
        out
    }

    fn hydrate_constraint(&self, constraint: &Constraint) -> Constraint {
        let mut out = constraint.detached();
        out.columns = self
            .live_of(|entity| match entity {
                Entity::ConstraintColumn(column) if column.constraint_id == constraint.id => {
                    Some(column)
                }
                _ => None,
            })
            .into_iter()
            .map(|(_, column)| column.clone())
            .collect();
        out.columns.sort_by_key(|column| column.seq_no);
        out
    }

    fn hydrate_relationship(&self, relationship: &Relationship) -> Relationship {
        let mut out = relationship.detached();
        out.columns = self
            .live_of(|entity| match entity {
                Entity::RelationshipColumn(column) if column.relationship_id == relationship.id => {
                    Some(column)
                }
                _ => None,
            })
            .into_iter()
            .map(|(_, column)| column.clone())
            .collect();
        out.columns.sort_by_key(|column| column.seq_no);
        out
    }
}

fn conflict(entity_type: EntityType, id: &EntityId) -> LibError {
    LibError::conflict(
        "The schema changed concurrently, retry the mutation",
        anyhow!("{} {} is missing or deleted", entity_type, id),
    )
}

#[derive(Debug, Clone)]
enum Write {
    Insert(Entity),
    Update(Entity),
    Delete(EntityType, EntityId, DateTime<Utc>),
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    ids: Arc<dyn IdGenerator>,
}

impl MemoryStore {
    pub fn new(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            ids,
        }
    }

    /// A store whose committed state already holds every row of `database`, ids unchanged.
    pub fn seeded(ids: Arc<dyn IdGenerator>, database: &Database) -> Self {
        let mut state = MemoryState::default();
        for entity in walk(database) {
            let mut entity = entity.to_entity();
            entity.set_affected(false);
            state.put(entity);
        }
        Self {
            state: Arc::new(Mutex::new(state)),
            ids,
        }
    }

    /// Rows inserted by committed transactions, in commit order. Seeded rows are excluded.
    pub async fn insertions(&self) -> Vec<(EntityType, PersistedId)> {
        self.state.lock().await.inserted.clone()
    }

    /// Rows soft-deleted by committed transactions, in commit order.
    pub async fn deletions(&self) -> Vec<(EntityType, EntityId)> {
        self.state.lock().await.deleted.clone()
    }

    /// The committed row regardless of its deletion marker.
    pub async fn row(&self, entity_type: EntityType, id: &EntityId) -> Option<Entity> {
        self.state
            .lock()
            .await
            .rows
            .get(&(entity_type, id.clone()))
            .map(|row| row.entity.clone())
    }

    pub async fn is_deleted(&self, entity_type: EntityType, id: &EntityId) -> bool {
        self.state
            .lock()
            .await
            .rows
            .get(&(entity_type, id.clone()))
            .is_some_and(|row| !row.is_live())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl EntityStore for MemoryStore {
    type Tx = MemoryTransaction;

    async fn load_snapshot(&self, schema_id: &EntityId) -> Result<Database> {
        self.state.lock().await.snapshot(schema_id)
    }

    async fn begin(&self) -> Result<MemoryTransaction> {
        let working = self.state.lock().await.clone();
        Ok(MemoryTransaction {
            committed: Arc::clone(&self.state),
            working,
            writes: Vec::new(),
            ids: Arc::clone(&self.ids),
        })
    }
}

pub struct MemoryTransaction {
    committed: Arc<Mutex<MemoryState>>,
    working: MemoryState,
    writes: Vec<Write>,
    ids: Arc<dyn IdGenerator>,
}

impl MemoryTransaction {
    fn record(&mut self, write: Write) -> Result<()> {
        self.working.apply(&write)?;
        self.writes.push(write);
        Ok(())
    }
}

impl EntityTransaction for MemoryTransaction {
    async fn save(&mut self, entity: &Entity) -> Result<PersistedId> {
        let key = (entity.entity_type(), entity.id().clone());
        let mut row = entity.clone();
        row.set_affected(false);
        if self.working.rows.contains_key(&key) {
            self.record(Write::Update(row))?;
            return Ok(PersistedId::from_store(key.1.as_str()));
        }

        let id = self.ids.generate();
        row.set_id(EntityId::new(id.clone()));
        self.record(Write::Insert(row))?;
        Ok(PersistedId::from_store(id))
    }

    async fn find_by_id_and_not_deleted(
        &mut self,
        entity_type: EntityType,
        id: &EntityId,
    ) -> Result<Option<Entity>> {
        Ok(self
            .working
            .live(entity_type, id)
            .map(|row| row.entity.clone()))
    }

    async fn mark_deleted(&mut self, entity_type: EntityType, id: &EntityId) -> Result<()> {
        self.record(Write::Delete(entity_type, id.clone(), Utc::now()))
    }

    async fn commit(self) -> Result<()> {
        let mut committed = self.committed.lock().await;
        let mut next = committed.clone();
        for write in &self.writes {
            next.apply(write)?;
        }
        *committed = next;
        Ok(())
    }
}
