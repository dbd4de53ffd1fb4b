use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::cascade::PkCascade;
use crate::config::EngineConfig;
use crate::diff::diff;
use crate::error::{LibError, Result};
use crate::invariants::{
    ensure_position_in_range, ensure_relationship_column_unique, ensure_snapshot_invariants,
    validate_kind_change,
};
use crate::models::{
    Cardinality, Column, Constraint, ConstraintColumn, Database, Entity, EntityId, EntityType,
    IdMappings, Index, IndexColumn, PersistedId, PropagationSource, PropagationSummary,
    Relationship, RelationshipColumn, RelationshipKind, Table,
};
use crate::persist::{persist_newly_affected, save_touched, soft_delete_removed};
use crate::remap::{remap_references, rewrite};
use crate::snapshot::{SnapshotIndex, walk};
use crate::store::{EntityStore, EntityTransaction, IdGenerator};
use crate::validator::StructuralValidator;

/// A structural edit of one schema.
///
/// Create commands carry the new entity with a provisional id. Every other command names
/// the entity it changes by its current id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum MutationCommand {
    CreateTable {
        table: Table,
    },
    RenameTable {
        table_id: EntityId,
        name: String,
    },
    DeleteTable {
        table_id: EntityId,
    },
    CreateColumn {
        column: Column,
    },
    RenameColumn {
        column_id: EntityId,
        name: String,
    },
    ChangeColumnType {
        column_id: EntityId,
        data_type: String,
        #[serde(default)]
        length_scale: Option<String>,
    },
    ChangeColumnPosition {
        column_id: EntityId,
        position: u32,
    },
    DeleteColumn {
        column_id: EntityId,
    },
    CreateIndex {
        index: Index,
    },
    DeleteIndex {
        index_id: EntityId,
    },
    AddIndexColumn {
        index_column: IndexColumn,
    },
    RemoveIndexColumn {
        index_column_id: EntityId,
    },
    CreateConstraint {
        constraint: Constraint,
    },
    DeleteConstraint {
        constraint_id: EntityId,
    },
    AddConstraintColumn {
        constraint_column: ConstraintColumn,
    },
    RemoveConstraintColumn {
        constraint_column_id: EntityId,
    },
    CreateRelationship {
        relationship: Relationship,
    },
    RenameRelationship {
        relationship_id: EntityId,
        name: String,
    },
    DeleteRelationship {
        relationship_id: EntityId,
    },
    AddRelationshipColumn {
        relationship_column: RelationshipColumn,
    },
    RemoveRelationshipColumn {
        relationship_column_id: EntityId,
    },
    ChangeRelationshipKind {
        relationship_id: EntityId,
        kind: RelationshipKind,
    },
    ChangeRelationshipCardinality {
        relationship_id: EntityId,
        cardinality: Cardinality,
    },
}

impl MutationCommand {
    /// The entity whose change caused everything else in the mutation.
    pub fn source(&self) -> PropagationSource {
        let (source_type, source_id) = self.target();
        PropagationSource {
            source_type,
            source_id: source_id.clone(),
        }
    }

    /// The row a create command writes itself, before any cascaded rows.
    pub fn created_entity(&self) -> Option<Entity> {
        match self {
            MutationCommand::CreateTable { table } => Some(Entity::Table(table.detached())),
            MutationCommand::CreateColumn { column } => Some(Entity::Column(column.clone())),
            MutationCommand::CreateIndex { index } => Some(Entity::Index(index.detached())),
            MutationCommand::AddIndexColumn { index_column } => {
                Some(Entity::IndexColumn(index_column.clone()))
            }
            MutationCommand::CreateConstraint { constraint } => {
                Some(Entity::Constraint(constraint.detached()))
            }
            MutationCommand::AddConstraintColumn { constraint_column } => {
                Some(Entity::ConstraintColumn(constraint_column.clone()))
            }
            MutationCommand::CreateRelationship { relationship } => {
                Some(Entity::Relationship(relationship.detached()))
            }
            MutationCommand::AddRelationshipColumn {
                relationship_column,
            } => Some(Entity::RelationshipColumn(relationship_column.clone())),
            _ => None,
        }
    }

    /// Ids that must exist in the current snapshot for the command to make sense.
    pub fn referenced_ids(&self) -> Vec<(EntityType, &EntityId)> {
        match self.created_entity() {
            Some(_) => self.created_references(),
            None => vec![self.target()],
        }
    }

    fn target(&self) -> (EntityType, &EntityId) {
        match self {
            MutationCommand::RenameTable { table_id, .. }
            | MutationCommand::DeleteTable { table_id } => (EntityType::Table, table_id),
            MutationCommand::RenameColumn { column_id, .. }
            | MutationCommand::ChangeColumnType { column_id, .. }
            | MutationCommand::ChangeColumnPosition { column_id, .. }
            | MutationCommand::DeleteColumn { column_id } => (EntityType::Column, column_id),
            MutationCommand::DeleteIndex { index_id } => (EntityType::Index, index_id),
            MutationCommand::RemoveIndexColumn { index_column_id } => {
                (EntityType::IndexColumn, index_column_id)
            }
            MutationCommand::DeleteConstraint { constraint_id } => {
                (EntityType::Constraint, constraint_id)
            }
            MutationCommand::RemoveConstraintColumn {
                constraint_column_id,
            } => (EntityType::ConstraintColumn, constraint_column_id),
            MutationCommand::RenameRelationship {
                relationship_id, ..
            }
            | MutationCommand::DeleteRelationship { relationship_id }
            | MutationCommand::ChangeRelationshipKind {
                relationship_id, ..
            }
            | MutationCommand::ChangeRelationshipCardinality {
                relationship_id, ..
            } => (EntityType::Relationship, relationship_id),
            MutationCommand::RemoveRelationshipColumn {
                relationship_column_id,
            } => (EntityType::RelationshipColumn, relationship_column_id),
            MutationCommand::CreateTable { table } => (EntityType::Table, &table.id),
            MutationCommand::CreateColumn { column } => (EntityType::Column, &column.id),
            MutationCommand::CreateIndex { index } => (EntityType::Index, &index.id),
            MutationCommand::AddIndexColumn { index_column } => {
                (EntityType::IndexColumn, &index_column.id)
            }
            MutationCommand::CreateConstraint { constraint } => {
                (EntityType::Constraint, &constraint.id)
            }
            MutationCommand::AddConstraintColumn { constraint_column } => {
                (EntityType::ConstraintColumn, &constraint_column.id)
            }
            MutationCommand::CreateRelationship { relationship } => {
                (EntityType::Relationship, &relationship.id)
            }
            MutationCommand::AddRelationshipColumn {
                relationship_column,
            } => (EntityType::RelationshipColumn, &relationship_column.id),
        }
    }

    fn created_references(&self) -> Vec<(EntityType, &EntityId)> {
        match self {
            MutationCommand::CreateTable { table } => vec![(EntityType::Schema, &table.schema_id)],
            MutationCommand::CreateColumn { column } => vec![(EntityType::Table, &column.table_id)],
            MutationCommand::CreateIndex { index } => vec![(EntityType::Table, &index.table_id)],
            MutationCommand::AddIndexColumn { index_column } => vec![
                (EntityType::Index, &index_column.index_id),
                (EntityType::Column, &index_column.column_id),
            ],
            MutationCommand::CreateConstraint { constraint } => {
                vec![(EntityType::Table, &constraint.table_id)]
            }
            MutationCommand::AddConstraintColumn { constraint_column } => vec![
                (EntityType::Constraint, &constraint_column.constraint_id),
                (EntityType::Column, &constraint_column.column_id),
            ],
            MutationCommand::CreateRelationship { relationship } => vec![
                (EntityType::Table, &relationship.pk_table_id),
                (EntityType::Table, &relationship.fk_table_id),
            ],
            MutationCommand::AddRelationshipColumn {
                relationship_column,
            } => vec![
                (EntityType::Relationship, &relationship_column.relationship_id),
                (EntityType::Column, &relationship_column.pk_column_id),
                (EntityType::Column, &relationship_column.fk_column_id),
            ],
            _ => Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MutationCommand::CreateTable { .. } => "create_table",
            MutationCommand::RenameTable { .. } => "rename_table",
            MutationCommand::DeleteTable { .. } => "delete_table",
            MutationCommand::CreateColumn { .. } => "create_column",
            MutationCommand::RenameColumn { .. } => "rename_column",
            MutationCommand::ChangeColumnType { .. } => "change_column_type",
            MutationCommand::ChangeColumnPosition { .. } => "change_column_position",
            MutationCommand::DeleteColumn { .. } => "delete_column",
            MutationCommand::CreateIndex { .. } => "create_index",
            MutationCommand::DeleteIndex { .. } => "delete_index",
            MutationCommand::AddIndexColumn { .. } => "add_index_column",
            MutationCommand::RemoveIndexColumn { .. } => "remove_index_column",
            MutationCommand::CreateConstraint { .. } => "create_constraint",
            MutationCommand::DeleteConstraint { .. } => "delete_constraint",
            MutationCommand::AddConstraintColumn { .. } => "add_constraint_column",
            MutationCommand::RemoveConstraintColumn { .. } => "remove_constraint_column",
            MutationCommand::CreateRelationship { .. } => "create_relationship",
            MutationCommand::RenameRelationship { .. } => "rename_relationship",
            MutationCommand::DeleteRelationship { .. } => "delete_relationship",
            MutationCommand::AddRelationshipColumn { .. } => "add_relationship_column",
            MutationCommand::RemoveRelationshipColumn { .. } => "remove_relationship_column",
            MutationCommand::ChangeRelationshipKind { .. } => "change_relationship_kind",
            MutationCommand::ChangeRelationshipCardinality { .. } => {
                "change_relationship_cardinality"
            }
        }
    }
}

/// Runs mutations end to end: prechecks, validation, cascade, diff, one store transaction,
/// and the id rewrite of the result.
pub struct SchemaMutationEngine<S, V> {
    store: S,
    validator: V,
    cascade: PkCascade,
    config: EngineConfig,
}

impl<S, V> SchemaMutationEngine<S, V>
where
    S: EntityStore,
    V: StructuralValidator,
{
    pub fn new(store: S, validator: V, ids: Arc<dyn IdGenerator>, config: EngineConfig) -> Self {
        let cascade = PkCascade::new(ids, config.primary_key_prefix.clone());
        Self {
            store,
            validator,
            cascade,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn snapshot(&self, schema_id: &EntityId) -> Result<Database> {
        self.store.load_snapshot(schema_id).await
    }

    pub async fn execute(
        &self,
        schema_id: &EntityId,
        command: MutationCommand,
    ) -> Result<PropagationSummary> {
        let operation = command.name();
        match self.execute_inner(schema_id, &command).await {
            Ok(summary) => {
                tracing::info!(
                    schema_id = %schema_id,
                    operation,
                    inserted = summary.id_mappings.len(),
                    removed = summary.removed.len(),
                    "schema mutation committed"
                );
                Ok(summary)
            }
            Err(err) => {
                tracing::warn!(
                    schema_id = %schema_id,
                    operation,
                    kind = ?err.kind,
                    code = err.code,
                    error = %err.source,
                    "schema mutation rejected"
                );
                Err(err)
            }
        }
    }

    async fn execute_inner(
        &self,
        schema_id: &EntityId,
        command: &MutationCommand,
    ) -> Result<PropagationSummary> {
        let current = self.store.load_snapshot(schema_id).await?;
        precheck(&current, command)?;

        let pair = match tokio::time::timeout(
            self.config.validator_timeout,
            self.validator.validate(schema_id, command),
        )
        .await
        {
            Ok(result) => result?,
            Err(elapsed) => {
                return Err(LibError::validator_unavailable(
                    "Schema validation timed out, retry the mutation",
                    anyhow!(
                        "validator exceeded {:?}: {}",
                        self.config.validator_timeout,
                        elapsed
                    ),
                ));
            }
        };
        let before = pair.before;
        let mut after = pair.after;

        if let MutationCommand::ChangeRelationshipKind {
            relationship_id,
            kind,
        } = command
        {
            let from = before
                .relationship(relationship_id)
                .map(|relationship| relationship.kind)
                .ok_or_else(|| {
                    LibError::not_found(
                        "Relationship not found",
                        anyhow!(
                            "validator snapshot is missing relationship {}",
                            relationship_id
                        ),
                    )
                })?;
            let effects = self
                .cascade
                .sync_pk_for_kind_change(&mut after, relationship_id, from, *kind)?;
            tracing::debug!(
                relationship_id = %relationship_id,
                effects = effects.len(),
                "primary key cascade applied"
            );
        }

        ensure_snapshot_invariants(&before, &after)?;

        let created = command.created_entity();
        let created_id = created.as_ref().map(|entity| entity.id().clone());
        let changes = diff(&before, &after, created_id.as_ref());
        let mut source = command.source();
        let mut mappings = IdMappings::default();

        let mut tx = self.store.begin().await?;
        let primary_id = match created {
            Some(entity) => Some(write_primary(&mut tx, &after, entity, &mut mappings).await?),
            None => None,
        };
        if let Some(primary_id) = &primary_id {
            source.source_id = primary_id.to_entity_id();
        }
        let propagated =
            persist_newly_affected(&mut tx, changes.newly_affected, &mut mappings, &source)
                .await?;
        let touched = save_touched(&mut tx, changes.touched, &mappings).await?;
        let deleted = soft_delete_removed(&mut tx, &changes.removed).await?;
        tx.commit().await?;

        tracing::debug!(
            schema_id = %schema_id,
            touched,
            deleted,
            "schema mutation transaction committed"
        );

        Ok(PropagationSummary {
            schema_id: schema_id.clone(),
            source,
            primary_id,
            columns: propagated.columns,
            index_columns: propagated.index_columns,
            constraint_columns: propagated.constraint_columns,
            removed: changes.removed,
            after: rewrite(&after, &mappings),
            id_mappings: mappings,
        })
    }
}

/// Saves the entity a create command names, preferring the validator's version of it.
async fn write_primary<T>(
    tx: &mut T,
    after: &Database,
    requested: Entity,
    mappings: &mut IdMappings,
) -> Result<PersistedId>
where
    T: EntityTransaction,
{
    let entity_type = requested.entity_type();
    let provisional = requested.id().clone();
    let mut entity = walk(after)
        .into_iter()
        .find(|entity| entity.entity_type() == entity_type && entity.id() == &provisional)
        .map(|entity| entity.to_entity())
        .unwrap_or(requested);
    remap_references(&mut entity, mappings);

    let persisted = tx.save(&entity).await?;
    mappings.insert(entity_type, provisional, persisted.clone());
    Ok(persisted)
}

/// Checks that need only the current snapshot, so a bad command never reaches the
/// validator.
fn precheck(current: &Database, command: &MutationCommand) -> Result<()> {
    let index = SnapshotIndex::build(current);
    for (entity_type, id) in command.referenced_ids() {
        if !index.contains_typed(entity_type, id) {
            return Err(LibError::not_found(
                "Referenced entity not found",
                anyhow!("{} {} not found", entity_type, id),
            ));
        }
    }

    if let Some(created) = command.created_entity() {
        if index.contains(created.id()) {
            return Err(LibError::invalid_with_code(
                "entity_exists",
                "Entity already exists",
                anyhow!("{} {} already exists", created.entity_type(), created.id()),
            ));
        }
    }

    match command {
        MutationCommand::ChangeRelationshipKind {
            relationship_id,
            kind,
        } => validate_kind_change(relationship_id, *kind, current.relationships()),
        MutationCommand::CreateRelationship { relationship } => validate_kind_change(
            &relationship.id,
            relationship.kind,
            current.relationships().chain(std::iter::once(relationship)),
        ),
        MutationCommand::AddRelationshipColumn {
            relationship_column,
        } => match index.relationship(&relationship_column.relationship_id) {
            Some(relationship) => {
                ensure_relationship_column_unique(relationship, &relationship_column.fk_column_id)
            }
            None => Ok(()),
        },
        MutationCommand::ChangeColumnPosition {
            column_id,
            position,
        } => {
            let slots = index
                .column(column_id)
                .and_then(|column| index.table(&column.table_id))
                .map(|table| table.columns.len())
                .unwrap_or(0);
            ensure_position_in_range(*position, slots)
        }
        MutationCommand::CreateColumn { column } => {
            let slots = index
                .table(&column.table_id)
                .map(|table| table.columns.len())
                .unwrap_or(0);
            ensure_position_in_range(column.ordinal_position, slots + 1)
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorKind;
    use crate::memory::MemoryStore;
    use crate::models::SnapshotPair;
    use crate::snapshot::fixtures::{column, database, primary_key, relationship, table};
    use crate::store::UlidGenerator;

    /// Returns a prepared pair after an optional delay and counts calls.
    struct FixedValidator {
        pair: SnapshotPair,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl FixedValidator {
        fn new(before: Database, after: Database) -> Self {
            Self {
                pair: SnapshotPair { before, after },
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    impl StructuralValidator for FixedValidator {
        async fn validate(
            &self,
            _schema_id: &EntityId,
            _command: &MutationCommand,
        ) -> Result<SnapshotPair> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.pair.clone())
        }
    }

    fn engine(
        before: &Database,
        validator: FixedValidator,
    ) -> SchemaMutationEngine<MemoryStore, Arc<FixedValidator>> {
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator);
        let store = MemoryStore::seeded(Arc::clone(&ids), before);
        SchemaMutationEngine::new(store, Arc::new(validator), ids, EngineConfig::default())
    }

    fn rank(entity_type: EntityType) -> usize {
        EntityType::SOFT_DELETE_ORDER
            .iter()
            .position(|ty| *ty == entity_type)
            .unwrap_or(usize::MAX)
    }

    /// users(u_id) <- orders(o_id, o_user) with an index and a pk on orders.
    fn shop() -> Database {
        let mut users = table("users", "s1", vec![column("u_id", "users", "user_id", 1)]);
        users.constraints.push(primary_key("pk_users", "users", &["u_id"]));

        let mut orders = table(
            "orders",
            "s1",
            vec![
                column("o_id", "orders", "order_id", 1),
                column("o_user", "orders", "user_id", 2),
            ],
        );
        orders.indexes.push(Index {
            id: "ix_orders_user".into(),
            table_id: "orders".into(),
            name: "ix_orders_user".to_string(),
            index_type: "BTREE".to_string(),
            columns: vec![IndexColumn {
                id: "ix_orders_user-o_user".into(),
                index_id: "ix_orders_user".into(),
                column_id: "o_user".into(),
                ..IndexColumn::default()
            }],
            ..Index::default()
        });
        orders.constraints.push(primary_key("pk_orders", "orders", &["o_id"]));
        orders.relationships.push(relationship(
            "r_users_orders",
            "users",
            "orders",
            RelationshipKind::NonIdentifying,
            &[("u_id", "o_user")],
        ));
        database(vec![users, orders])
    }

    #[test]
    fn commands_deserialize_from_tagged_json() {
        let command: MutationCommand = serde_json::from_value(serde_json::json!({
            "operation": "change_relationship_kind",
            "relationship_id": "r1",
            "kind": "IDENTIFYING"
        }))
        .expect("command should deserialize");

        assert_eq!(
            command,
            MutationCommand::ChangeRelationshipKind {
                relationship_id: "r1".into(),
                kind: RelationshipKind::Identifying,
            }
        );
        assert_eq!(command.source().source_type, EntityType::Relationship);
        assert!(command.created_entity().is_none());
        assert_eq!(command.name(), "change_relationship_kind");
    }

    #[test]
    fn create_commands_require_their_parents() {
        let command = MutationCommand::CreateColumn {
            column: column("tmp-c", "orders", "note", 3),
        };
        assert_eq!(
            command.referenced_ids(),
            vec![(EntityType::Table, &EntityId::from("orders"))]
        );
        assert!(matches!(command.created_entity(), Some(Entity::Column(_))));
    }

    #[tokio::test]
    async fn deleting_a_table_soft_deletes_children_first() {
        let before = shop();
        let after = database(vec![before.schemas[0].tables[0].clone()]);
        let engine = engine(&before, FixedValidator::new(before.clone(), after));

        let summary = engine
            .execute(
                &"s1".into(),
                MutationCommand::DeleteTable {
                    table_id: "orders".into(),
                },
            )
            .await
            .expect("delete should commit");

        let deletions = engine.store().deletions().await;
        assert_eq!(deletions.len(), summary.removed.len());
        assert_eq!(deletions.len(), 9);
        let ranks = deletions
            .iter()
            .map(|(entity_type, _)| rank(*entity_type))
            .collect::<Vec<_>>();
        assert!(ranks.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(
            deletions.last(),
            Some(&(EntityType::Table, EntityId::from("orders")))
        );
        assert!(
            engine
                .store()
                .is_deleted(EntityType::IndexColumn, &"ix_orders_user-o_user".into())
                .await
        );

        let snapshot = engine.snapshot(&"s1".into()).await.expect("snapshot");
        assert_eq!(snapshot.schemas[0].tables.len(), 1);
        assert!(engine.store().insertions().await.is_empty());
    }

    #[tokio::test]
    async fn reverse_identifying_relationship_is_rejected_before_validation() {
        let mut t1 = table("t1", "s1", vec![column("t1_id", "t1", "id", 1)]);
        t1.constraints.push(primary_key("pk_t1", "t1", &["t1_id"]));
        let mut t2 = table(
            "t2",
            "s1",
            vec![column("t2_id", "t2", "id", 1), column("t2_t1", "t2", "t1_id", 2)],
        );
        t2.constraints
            .push(primary_key("pk_t2", "t2", &["t2_id", "t2_t1"]));
        t2.relationships.push(relationship(
            "a",
            "t1",
            "t2",
            RelationshipKind::Identifying,
            &[("t1_id", "t2_t1")],
        ));
        t1.columns.push(column("t1_t2", "t1", "t2_id", 2));
        t1.relationships.push(relationship(
            "b",
            "t2",
            "t1",
            RelationshipKind::NonIdentifying,
            &[("t2_id", "t1_t2")],
        ));
        let before = database(vec![t1, t2]);

        let validator = Arc::new(FixedValidator::new(before.clone(), before.clone()));
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator);
        let engine = SchemaMutationEngine::new(
            MemoryStore::seeded(Arc::clone(&ids), &before),
            Arc::clone(&validator),
            ids,
            EngineConfig::default(),
        );

        let err = engine
            .execute(
                &"s1".into(),
                MutationCommand::ChangeRelationshipKind {
                    relationship_id: "b".into(),
                    kind: RelationshipKind::Identifying,
                },
            )
            .await
            .expect_err("cycle should be rejected");

        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert_eq!(err.code, "cyclic_identifying_reference");
        assert_eq!(validator.calls.load(Ordering::SeqCst), 0);
        assert!(engine.store().insertions().await.is_empty());
    }

    #[tokio::test]
    async fn validator_timeout_aborts_without_writes() {
        let before = shop();
        let mut after = before.clone();
        after.schemas[0].tables[1].columns[1].name = "customer_id".to_string();
        after.schemas[0].tables[1].columns[1].is_affected = true;

        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator);
        let engine = SchemaMutationEngine::new(
            MemoryStore::seeded(Arc::clone(&ids), &before),
            FixedValidator::new(before.clone(), after).slow(Duration::from_millis(500)),
            ids,
            EngineConfig {
                validator_timeout: Duration::from_millis(20),
                ..EngineConfig::default()
            },
        );

        let err = engine
            .execute(
                &"s1".into(),
                MutationCommand::RenameColumn {
                    column_id: "o_user".into(),
                    name: "customer_id".to_string(),
                },
            )
            .await
            .expect_err("validator is too slow");

        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert!(err.is_retryable());
        let snapshot = engine.snapshot(&"s1".into()).await.expect("snapshot");
        assert_eq!(snapshot.schemas[0].tables[1].columns[1].name, "user_id");
    }

    #[tokio::test]
    async fn rename_updates_the_row_in_place() {
        let before = shop();
        let mut after = before.clone();
        after.schemas[0].tables[1].columns[1].name = "customer_id".to_string();
        after.schemas[0].tables[1].columns[1].is_affected = true;
        let engine = engine(&before, FixedValidator::new(before.clone(), after));

        let summary = engine
            .execute(
                &"s1".into(),
                MutationCommand::RenameColumn {
                    column_id: "o_user".into(),
                    name: "customer_id".to_string(),
                },
            )
            .await
            .expect("rename should commit");

        assert!(summary.primary_id.is_none());
        assert!(summary.id_mappings.is_empty());
        let snapshot = engine.snapshot(&"s1".into()).await.expect("snapshot");
        assert_eq!(snapshot.schemas[0].tables[1].columns[1].name, "customer_id");
    }

    #[tokio::test]
    async fn unknown_target_is_not_found() {
        let before = shop();
        let validator = Arc::new(FixedValidator::new(before.clone(), before.clone()));
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator);
        let engine = SchemaMutationEngine::new(
            MemoryStore::seeded(Arc::clone(&ids), &before),
            Arc::clone(&validator),
            ids,
            EngineConfig::default(),
        );

        let err = engine
            .execute(
                &"s1".into(),
                MutationCommand::DeleteColumn {
                    column_id: "missing".into(),
                },
            )
            .await
            .expect_err("unknown column");
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(validator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn out_of_range_position_is_rejected() {
        let before = shop();
        let engine = engine(&before, FixedValidator::new(before.clone(), before.clone()));

        let err = engine
            .execute(
                &"s1".into(),
                MutationCommand::ChangeColumnPosition {
                    column_id: "o_id".into(),
                    position: 3,
                },
            )
            .await
            .expect_err("only two columns");
        assert_eq!(err.code, "position_out_of_range");
    }

    #[tokio::test]
    async fn created_table_and_children_are_persisted_parents_first() {
        let before = shop();
        let mut invoices = table(
            "tmp-invoices",
            "s1",
            vec![
                column("tmp-inv-id", "tmp-invoices", "invoice_id", 1),
                column("tmp-inv-order", "tmp-invoices", "order_id", 2),
            ],
        );
        invoices
            .constraints
            .push(primary_key("tmp-pk", "tmp-invoices", &["tmp-inv-id"]));
        invoices.relationships.push(relationship(
            "tmp-rel",
            "orders",
            "tmp-invoices",
            RelationshipKind::NonIdentifying,
            &[("o_id", "tmp-inv-order")],
        ));
        invoices.is_affected = true;
        for column in &mut invoices.columns {
            column.is_affected = true;
        }
        for constraint in &mut invoices.constraints {
            constraint.is_affected = true;
            for column in &mut constraint.columns {
                column.is_affected = true;
            }
        }
        for relationship in &mut invoices.relationships {
            relationship.is_affected = true;
            for column in &mut relationship.columns {
                column.is_affected = true;
            }
        }
        let mut after = before.clone();
        after.schemas[0].tables.push(invoices.clone());
        let engine = engine(&before, FixedValidator::new(before.clone(), after));

        let summary = engine
            .execute(
                &"s1".into(),
                MutationCommand::CreateTable {
                    table: invoices.detached(),
                },
            )
            .await
            .expect("create should commit");

        let primary_id = summary.primary_id.clone().expect("table persisted");
        let inserted = engine
            .store()
            .insertions()
            .await
            .into_iter()
            .map(|(entity_type, _)| entity_type)
            .collect::<Vec<_>>();
        assert_eq!(
            inserted,
            vec![
                EntityType::Table,
                EntityType::Column,
                EntityType::Column,
                EntityType::Constraint,
                EntityType::ConstraintColumn,
                EntityType::Relationship,
                EntityType::RelationshipColumn,
            ]
        );

        assert_eq!(summary.columns.len(), 2);
        assert!(
            summary
                .columns
                .iter()
                .all(|record| record.parent_id == primary_id.to_entity_id()
                    && record.source_id == primary_id.to_entity_id())
        );
        assert_eq!(summary.source.source_id, primary_id.to_entity_id());
        assert!(
            summary
                .constraint_columns
                .iter()
                .all(|record| record.source_id == primary_id.to_entity_id())
        );
        assert_eq!(summary.constraint_columns.len(), 1);

        let after = summary.after.as_database();
        let stored = after
            .table(&primary_id.to_entity_id())
            .expect("table carries its stored id");
        assert!(walk(after).iter().all(|entity| !entity.id().as_str().starts_with("tmp-")));
        let rel = &stored.relationships[0];
        assert_eq!(rel.fk_table_id, stored.id);
        assert_eq!(rel.columns[0].fk_column_id, stored.columns[1].id);
        assert_eq!(rel.columns[0].pk_column_id.as_str(), "o_id");

        let snapshot = engine.snapshot(&"s1".into()).await.expect("snapshot");
        let persisted = snapshot
            .table(&primary_id.to_entity_id())
            .expect("table stored");
        assert_eq!(persisted.columns.len(), 2);
        assert_eq!(persisted.relationships[0].columns.len(), 1);
    }

    #[tokio::test]
    async fn kind_change_cascades_into_child_primary_keys() {
        let mut before = shop();
        let mut lines = table(
            "lines",
            "s1",
            vec![
                column("l_id", "lines", "line_id", 1),
                column("l_order", "lines", "order_id", 2),
            ],
        );
        lines
            .constraints
            .push(primary_key("pk_lines", "lines", &["l_id", "l_order"]));
        lines.relationships.push(relationship(
            "r_orders_lines",
            "orders",
            "lines",
            RelationshipKind::Identifying,
            &[("o_id", "l_order")],
        ));
        before.schemas[0].tables.push(lines);

        let engine = engine(&before, FixedValidator::new(before.clone(), before.clone()));
        let summary = engine
            .execute(
                &"s1".into(),
                MutationCommand::ChangeRelationshipKind {
                    relationship_id: "r_users_orders".into(),
                    kind: RelationshipKind::Identifying,
                },
            )
            .await
            .expect("kind change should commit");

        assert_eq!(summary.columns.len(), 1);
        assert_eq!(summary.columns[0].parent_id.as_str(), "lines");
        assert_eq!(summary.columns[0].source_type, EntityType::Relationship);
        assert_eq!(summary.columns[0].source_id.as_str(), "r_users_orders");
        assert_eq!(summary.constraint_columns.len(), 2);

        let snapshot = engine.snapshot(&"s1".into()).await.expect("snapshot");
        let orders = snapshot.table(&"orders".into()).expect("orders");
        assert!(
            orders
                .primary_key_column_ids()
                .contains(&EntityId::from("o_user"))
        );
        assert!(
            snapshot
                .relationship(&"r_users_orders".into())
                .expect("relationship")
                .is_identifying()
        );

        let lines = snapshot.table(&"lines".into()).expect("lines");
        let inherited = summary.columns[0].entity_id.to_entity_id();
        assert!(lines.primary_key_column_ids().contains(&inherited));
        let mapping = &lines.relationships[0].columns;
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping[1].fk_column_id, inherited);
        assert_eq!(mapping[1].pk_column_id.as_str(), "o_user");
    }

    #[tokio::test]
    async fn dropping_identifying_kind_soft_deletes_cascaded_key_rows() {
        let mut before = shop();
        {
            let orders = &mut before.schemas[0].tables[1];
            orders.constraints[0] = primary_key("pk_orders", "orders", &["o_id", "o_user"]);
            orders.relationships[0].kind = RelationshipKind::Identifying;
        }
        let mut lines = table(
            "lines",
            "s1",
            vec![
                column("l_id", "lines", "line_id", 1),
                column("l_order", "lines", "order_id", 2),
                column("l_user", "lines", "user_id", 3),
            ],
        );
        lines.constraints.push(primary_key(
            "pk_lines",
            "lines",
            &["l_id", "l_order", "l_user"],
        ));
        lines.relationships.push(relationship(
            "r_orders_lines",
            "orders",
            "lines",
            RelationshipKind::Identifying,
            &[("o_id", "l_order"), ("o_user", "l_user")],
        ));
        before.schemas[0].tables.push(lines);

        let engine = engine(&before, FixedValidator::new(before.clone(), before.clone()));
        let summary = engine
            .execute(
                &"s1".into(),
                MutationCommand::ChangeRelationshipKind {
                    relationship_id: "r_users_orders".into(),
                    kind: RelationshipKind::NonIdentifying,
                },
            )
            .await
            .expect("kind change should commit");

        assert_eq!(
            engine.store().deletions().await,
            vec![
                (
                    EntityType::RelationshipColumn,
                    EntityId::from("r_orders_lines-l_user")
                ),
                (EntityType::ConstraintColumn, EntityId::from("pk_lines-l_user")),
                (EntityType::ConstraintColumn, EntityId::from("pk_orders-o_user")),
            ]
        );
        assert_eq!(summary.removed.len(), 3);
        assert!(engine.store().insertions().await.is_empty());

        let snapshot = engine.snapshot(&"s1".into()).await.expect("snapshot");
        let lines = snapshot.table(&"lines".into()).expect("lines");
        assert_eq!(lines.columns.len(), 3);
        assert_eq!(lines.relationships[0].columns.len(), 1);
        assert_eq!(
            lines.primary_key_column_ids(),
            [EntityId::from("l_id"), EntityId::from("l_order")]
                .iter()
                .collect::<std::collections::BTreeSet<_>>()
        );
        assert!(
            !snapshot
                .relationship(&"r_users_orders".into())
                .expect("relationship")
                .is_identifying()
        );
    }

    #[tokio::test]
    async fn kind_change_needs_the_relationship_in_the_validated_snapshot() {
        let before = shop();
        let mut validated = before.clone();
        validated.schemas[0].tables[1].relationships.clear();
        let engine = engine(&before, FixedValidator::new(validated.clone(), validated));

        let err = engine
            .execute(
                &"s1".into(),
                MutationCommand::ChangeRelationshipKind {
                    relationship_id: "r_users_orders".into(),
                    kind: RelationshipKind::Identifying,
                },
            )
            .await
            .expect_err("validator lost the relationship");

        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(engine.store().insertions().await.is_empty());
        assert!(engine.store().deletions().await.is_empty());
    }
}
