//! Flat views over a nested [`Database`] snapshot.
//!
//! [`walk`] yields every entity in the fixed traversal order used by diffing, persistence
//! and remapping. [`SnapshotIndex`] resolves ids to entities without repeated tree walks.

use std::collections::{BTreeSet, HashMap};

use crate::models::{
    Column, Constraint, ConstraintColumn, Database, Entity, EntityId, EntityIdSets, EntityType,
    Index, IndexColumn, Relationship, RelationshipColumn, Schema, Table,
};

#[derive(Debug, Clone, Copy)]
pub enum EntityRef<'a> {
    Schema(&'a Schema),
    Table(&'a Table),
    Column(&'a Column),
    Index(&'a Index),
    IndexColumn(&'a IndexColumn),
    Constraint(&'a Constraint),
    ConstraintColumn(&'a ConstraintColumn),
    Relationship(&'a Relationship),
    RelationshipColumn(&'a RelationshipColumn),
}

impl<'a> EntityRef<'a> {
    pub const fn entity_type(&self) -> EntityType {
        match *self {
            EntityRef::Schema(_) => EntityType::Schema,
            EntityRef::Table(_) => EntityType::Table,
            EntityRef::Column(_) => EntityType::Column,
            EntityRef::Index(_) => EntityType::Index,
            EntityRef::IndexColumn(_) => EntityType::IndexColumn,
            EntityRef::Constraint(_) => EntityType::Constraint,
            EntityRef::ConstraintColumn(_) => EntityType::ConstraintColumn,
            EntityRef::Relationship(_) => EntityType::Relationship,
            EntityRef::RelationshipColumn(_) => EntityType::RelationshipColumn,
        }
    }

    pub fn id(&self) -> &'a EntityId {
        match *self {
            EntityRef::Schema(e) => &e.id,
            EntityRef::Table(e) => &e.id,
            EntityRef::Column(e) => &e.id,
            EntityRef::Index(e) => &e.id,
            EntityRef::IndexColumn(e) => &e.id,
            EntityRef::Constraint(e) => &e.id,
            EntityRef::ConstraintColumn(e) => &e.id,
            EntityRef::Relationship(e) => &e.id,
            EntityRef::RelationshipColumn(e) => &e.id,
        }
    }

    pub fn is_affected(&self) -> bool {
        match *self {
            EntityRef::Schema(e) => e.is_affected,
            EntityRef::Table(e) => e.is_affected,
            EntityRef::Column(e) => e.is_affected,
            EntityRef::Index(e) => e.is_affected,
            EntityRef::IndexColumn(e) => e.is_affected,
            EntityRef::Constraint(e) => e.is_affected,
            EntityRef::ConstraintColumn(e) => e.is_affected,
            EntityRef::Relationship(e) => e.is_affected,
            EntityRef::RelationshipColumn(e) => e.is_affected,
        }
    }

    pub fn parent_id(&self) -> Option<&'a EntityId> {
        match *self {
            EntityRef::Schema(_) => None,
            EntityRef::Table(e) => Some(&e.schema_id),
            EntityRef::Column(e) => Some(&e.table_id),
            EntityRef::Index(e) => Some(&e.table_id),
            EntityRef::IndexColumn(e) => Some(&e.index_id),
            EntityRef::Constraint(e) => Some(&e.table_id),
            EntityRef::ConstraintColumn(e) => Some(&e.constraint_id),
            EntityRef::Relationship(e) => Some(&e.fk_table_id),
            EntityRef::RelationshipColumn(e) => Some(&e.relationship_id),
        }
    }

    pub fn references(&self) -> Vec<(EntityType, &'a EntityId)> {
        match *self {
            EntityRef::Schema(_) => Vec::new(),
            EntityRef::Table(e) => vec![(EntityType::Schema, &e.schema_id)],
            EntityRef::Column(e) => vec![(EntityType::Table, &e.table_id)],
            EntityRef::Index(e) => vec![(EntityType::Table, &e.table_id)],
            EntityRef::IndexColumn(e) => vec![
                (EntityType::Index, &e.index_id),
                (EntityType::Column, &e.column_id),
            ],
            EntityRef::Constraint(e) => vec![(EntityType::Table, &e.table_id)],
            EntityRef::ConstraintColumn(e) => vec![
                (EntityType::Constraint, &e.constraint_id),
                (EntityType::Column, &e.column_id),
            ],
            EntityRef::Relationship(e) => vec![
                (EntityType::Table, &e.fk_table_id),
                (EntityType::Table, &e.pk_table_id),
            ],
            EntityRef::RelationshipColumn(e) => vec![
                (EntityType::Relationship, &e.relationship_id),
                (EntityType::Column, &e.pk_column_id),
                (EntityType::Column, &e.fk_column_id),
            ],
        }
    }

    /// Owned row without nested children.
    pub fn to_entity(&self) -> Entity {
        match *self {
            EntityRef::Schema(e) => Entity::Schema(e.detached()),
            EntityRef::Table(e) => Entity::Table(e.detached()),
            EntityRef::Column(e) => Entity::Column((*e).clone()),
            EntityRef::Index(e) => Entity::Index(e.detached()),
            EntityRef::IndexColumn(e) => Entity::IndexColumn((*e).clone()),
            EntityRef::Constraint(e) => Entity::Constraint(e.detached()),
            EntityRef::ConstraintColumn(e) => Entity::ConstraintColumn((*e).clone()),
            EntityRef::Relationship(e) => Entity::Relationship(e.detached()),
            EntityRef::RelationshipColumn(e) => Entity::RelationshipColumn((*e).clone()),
        }
    }
}

impl<'a> From<&'a Entity> for EntityRef<'a> {
    fn from(value: &'a Entity) -> Self {
        match value {
            Entity::Schema(e) => EntityRef::Schema(e),
            Entity::Table(e) => EntityRef::Table(e),
            Entity::Column(e) => EntityRef::Column(e),
            Entity::Index(e) => EntityRef::Index(e),
            Entity::IndexColumn(e) => EntityRef::IndexColumn(e),
            Entity::Constraint(e) => EntityRef::Constraint(e),
            Entity::ConstraintColumn(e) => EntityRef::ConstraintColumn(e),
            Entity::Relationship(e) => EntityRef::Relationship(e),
            Entity::RelationshipColumn(e) => EntityRef::RelationshipColumn(e),
        }
    }
}

/// Entities in traversal order: each schema, then per table the table itself, its
/// columns, each index followed by its index columns, each constraint followed by its
/// constraint columns, and each relationship followed by its relationship columns.
pub fn walk(database: &Database) -> Vec<EntityRef<'_>> {
    let mut out = Vec::new();
    for schema in &database.schemas {
        out.push(EntityRef::Schema(schema));
        for table in &schema.tables {
            out.push(EntityRef::Table(table));
            out.extend(table.columns.iter().map(EntityRef::Column));
            for index in &table.indexes {
                out.push(EntityRef::Index(index));
                out.extend(index.columns.iter().map(EntityRef::IndexColumn));
            }
            for constraint in &table.constraints {
                out.push(EntityRef::Constraint(constraint));
                out.extend(constraint.columns.iter().map(EntityRef::ConstraintColumn));
            }
            for relationship in &table.relationships {
                out.push(EntityRef::Relationship(relationship));
                out.extend(
                    relationship
                        .columns
                        .iter()
                        .map(EntityRef::RelationshipColumn),
                );
            }
        }
    }
    out
}

/// Id lookup table built once per snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotIndex<'a> {
    order: Vec<EntityRef<'a>>,
    by_id: HashMap<&'a EntityId, EntityRef<'a>>,
    by_type: EntityIdSets,
}

impl<'a> SnapshotIndex<'a> {
    pub fn build(database: &'a Database) -> Self {
        let order = walk(database);
        let mut by_id = HashMap::with_capacity(order.len());
        let mut by_type = EntityIdSets::default();
        for entity in &order {
            by_id.insert(entity.id(), *entity);
            by_type.insert(entity.entity_type(), entity.id().clone());
        }
        Self {
            order,
            by_id,
            by_type,
        }
    }

    pub fn get(&self, id: &EntityId) -> Option<EntityRef<'a>> {
        self.by_id.get(id).copied()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn contains_typed(&self, entity_type: EntityType, id: &EntityId) -> bool {
        self.by_type.contains(entity_type, id)
    }

    pub fn ids(&self, entity_type: EntityType) -> BTreeSet<EntityId> {
        self.by_type.get(entity_type).cloned().unwrap_or_default()
    }

    pub fn id_sets(&self) -> &EntityIdSets {
        &self.by_type
    }

    pub fn entities(&self) -> &[EntityRef<'a>] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn table(&self, id: &EntityId) -> Option<&'a Table> {
        match self.get(id) {
            Some(EntityRef::Table(table)) => Some(table),
            _ => None,
        }
    }

    pub fn column(&self, id: &EntityId) -> Option<&'a Column> {
        match self.get(id) {
            Some(EntityRef::Column(column)) => Some(column),
            _ => None,
        }
    }

    pub fn relationship(&self, id: &EntityId) -> Option<&'a Relationship> {
        match self.get(id) {
            Some(EntityRef::Relationship(relationship)) => Some(relationship),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::models::*;

    pub fn column(id: &str, table_id: &str, name: &str, position: u32) -> Column {
        Column {
            id: id.into(),
            table_id: table_id.into(),
            name: name.to_string(),
            ordinal_position: position,
            data_type: "BIGINT".to_string(),
            ..Column::default()
        }
    }

    pub fn primary_key(id: &str, table_id: &str, column_ids: &[&str]) -> Constraint {
        Constraint {
            id: id.into(),
            table_id: table_id.into(),
            name: format!("pk_{table_id}"),
            kind: ConstraintKind::PrimaryKey,
            columns: column_ids
                .iter()
                .enumerate()
                .map(|(seq, column_id)| ConstraintColumn {
                    id: format!("{id}-{column_id}").into(),
                    constraint_id: id.into(),
                    column_id: (*column_id).into(),
                    seq_no: seq as u32,
                    is_affected: false,
                })
                .collect(),
            ..Constraint::default()
        }
    }

    pub fn table(id: &str, schema_id: &str, columns: Vec<Column>) -> Table {
        Table {
            id: id.into(),
            schema_id: schema_id.into(),
            name: id.to_string(),
            columns,
            ..Table::default()
        }
    }

    pub fn relationship(
        id: &str,
        pk_table: &str,
        fk_table: &str,
        kind: RelationshipKind,
        pairs: &[(&str, &str)],
    ) -> Relationship {
        Relationship {
            id: id.into(),
            pk_table_id: pk_table.into(),
            fk_table_id: fk_table.into(),
            name: format!("fk_{fk_table}_{pk_table}"),
            kind,
            columns: pairs
                .iter()
                .enumerate()
                .map(|(seq, (pk, fk))| RelationshipColumn {
                    id: format!("{id}-{fk}").into(),
                    relationship_id: id.into(),
                    pk_column_id: (*pk).into(),
                    fk_column_id: (*fk).into(),
                    seq_no: seq as u32,
                    is_affected: false,
                })
                .collect(),
            ..Relationship::default()
        }
    }

    pub fn database(tables: Vec<Table>) -> Database {
        Database {
            id: "project".into(),
            schemas: vec![Schema {
                id: "s1".into(),
                project_id: "project".into(),
                name: "main".to_string(),
                db_vendor: "POSTGRESQL".to_string(),
                tables,
                ..Schema::default()
            }],
        }
    }
}
