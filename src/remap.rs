//! Passes snapshot ids through the store-assigned mappings.

use crate::models::{
    AuthoritativeSnapshot, Database, Entity, EntityId, EntityType, IdMappings, Relationship, Table,
};

/// Returns a copy of `snapshot` with every mapped id replaced. Unmapped ids stay as they are.
pub fn rewrite(snapshot: &Database, mappings: &IdMappings) -> AuthoritativeSnapshot {
    let mut out = snapshot.clone();
    for schema in &mut out.schemas {
        remap(&mut schema.id, EntityType::Schema, mappings);
        for table in &mut schema.tables {
            remap_table(table, mappings);
        }
    }
    AuthoritativeSnapshot(out)
}

fn remap_table(table: &mut Table, mappings: &IdMappings) {
    remap(&mut table.id, EntityType::Table, mappings);
    remap(&mut table.schema_id, EntityType::Schema, mappings);

    for column in &mut table.columns {
        remap(&mut column.id, EntityType::Column, mappings);
        remap(&mut column.table_id, EntityType::Table, mappings);
    }
    for index in &mut table.indexes {
        remap(&mut index.id, EntityType::Index, mappings);
        remap(&mut index.table_id, EntityType::Table, mappings);
        for column in &mut index.columns {
            remap(&mut column.id, EntityType::IndexColumn, mappings);
            remap(&mut column.index_id, EntityType::Index, mappings);
            remap(&mut column.column_id, EntityType::Column, mappings);
        }
    }
    for constraint in &mut table.constraints {
        remap(&mut constraint.id, EntityType::Constraint, mappings);
        remap(&mut constraint.table_id, EntityType::Table, mappings);
        for column in &mut constraint.columns {
            remap(&mut column.id, EntityType::ConstraintColumn, mappings);
            remap(&mut column.constraint_id, EntityType::Constraint, mappings);
            remap(&mut column.column_id, EntityType::Column, mappings);
        }
    }
    for relationship in &mut table.relationships {
        remap_relationship(relationship, mappings);
        for column in &mut relationship.columns {
            remap(&mut column.id, EntityType::RelationshipColumn, mappings);
            remap(&mut column.relationship_id, EntityType::Relationship, mappings);
            remap(&mut column.pk_column_id, EntityType::Column, mappings);
            remap(&mut column.fk_column_id, EntityType::Column, mappings);
        }
    }
}

fn remap_relationship(relationship: &mut Relationship, mappings: &IdMappings) {
    remap(&mut relationship.id, EntityType::Relationship, mappings);
    remap(&mut relationship.pk_table_id, EntityType::Table, mappings);
    remap(&mut relationship.fk_table_id, EntityType::Table, mappings);
}

/// Rewrites the foreign fields of a single row. The row's own id is left alone, since the
/// store decides it on save.
pub fn remap_references(entity: &mut Entity, mappings: &IdMappings) {
    match entity {
        Entity::Schema(_) => {}
        Entity::Table(e) => remap(&mut e.schema_id, EntityType::Schema, mappings),
        Entity::Column(e) => remap(&mut e.table_id, EntityType::Table, mappings),
        Entity::Index(e) => remap(&mut e.table_id, EntityType::Table, mappings),
        Entity::IndexColumn(e) => {
            remap(&mut e.index_id, EntityType::Index, mappings);
            remap(&mut e.column_id, EntityType::Column, mappings);
        }
        Entity::Constraint(e) => remap(&mut e.table_id, EntityType::Table, mappings),
        Entity::ConstraintColumn(e) => {
            remap(&mut e.constraint_id, EntityType::Constraint, mappings);
            remap(&mut e.column_id, EntityType::Column, mappings);
        }
        Entity::Relationship(e) => {
            remap(&mut e.pk_table_id, EntityType::Table, mappings);
            remap(&mut e.fk_table_id, EntityType::Table, mappings);
        }
        Entity::RelationshipColumn(e) => {
            remap(&mut e.relationship_id, EntityType::Relationship, mappings);
            remap(&mut e.pk_column_id, EntityType::Column, mappings);
            remap(&mut e.fk_column_id, EntityType::Column, mappings);
        }
    }
}

fn remap(id: &mut EntityId, entity_type: EntityType, mappings: &IdMappings) {
    if let Some(mapped) = mappings.get(entity_type, id) {
        *id = mapped.to_entity_id();
    }
}
