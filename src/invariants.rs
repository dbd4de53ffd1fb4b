use std::collections::{BTreeSet, HashSet};

use anyhow::anyhow;
use serde::Serialize;

use crate::algorithms::{has_cycle, identifying_adjacency, path_exists};
use crate::error::{LibError, Result};
use crate::models::{Database, EntityId, EntityType, Relationship, RelationshipKind};
use crate::snapshot::{EntityRef, SnapshotIndex};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchemaInvariantViolation {
    UnknownReference {
        entity_type: EntityType,
        entity_id: EntityId,
        referenced_type: EntityType,
        missing_id: EntityId,
    },
    ParentMismatch {
        entity_type: EntityType,
        entity_id: EntityId,
        expected_parent_id: EntityId,
        actual_parent_id: EntityId,
    },
    NonContiguousSeqNo {
        relationship_id: EntityId,
        seq_nos: Vec<u32>,
    },
    DuplicateRelationshipColumn {
        relationship_id: EntityId,
        fk_column_id: EntityId,
    },
    SelfReferencingIdentifying {
        relationship_id: EntityId,
    },
    IdentifyingCycle,
    ForeignKeyNotInPrimaryKey {
        relationship_id: EntityId,
        column_id: EntityId,
    },
}

impl SchemaInvariantViolation {
    pub const fn error_code(&self) -> &'static str {
        match self {
            SchemaInvariantViolation::UnknownReference { .. } => "schema_unknown_reference",
            SchemaInvariantViolation::ParentMismatch { .. } => "schema_parent_mismatch",
            SchemaInvariantViolation::NonContiguousSeqNo { .. } => {
                "relationship_seq_no_not_contiguous"
            }
            SchemaInvariantViolation::DuplicateRelationshipColumn { .. } => {
                "relationship_column_duplicate"
            }
            SchemaInvariantViolation::SelfReferencingIdentifying { .. }
            | SchemaInvariantViolation::IdentifyingCycle => "cyclic_identifying_reference",
            SchemaInvariantViolation::ForeignKeyNotInPrimaryKey { .. } => {
                "identifying_fk_not_in_primary_key"
            }
        }
    }

    pub const fn public_message(&self) -> &'static str {
        match self {
            SchemaInvariantViolation::UnknownReference { .. } => {
                "Entity references something that does not exist"
            }
            SchemaInvariantViolation::ParentMismatch { .. } => {
                "Entity parent does not match its position in the schema"
            }
            SchemaInvariantViolation::NonContiguousSeqNo { .. } => {
                "Relationship column sequence numbers must be contiguous from zero"
            }
            SchemaInvariantViolation::DuplicateRelationshipColumn { .. } => {
                "A column can only be mapped once per relationship"
            }
            SchemaInvariantViolation::SelfReferencingIdentifying { .. } => {
                "A self-referencing relationship cannot be identifying"
            }
            SchemaInvariantViolation::IdentifyingCycle => {
                "Identifying relationships cannot form a cycle"
            }
            SchemaInvariantViolation::ForeignKeyNotInPrimaryKey { .. } => {
                "Identifying relationship columns must be part of the child primary key"
            }
        }
    }
}

/// Rejects a kind change that would close a cycle of identifying relationships.
///
/// `relationships` is every relationship of the schema in its current state. The target's
/// own edge is taken from `target_kind`, not from its current kind.
pub fn validate_kind_change<'a, I>(
    relationship_id: &EntityId,
    target_kind: RelationshipKind,
    relationships: I,
) -> Result<()>
where
    I: IntoIterator<Item = &'a Relationship>,
{
    let relationships = relationships.into_iter().collect::<Vec<_>>();
    let Some(target) = relationships
        .iter()
        .copied()
        .find(|relationship| &relationship.id == relationship_id)
    else {
        return Err(LibError::not_found(
            "Relationship not found",
            anyhow!("relationship {} not found in schema", relationship_id),
        ));
    };

    if target_kind == RelationshipKind::NonIdentifying {
        return Ok(());
    }

    if target.is_self_referencing() {
        return Err(LibError::cyclic_reference(anyhow!(
            "relationship {} references table {} from itself",
            relationship_id,
            target.pk_table_id
        )));
    }

    let mut adjacency = identifying_adjacency(
        relationships
            .iter()
            .copied()
            .filter(|relationship| &relationship.id != relationship_id),
    );
    adjacency.entry(&target.pk_table_id).or_default();
    adjacency
        .entry(&target.fk_table_id)
        .or_default()
        .push(&target.pk_table_id);

    if path_exists(&adjacency, &target.pk_table_id, &target.fk_table_id) {
        return Err(LibError::cyclic_reference(anyhow!(
            "making relationship {} identifying closes a cycle through table {}",
            relationship_id,
            target.fk_table_id
        )));
    }

    Ok(())
}

/// Checks the invariants that must hold in `after` before anything is written.
///
/// References are resolved against `after` and `before` together, since the validator may
/// leave untouched entities out of `after`.
pub fn snapshot_invariant_violations(
    before: &Database,
    after: &Database,
) -> Vec<SchemaInvariantViolation> {
    let before_index = SnapshotIndex::build(before);
    let after_index = SnapshotIndex::build(after);
    let mut violations = Vec::new();

    for entity in after_index.entities() {
        for (referenced_type, referenced_id) in entity.references() {
            if !after_index.contains_typed(referenced_type, referenced_id)
                && !before_index.contains_typed(referenced_type, referenced_id)
            {
                violations.push(SchemaInvariantViolation::UnknownReference {
                    entity_type: entity.entity_type(),
                    entity_id: entity.id().clone(),
                    referenced_type,
                    missing_id: referenced_id.clone(),
                });
            }
        }
    }

    violations.extend(parent_mismatches(after));

    for relationship in after.relationships() {
        let seq_nos = relationship
            .columns
            .iter()
            .map(|column| column.seq_no)
            .collect::<Vec<_>>();
        if !is_contiguous(&seq_nos) {
            violations.push(SchemaInvariantViolation::NonContiguousSeqNo {
                relationship_id: relationship.id.clone(),
                seq_nos,
            });
        }

        let mut seen = HashSet::with_capacity(relationship.columns.len());
        for column in &relationship.columns {
            if !seen.insert(&column.fk_column_id) {
                violations.push(SchemaInvariantViolation::DuplicateRelationshipColumn {
                    relationship_id: relationship.id.clone(),
                    fk_column_id: column.fk_column_id.clone(),
                });
            }
        }

        if relationship.is_identifying() && relationship.is_self_referencing() {
            violations.push(SchemaInvariantViolation::SelfReferencingIdentifying {
                relationship_id: relationship.id.clone(),
            });
        }

        if !(relationship.is_identifying() && relationship.is_affected) {
            continue;
        }
        if let Some(fk_table) = after_index.table(&relationship.fk_table_id) {
            let primary_key = fk_table.primary_key_column_ids();
            for column in &relationship.columns {
                if !primary_key.contains(&column.fk_column_id) {
                    violations.push(SchemaInvariantViolation::ForeignKeyNotInPrimaryKey {
                        relationship_id: relationship.id.clone(),
                        column_id: column.fk_column_id.clone(),
                    });
                }
            }
        }
    }

    let adjacency = identifying_adjacency(
        after
            .relationships()
            .filter(|relationship| !relationship.is_self_referencing()),
    );
    if has_cycle(&adjacency) {
        violations.push(SchemaInvariantViolation::IdentifyingCycle);
    }

    violations
}

pub fn ensure_snapshot_invariants(before: &Database, after: &Database) -> Result<()> {
    let violations = snapshot_invariant_violations(before, after);
    if let Some(first) = violations.first() {
        return Err(LibError::invalid_with_code(
            first.error_code(),
            first.public_message(),
            anyhow!("schema invariant validation failed: {:?}", violations),
        ));
    }

    Ok(())
}

/// `position` is 1-based and may address one slot past the end when inserting.
pub fn ensure_position_in_range(position: u32, slots: usize) -> Result<()> {
    if position == 0 || position as usize > slots {
        return Err(LibError::invalid_with_code(
            "position_out_of_range",
            "Position is out of range",
            anyhow!("position {} outside 1..={}", position, slots),
        ));
    }

    Ok(())
}

pub fn ensure_relationship_column_unique(
    relationship: &Relationship,
    fk_column_id: &EntityId,
) -> Result<()> {
    if relationship
        .columns
        .iter()
        .any(|column| &column.fk_column_id == fk_column_id)
    {
        return Err(LibError::invalid_with_code(
            "relationship_column_duplicate",
            "A column can only be mapped once per relationship",
            anyhow!(
                "column {} already mapped by relationship {}",
                fk_column_id,
                relationship.id
            ),
        ));
    }

    Ok(())
}

fn is_contiguous(seq_nos: &[u32]) -> bool {
    let sorted = seq_nos.iter().copied().collect::<BTreeSet<_>>();
    sorted.len() == seq_nos.len()
        && sorted
            .iter()
            .enumerate()
            .all(|(expected, actual)| expected as u32 == *actual)
}

fn parent_mismatches(database: &Database) -> Vec<SchemaInvariantViolation> {
    let mut violations = Vec::new();
    let mut check = |entity: EntityRef<'_>, expected: &EntityId| {
        let Some(actual) = entity.parent_id() else {
            return;
        };
        if actual != expected {
            violations.push(SchemaInvariantViolation::ParentMismatch {
                entity_type: entity.entity_type(),
                entity_id: entity.id().clone(),
                expected_parent_id: expected.clone(),
                actual_parent_id: actual.clone(),
            });
        }
    };

    for schema in &database.schemas {
        for table in &schema.tables {
            check(EntityRef::Table(table), &schema.id);
            for column in &table.columns {
                check(EntityRef::Column(column), &table.id);
            }
            for index in &table.indexes {
                check(EntityRef::Index(index), &table.id);
                for column in &index.columns {
                    check(EntityRef::IndexColumn(column), &index.id);
                }
            }
            for constraint in &table.constraints {
                check(EntityRef::Constraint(constraint), &table.id);
                for column in &constraint.columns {
                    check(EntityRef::ConstraintColumn(column), &constraint.id);
                }
            }
            for relationship in &table.relationships {
                check(EntityRef::Relationship(relationship), &table.id);
                for column in &relationship.columns {
                    check(EntityRef::RelationshipColumn(column), &relationship.id);
                }
            }
        }
    }

    violations
}
