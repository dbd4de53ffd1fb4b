use crate::error::Result;
use crate::models::{
    Entity, EntityIdSets, EntityType, IdMappings, PropagationRecord, PropagationSource,
};
use crate::remap::remap_references;
use crate::store::EntityTransaction;

/// Propagation records for the cascaded rows a mutation created, grouped by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagatedRows {
    pub columns: Vec<PropagationRecord>,
    pub index_columns: Vec<PropagationRecord>,
    pub constraint_columns: Vec<PropagationRecord>,
}

/// Saves newly affected entities parents first, keeping traversal order within a kind.
///
/// Each entity's references are rewritten through the mappings collected so far, so a
/// child created in the same mutation points at its parent's stored id.
pub async fn persist_newly_affected<T>(
    tx: &mut T,
    mut entities: Vec<Entity>,
    mappings: &mut IdMappings,
    source: &PropagationSource,
) -> Result<PropagatedRows>
where
    T: EntityTransaction,
{
    entities.sort_by_key(|entity| entity.entity_type().persist_rank());
    let mut rows = PropagatedRows::default();

    for mut entity in entities {
        let entity_type = entity.entity_type();
        let old_id = entity.id().clone();
        remap_references(&mut entity, mappings);

        let persisted = tx.save(&entity).await?;
        tracing::debug!(
            entity_type = %entity_type,
            old_id = %old_id,
            new_id = %persisted,
            "persisted cascaded entity"
        );

        let bucket = match entity_type {
            EntityType::Column => Some(&mut rows.columns),
            EntityType::IndexColumn => Some(&mut rows.index_columns),
            EntityType::ConstraintColumn => Some(&mut rows.constraint_columns),
            _ => None,
        };
        if let (Some(bucket), Some(parent_id)) = (bucket, entity.parent_id()) {
            bucket.push(PropagationRecord {
                entity_id: persisted.clone(),
                parent_id: parent_id.clone(),
                source_type: source.source_type,
                source_id: source.source_id.clone(),
            });
        }

        mappings.insert(entity_type, old_id, persisted);
    }

    Ok(rows)
}

/// Writes in-place field updates of rows that already exist.
pub async fn save_touched<T>(tx: &mut T, entities: Vec<Entity>, mappings: &IdMappings) -> Result<usize>
where
    T: EntityTransaction,
{
    let mut saved = 0;
    for mut entity in entities {
        remap_references(&mut entity, mappings);
        tx.save(&entity).await?;
        saved += 1;
    }
    Ok(saved)
}

/// Marks removed rows deleted, children before parents. Ids that are already gone are
/// skipped, so replaying a removal is harmless.
pub async fn soft_delete_removed<T>(tx: &mut T, removed: &EntityIdSets) -> Result<usize>
where
    T: EntityTransaction,
{
    let mut deleted = 0;
    for entity_type in EntityType::SOFT_DELETE_ORDER {
        let Some(ids) = removed.get(entity_type) else {
            continue;
        };
        for id in ids {
            if tx.find_by_id_and_not_deleted(entity_type, id).await?.is_none() {
                tracing::debug!(entity_type = %entity_type, id = %id, "already deleted");
                continue;
            }
            tx.mark_deleted(entity_type, id).await?;
            deleted += 1;
        }
    }
    Ok(deleted)
}
