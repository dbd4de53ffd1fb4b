use serde::Serialize;

use crate::models::{Database, Entity, EntityId, EntityIdSets, EntityType};
use crate::snapshot::{EntityRef, SnapshotIndex};

/// What a mutation changed, in traversal order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDiff {
    /// Affected entities whose ids the before-snapshot does not know.
    pub newly_affected: Vec<Entity>,
    /// Affected entities that already existed and whose own fields changed.
    pub touched: Vec<Entity>,
    pub removed: EntityIdSets,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.newly_affected.is_empty() && self.touched.is_empty() && self.removed.is_empty()
    }
}

/// Compares two full snapshots of the same schema.
///
/// `exclude_id` names an entity the caller writes itself (the primary entity of a create
/// command), so it is left out of `newly_affected`.
pub fn diff(before: &Database, after: &Database, exclude_id: Option<&EntityId>) -> SnapshotDiff {
    let before_index = SnapshotIndex::build(before);
    let after_index = SnapshotIndex::build(after);
    let mut out = SnapshotDiff::default();

    for entity in after_index.entities() {
        if !entity.is_affected() {
            continue;
        }
        let id = entity.id();
        match before_index.get(id) {
            None => {
                if exclude_id != Some(id) {
                    out.newly_affected.push(entity.to_entity());
                }
            }
            Some(previous) => {
                if !same_row(previous, *entity) {
                    out.touched.push(entity.to_entity());
                }
            }
        }
    }

    for entity_type in EntityType::PERSIST_ORDER {
        let Some(before_ids) = before_index.id_sets().get(entity_type) else {
            continue;
        };
        for id in before_ids {
            if !after_index.contains_typed(entity_type, id) {
                out.removed.insert(entity_type, id.clone());
            }
        }
    }

    out
}

/// Field equality of two rows, ignoring nested children and the affected flag.
fn same_row(left: EntityRef<'_>, right: EntityRef<'_>) -> bool {
    let mut left = left.to_entity();
    let mut right = right.to_entity();
    left.set_affected(false);
    right.set_affected(false);
    left == right
}
