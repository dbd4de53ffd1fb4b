//! Primary-key membership follows identifying relationships.
//!
//! When a relationship becomes identifying its fk columns join the child's primary key.
//! When it stops being identifying they leave, unless another identifying relationship into
//! the same table still maps them. Any table whose primary key changed is queued so its
//! own identifying children can follow. Acyclicity of identifying relationships bounds the
//! queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::anyhow;
use serde::Serialize;

use crate::error::{LibError, Result};
use crate::models::{
    Column, Constraint, ConstraintColumn, ConstraintKind, Database, EntityId, Relationship,
    RelationshipColumn, RelationshipKind, Table,
};
use crate::store::IdGenerator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum PkEffect {
    PrimaryKeyCreated {
        table_id: EntityId,
        constraint_id: EntityId,
    },
    PrimaryKeyColumnAdded {
        table_id: EntityId,
        column_id: EntityId,
        constraint_column_id: EntityId,
    },
    PrimaryKeyColumnRemoved {
        table_id: EntityId,
        column_id: EntityId,
        constraint_column_id: EntityId,
    },
    ForeignKeyColumnCreated {
        table_id: EntityId,
        column_id: EntityId,
        relationship_id: EntityId,
    },
    RelationshipColumnAdded {
        relationship_id: EntityId,
        relationship_column_id: EntityId,
    },
    RelationshipColumnRemoved {
        relationship_id: EntityId,
        relationship_column_id: EntityId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TablePos {
    schema: usize,
    table: usize,
}

#[derive(Debug, Clone, Copy)]
struct RelationshipPos {
    table: TablePos,
    relationship: usize,
}

#[derive(Debug)]
struct PkChange {
    table_id: EntityId,
    added: Vec<EntityId>,
    removed: Vec<EntityId>,
}

impl PkChange {
    fn new(table_id: EntityId) -> Self {
        Self {
            table_id,
            added: Vec::new(),
            removed: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Clone)]
pub struct PkCascade {
    ids: Arc<dyn IdGenerator>,
    primary_key_prefix: String,
}

impl PkCascade {
    pub fn new(ids: Arc<dyn IdGenerator>, primary_key_prefix: impl Into<String>) -> Self {
        Self {
            ids,
            primary_key_prefix: primary_key_prefix.into(),
        }
    }

    /// Applies a kind change to `snapshot` and propagates primary-key membership.
    ///
    /// Every entity created or changed is flagged as affected and gets a provisional id.
    pub fn sync_pk_for_kind_change(
        &self,
        snapshot: &mut Database,
        relationship_id: &EntityId,
        from: RelationshipKind,
        to: RelationshipKind,
    ) -> Result<Vec<PkEffect>> {
        let tables = table_positions(snapshot);
        let relationships = relationship_positions(snapshot);
        let Some(target) = relationships
            .iter()
            .copied()
            .find(|pos| &relationship_at(snapshot, *pos).id == relationship_id)
        else {
            return Err(LibError::not_found(
                "Relationship not found",
                anyhow!("relationship {} missing from snapshot", relationship_id),
            ));
        };

        let mut effects = Vec::new();
        let fk_table_id;
        let fk_columns;
        {
            let table = table_at_mut(snapshot, target.table);
            let relationship = &mut table.relationships[target.relationship];
            if relationship.kind != to {
                relationship.kind = to;
                relationship.is_affected = true;
            }
            fk_table_id = relationship.fk_table_id.clone();
            fk_columns = relationship
                .columns
                .iter()
                .map(|column| column.fk_column_id.clone())
                .collect::<Vec<_>>();
        }
        if from == to {
            return Ok(effects);
        }

        let mut change = PkChange::new(fk_table_id.clone());
        match to {
            RelationshipKind::Identifying => {
                let table = table_at_mut(snapshot, target.table);
                for column_id in fk_columns {
                    if self.add_pk_member(table, &column_id, &mut effects) {
                        change.added.push(column_id);
                    }
                }
            }
            RelationshipKind::NonIdentifying => {
                for column_id in fk_columns {
                    if required_by_identifying(snapshot, &relationships, &fk_table_id, &column_id)
                    {
                        continue;
                    }
                    let table = table_at_mut(snapshot, target.table);
                    if remove_pk_member(table, &column_id, &mut effects) {
                        change.removed.push(column_id);
                    }
                }
            }
        }

        let mut queue = VecDeque::new();
        if !change.is_empty() {
            queue.push_back(change);
        }

        while let Some(change) = queue.pop_front() {
            tracing::debug!(
                table_id = %change.table_id,
                added = change.added.len(),
                removed = change.removed.len(),
                "propagating primary key change"
            );
            let Some(parent_pos) = tables.get(&change.table_id).copied() else {
                continue;
            };
            let children = relationships
                .iter()
                .copied()
                .filter(|pos| {
                    let relationship = relationship_at(snapshot, *pos);
                    relationship.pk_table_id == change.table_id && relationship.is_identifying()
                })
                .collect::<Vec<_>>();

            for child in children {
                let next = self.propagate_to_child(
                    snapshot,
                    &relationships,
                    parent_pos,
                    child,
                    &change,
                    &mut effects,
                );
                if !next.is_empty() {
                    queue.push_back(next);
                }
            }
        }

        Ok(effects)
    }

    fn propagate_to_child(
        &self,
        snapshot: &mut Database,
        relationships: &[RelationshipPos],
        parent_pos: TablePos,
        child: RelationshipPos,
        change: &PkChange,
        effects: &mut Vec<PkEffect>,
    ) -> PkChange {
        let parent_columns: HashMap<EntityId, Column> = table_at(snapshot, parent_pos)
            .columns
            .iter()
            .filter(|column| change.added.contains(&column.id))
            .map(|column| (column.id.clone(), column.clone()))
            .collect();

        let child_table_id = table_at(snapshot, child.table).id.clone();
        let mut next = PkChange::new(child_table_id.clone());

        for pk_column_id in &change.added {
            let table = table_at_mut(snapshot, child.table);
            let existing = table.relationships[child.relationship]
                .columns
                .iter()
                .find(|column| &column.pk_column_id == pk_column_id)
                .map(|column| column.fk_column_id.clone());

            let fk_column_id = match existing {
                Some(fk_column_id) => fk_column_id,
                None => {
                    let Some(parent_column) = parent_columns.get(pk_column_id) else {
                        tracing::debug!(
                            column_id = %pk_column_id,
                            "parent key column not in snapshot; skipping child mapping"
                        );
                        continue;
                    };
                    self.map_parent_column(table, child.relationship, parent_column, effects)
                }
            };

            if self.add_pk_member(table, &fk_column_id, effects) {
                next.added.push(fk_column_id);
            }
        }

        for pk_column_id in &change.removed {
            let unmapped = {
                let table = table_at_mut(snapshot, child.table);
                unmap_parent_column(table, child.relationship, pk_column_id, effects)
            };
            for fk_column_id in unmapped {
                if required_by_identifying(snapshot, relationships, &child_table_id, &fk_column_id)
                {
                    continue;
                }
                let table = table_at_mut(snapshot, child.table);
                if remove_pk_member(table, &fk_column_id, effects) {
                    next.removed.push(fk_column_id);
                }
            }
        }

        next
    }

    /// Maps `parent_column` into the child table, reusing a same-named child column.
    fn map_parent_column(
        &self,
        table: &mut Table,
        relationship_idx: usize,
        parent_column: &Column,
        effects: &mut Vec<PkEffect>,
    ) -> EntityId {
        let relationship_id = table.relationships[relationship_idx].id.clone();
        let reused = table
            .columns
            .iter()
            .find(|column| column.name == parent_column.name)
            .map(|column| column.id.clone());

        let fk_column_id = match reused {
            Some(id) => id,
            None => {
                let id = EntityId::new(self.ids.generate());
                let position = table
                    .columns
                    .iter()
                    .map(|column| column.ordinal_position)
                    .max()
                    .unwrap_or(0)
                    + 1;
                table.columns.push(Column {
                    id: id.clone(),
                    table_id: table.id.clone(),
                    name: parent_column.name.clone(),
                    ordinal_position: position,
                    data_type: parent_column.data_type.clone(),
                    length_scale: parent_column.length_scale.clone(),
                    is_auto_increment: false,
                    comment: None,
                    is_affected: true,
                });
                effects.push(PkEffect::ForeignKeyColumnCreated {
                    table_id: table.id.clone(),
                    column_id: id.clone(),
                    relationship_id: relationship_id.clone(),
                });
                id
            }
        };

        let relationship = &mut table.relationships[relationship_idx];
        let relationship_column_id = EntityId::new(self.ids.generate());
        relationship.columns.push(RelationshipColumn {
            id: relationship_column_id.clone(),
            relationship_id: relationship_id.clone(),
            pk_column_id: parent_column.id.clone(),
            fk_column_id: fk_column_id.clone(),
            seq_no: relationship.columns.len() as u32,
            is_affected: true,
        });
        effects.push(PkEffect::RelationshipColumnAdded {
            relationship_id,
            relationship_column_id,
        });

        fk_column_id
    }

    /// Returns true when the column was not yet part of the primary key.
    fn add_pk_member(
        &self,
        table: &mut Table,
        column_id: &EntityId,
        effects: &mut Vec<PkEffect>,
    ) -> bool {
        let pk_idx = match table
            .constraints
            .iter()
            .position(|constraint| constraint.kind == ConstraintKind::PrimaryKey)
        {
            Some(idx) => idx,
            None => {
                let constraint_id = EntityId::new(self.ids.generate());
                table.constraints.push(Constraint {
                    id: constraint_id.clone(),
                    table_id: table.id.clone(),
                    name: format!("{}{}", self.primary_key_prefix, table.name),
                    kind: ConstraintKind::PrimaryKey,
                    check_expr: None,
                    default_expr: None,
                    is_affected: true,
                    columns: Vec::new(),
                });
                effects.push(PkEffect::PrimaryKeyCreated {
                    table_id: table.id.clone(),
                    constraint_id,
                });
                table.constraints.len() - 1
            }
        };

        let table_id = table.id.clone();
        let primary_key = &mut table.constraints[pk_idx];
        if primary_key
            .columns
            .iter()
            .any(|column| &column.column_id == column_id)
        {
            return false;
        }

        let constraint_column_id = EntityId::new(self.ids.generate());
        primary_key.columns.push(ConstraintColumn {
            id: constraint_column_id.clone(),
            constraint_id: primary_key.id.clone(),
            column_id: column_id.clone(),
            seq_no: primary_key.columns.len() as u32,
            is_affected: true,
        });
        effects.push(PkEffect::PrimaryKeyColumnAdded {
            table_id,
            column_id: column_id.clone(),
            constraint_column_id,
        });
        true
    }
}

/// Returns true when the column was part of the primary key.
fn remove_pk_member(table: &mut Table, column_id: &EntityId, effects: &mut Vec<PkEffect>) -> bool {
    let table_id = table.id.clone();
    let Some(primary_key) = table
        .constraints
        .iter_mut()
        .find(|constraint| constraint.kind == ConstraintKind::PrimaryKey)
    else {
        return false;
    };
    let Some(idx) = primary_key
        .columns
        .iter()
        .position(|column| &column.column_id == column_id)
    else {
        return false;
    };

    let removed = primary_key.columns.remove(idx);
    renumber(primary_key.columns.iter_mut().map(|c| (&mut c.seq_no, &mut c.is_affected)));
    effects.push(PkEffect::PrimaryKeyColumnRemoved {
        table_id,
        column_id: column_id.clone(),
        constraint_column_id: removed.id,
    });
    true
}

/// Drops the relationship columns mapping `pk_column_id` and returns their fk columns.
fn unmap_parent_column(
    table: &mut Table,
    relationship_idx: usize,
    pk_column_id: &EntityId,
    effects: &mut Vec<PkEffect>,
) -> Vec<EntityId> {
    let relationship = &mut table.relationships[relationship_idx];
    let relationship_id = relationship.id.clone();
    let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut relationship.columns)
        .into_iter()
        .partition(|column| &column.pk_column_id == pk_column_id);
    relationship.columns = kept;
    if !removed.is_empty() {
        relationship.is_affected = true;
        renumber(
            relationship
                .columns
                .iter_mut()
                .map(|c| (&mut c.seq_no, &mut c.is_affected)),
        );
    }

    removed
        .into_iter()
        .map(|column| {
            effects.push(PkEffect::RelationshipColumnRemoved {
                relationship_id: relationship_id.clone(),
                relationship_column_id: column.id,
            });
            column.fk_column_id
        })
        .collect()
}

/// Rewrites `seq_no` to 0..n, flagging rows whose number moved.
fn renumber<'a>(rows: impl Iterator<Item = (&'a mut u32, &'a mut bool)>) {
    for (expected, (seq_no, is_affected)) in rows.enumerate() {
        let expected = expected as u32;
        if *seq_no != expected {
            *seq_no = expected;
            *is_affected = true;
        }
    }
}

fn required_by_identifying(
    snapshot: &Database,
    relationships: &[RelationshipPos],
    table_id: &EntityId,
    column_id: &EntityId,
) -> bool {
    relationships.iter().any(|pos| {
        let relationship = relationship_at(snapshot, *pos);
        relationship.is_identifying()
            && &relationship.fk_table_id == table_id
            && relationship
                .columns
                .iter()
                .any(|column| &column.fk_column_id == column_id)
    })
}

fn table_positions(snapshot: &Database) -> HashMap<EntityId, TablePos> {
    let mut positions = HashMap::new();
    for (schema_idx, schema) in snapshot.schemas.iter().enumerate() {
        for (table_idx, table) in schema.tables.iter().enumerate() {
            positions.insert(
                table.id.clone(),
                TablePos {
                    schema: schema_idx,
                    table: table_idx,
                },
            );
        }
    }
    positions
}

fn relationship_positions(snapshot: &Database) -> Vec<RelationshipPos> {
    let mut positions = Vec::new();
    for (schema_idx, schema) in snapshot.schemas.iter().enumerate() {
        for (table_idx, table) in schema.tables.iter().enumerate() {
            for relationship_idx in 0..table.relationships.len() {
                positions.push(RelationshipPos {
                    table: TablePos {
                        schema: schema_idx,
                        table: table_idx,
                    },
                    relationship: relationship_idx,
                });
            }
        }
    }
    positions
}

fn table_at(snapshot: &Database, pos: TablePos) -> &Table {
    &snapshot.schemas[pos.schema].tables[pos.table]
}

fn table_at_mut(snapshot: &mut Database, pos: TablePos) -> &mut Table {
    &mut snapshot.schemas[pos.schema].tables[pos.table]
}

fn relationship_at(snapshot: &Database, pos: RelationshipPos) -> &Relationship {
    &table_at(snapshot, pos.table).relationships[pos.relationship]
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::snapshot::fixtures::{column, database, primary_key, relationship, table};
    use crate::store::UlidGenerator;

    fn cascade() -> PkCascade {
        PkCascade::new(Arc::new(UlidGenerator), "pk_")
    }

    fn pk_members(db: &Database, table_id: &str) -> BTreeSet<String> {
        db.table(&table_id.into())
            .expect("table exists")
            .primary_key_column_ids()
            .into_iter()
            .map(|id| id.to_string())
            .collect()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    /// users(u_id) <- orders(o_id, o_user) <- lines(l_id, l_order, l_user?)
    fn chain() -> Database {
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
        orders.constraints.push(primary_key("pk_orders", "orders", &["o_id"]));
        orders.relationships.push(relationship(
            "r_users_orders",
            "users",
            "orders",
            RelationshipKind::NonIdentifying,
            &[("u_id", "o_user")],
        ));

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

        database(vec![users, orders, lines])
    }

    #[test]
    fn becoming_identifying_adds_fk_columns_to_child_pk() {
        let mut db = chain();
        let effects = cascade()
            .sync_pk_for_kind_change(
                &mut db,
                &"r_users_orders".into(),
                RelationshipKind::NonIdentifying,
                RelationshipKind::Identifying,
            )
            .expect("cascade succeeds");

        assert_eq!(pk_members(&db, "orders"), set(&["o_id", "o_user"]));
        assert!(effects.iter().any(|effect| matches!(
            effect,
            PkEffect::PrimaryKeyColumnAdded { column_id, .. } if column_id.as_str() == "o_user"
        )));
        let relationship = db.relationship(&"r_users_orders".into()).expect("exists");
        assert!(relationship.is_identifying());
        assert!(relationship.is_affected);
    }

    #[test]
    fn pk_growth_propagates_through_identifying_children() {
        let mut db = chain();
        cascade()
            .sync_pk_for_kind_change(
                &mut db,
                &"r_users_orders".into(),
                RelationshipKind::NonIdentifying,
                RelationshipKind::Identifying,
            )
            .expect("cascade succeeds");

        let lines = db.table(&"lines".into()).expect("lines");
        let new_column = lines
            .columns
            .iter()
            .find(|column| column.name == "user_id")
            .expect("lines inherits user_id");
        assert!(new_column.is_affected);
        assert_eq!(new_column.ordinal_position, 3);
        assert!(lines.primary_key_column_ids().contains(&new_column.id));

        let rel = &lines.relationships[0];
        let seq_nos = rel.columns.iter().map(|c| c.seq_no).collect::<Vec<_>>();
        assert_eq!(seq_nos, vec![0, 1]);
        assert_eq!(rel.columns[1].pk_column_id.as_str(), "o_user");
        assert_eq!(rel.columns[1].fk_column_id, new_column.id);
    }

    #[test]
    fn toggling_restores_primary_key_membership() {
        let mut db = chain();
        let before_orders = pk_members(&db, "orders");
        let before_lines = pk_members(&db, "lines");
        let cascade = cascade();

        cascade
            .sync_pk_for_kind_change(
                &mut db,
                &"r_orders_lines".into(),
                RelationshipKind::Identifying,
                RelationshipKind::NonIdentifying,
            )
            .expect("to non-identifying");
        assert_eq!(pk_members(&db, "lines"), set(&["l_id"]));

        cascade
            .sync_pk_for_kind_change(
                &mut db,
                &"r_orders_lines".into(),
                RelationshipKind::NonIdentifying,
                RelationshipKind::Identifying,
            )
            .expect("back to identifying");
        assert_eq!(pk_members(&db, "lines"), before_lines);
        assert_eq!(pk_members(&db, "orders"), before_orders);
    }

    #[test]
    fn toggling_restores_membership_two_levels_down() {
        let mut db = chain();
        let cascade = cascade();
        cascade
            .sync_pk_for_kind_change(
                &mut db,
                &"r_users_orders".into(),
                RelationshipKind::NonIdentifying,
                RelationshipKind::Identifying,
            )
            .expect("identifying");
        let orders_pk = pk_members(&db, "orders");
        let lines_pk = pk_members(&db, "lines");

        cascade
            .sync_pk_for_kind_change(
                &mut db,
                &"r_users_orders".into(),
                RelationshipKind::Identifying,
                RelationshipKind::NonIdentifying,
            )
            .expect("non-identifying");
        assert_eq!(pk_members(&db, "orders"), set(&["o_id"]));
        assert_eq!(pk_members(&db, "lines").len(), 2);
        let lines = db.table(&"lines".into()).expect("lines");
        assert_eq!(lines.relationships[0].columns.len(), 1);

        cascade
            .sync_pk_for_kind_change(
                &mut db,
                &"r_users_orders".into(),
                RelationshipKind::NonIdentifying,
                RelationshipKind::Identifying,
            )
            .expect("identifying again");
        assert_eq!(pk_members(&db, "orders"), orders_pk);
        assert_eq!(pk_members(&db, "lines"), lines_pk);
    }

    #[test]
    fn shared_column_stays_in_pk_while_another_identifying_relationship_needs_it() {
        let mut db = chain();
        // A second identifying relationship into `lines` that maps the same fk column.
        let tables = &mut db.schemas[0].tables;
        tables[2].relationships.push(relationship(
            "r_orders_lines_alt",
            "orders",
            "lines",
            RelationshipKind::Identifying,
            &[("o_id", "l_order")],
        ));

        let effects = cascade()
            .sync_pk_for_kind_change(
                &mut db,
                &"r_orders_lines".into(),
                RelationshipKind::Identifying,
                RelationshipKind::NonIdentifying,
            )
            .expect("cascade succeeds");

        assert_eq!(pk_members(&db, "lines"), set(&["l_id", "l_order"]));
        assert!(
            !effects
                .iter()
                .any(|effect| matches!(effect, PkEffect::PrimaryKeyColumnRemoved { .. }))
        );
    }

    /// users -> orders -> lines, all identifying, with lines also keyed directly on users
    /// through the same `l_user` column.
    fn shared_chain() -> Database {
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
        orders
            .constraints
            .push(primary_key("pk_orders", "orders", &["o_id", "o_user"]));
        orders.relationships.push(relationship(
            "r_users_orders",
            "users",
            "orders",
            RelationshipKind::Identifying,
            &[("u_id", "o_user")],
        ));

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
        lines.relationships.push(relationship(
            "r_users_lines",
            "users",
            "lines",
            RelationshipKind::Identifying,
            &[("u_id", "l_user")],
        ));

        database(vec![users, orders, lines])
    }

    #[test]
    fn cascaded_removal_keeps_child_column_another_identifying_relationship_maps() {
        let mut db = shared_chain();
        let effects = cascade()
            .sync_pk_for_kind_change(
                &mut db,
                &"r_users_orders".into(),
                RelationshipKind::Identifying,
                RelationshipKind::NonIdentifying,
            )
            .expect("cascade succeeds");

        assert_eq!(pk_members(&db, "orders"), set(&["o_id"]));
        assert_eq!(pk_members(&db, "lines"), set(&["l_id", "l_order", "l_user"]));

        let removed_mappings = effects
            .iter()
            .filter_map(|effect| match effect {
                PkEffect::RelationshipColumnRemoved {
                    relationship_id,
                    relationship_column_id,
                } => Some((
                    relationship_id.to_string(),
                    relationship_column_id.to_string(),
                )),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(
            removed_mappings,
            vec![(
                "r_orders_lines".to_string(),
                "r_orders_lines-l_user".to_string()
            )]
        );
        assert!(!effects.iter().any(|effect| matches!(
            effect,
            PkEffect::PrimaryKeyColumnRemoved { table_id, .. } if table_id.as_str() == "lines"
        )));

        let lines = db.table(&"lines".into()).expect("lines");
        assert_eq!(lines.relationships[0].columns.len(), 1);
        assert_eq!(lines.relationships[1].columns.len(), 1);
        assert_eq!(lines.relationships[1].columns[0].fk_column_id.as_str(), "l_user");
    }

    #[test]
    fn missing_primary_key_is_created() {
        let mut db = chain();
        db.schemas[0].tables[1].constraints.clear();

        let effects = cascade()
            .sync_pk_for_kind_change(
                &mut db,
                &"r_users_orders".into(),
                RelationshipKind::NonIdentifying,
                RelationshipKind::Identifying,
            )
            .expect("cascade succeeds");

        let orders = db.table(&"orders".into()).expect("orders");
        let pk = orders.primary_key().expect("pk created");
        assert_eq!(pk.name, "pk_orders");
        assert!(pk.is_affected);
        assert!(matches!(effects[0], PkEffect::PrimaryKeyCreated { .. }));
    }

    #[test]
    fn removal_renumbers_remaining_pk_columns() {
        let mut db = chain();
        // Put the fk column first so removing it shifts `l_id`.
        db.schemas[0].tables[2].constraints[0] =
            primary_key("pk_lines", "lines", &["l_order", "l_id"]);

        cascade()
            .sync_pk_for_kind_change(
                &mut db,
                &"r_orders_lines".into(),
                RelationshipKind::Identifying,
                RelationshipKind::NonIdentifying,
            )
            .expect("cascade succeeds");

        let pk = db
            .table(&"lines".into())
            .and_then(|t| t.primary_key())
            .expect("pk");
        assert_eq!(pk.columns.len(), 1);
        assert_eq!(pk.columns[0].seq_no, 0);
        assert!(pk.columns[0].is_affected);
    }

    #[test]
    fn unknown_relationship_is_not_found() {
        let mut db = chain();
        let err = cascade()
            .sync_pk_for_kind_change(
                &mut db,
                &"nope".into(),
                RelationshipKind::NonIdentifying,
                RelationshipKind::Identifying,
            )
            .expect_err("missing relationship");
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn same_kind_is_a_no_op() {
        let mut db = chain();
        let original = db.clone();
        let effects = cascade()
            .sync_pk_for_kind_change(
                &mut db,
                &"r_orders_lines".into(),
                RelationshipKind::Identifying,
                RelationshipKind::Identifying,
            )
            .expect("no-op");
        assert!(effects.is_empty());
        assert_eq!(db, original);
    }
}
