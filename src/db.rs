use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use once_cell::sync::Lazy;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Transaction};

use crate::error::{LibError, Result};
use crate::models::{
    Cardinality, Column, Constraint, ConstraintColumn, ConstraintKind, Database, Entity, EntityId,
    EntityType, Index, IndexColumn, PersistedId, ReferentialAction, Relationship,
    RelationshipColumn, RelationshipKind, Schema, SortDirection, Table,
};
use crate::store::{EntityStore, EntityTransaction, IdGenerator};

pub static MIGRATOR: Lazy<Migrator> = Lazy::new(|| {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
});

pub async fn create_schema_tables(pool: &PgPool) -> std::result::Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

fn db_err(public: &'static str, err: sqlx::Error) -> LibError {
    LibError::database(public, anyhow!(err))
}

fn stored_value_err(column: &'static str, value: &str) -> LibError {
    LibError::database(
        "Stored schema row is malformed",
        anyhow!("unexpected {} value {:?}", column, value),
    )
}

fn conflict(entity_type: EntityType, id: &EntityId) -> LibError {
    LibError::conflict(
        "The schema changed concurrently, retry the mutation",
        anyhow!("{} {} is missing or deleted", entity_type, id),
    )
}

const fn table_name(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Schema => "erd.schemas",
        EntityType::Table => "erd.tables",
        EntityType::Column => "erd.columns",
        EntityType::Index => "erd.indexes",
        EntityType::IndexColumn => "erd.index_columns",
        EntityType::Constraint => "erd.constraints",
        EntityType::ConstraintColumn => "erd.constraint_columns",
        EntityType::Relationship => "erd.relationships",
        EntityType::RelationshipColumn => "erd.relationship_columns",
    }
}

/// A row type of one `erd` table and the model it hydrates into.
trait StoredRow: for<'r> FromRow<'r, PgRow> + Send + Unpin {
    const ENTITY: EntityType;
    const COLUMNS: &'static str;
    type Model;

    fn into_model(self) -> Result<Self::Model>;
}

#[derive(Debug, Clone, FromRow)]
struct SchemaRow {
    id: String,
    project_id: String,
    name: String,
    db_vendor: String,
    charset: Option<String>,
    collation: Option<String>,
}

impl StoredRow for SchemaRow {
    const ENTITY: EntityType = EntityType::Schema;
    const COLUMNS: &'static str = "id, project_id, name, db_vendor, charset, collation";
    type Model = Schema;

    fn into_model(self) -> Result<Schema> {
        Ok(Schema {
            id: self.id.into(),
            project_id: self.project_id.into(),
            name: self.name,
            db_vendor: self.db_vendor,
            charset: self.charset,
            collation: self.collation,
            is_affected: false,
            tables: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct TableRow {
    id: String,
    schema_id: String,
    name: String,
    comment: Option<String>,
}

impl StoredRow for TableRow {
    const ENTITY: EntityType = EntityType::Table;
    const COLUMNS: &'static str = "id, schema_id, name, comment";
    type Model = Table;

    fn into_model(self) -> Result<Table> {
        Ok(Table {
            id: self.id.into(),
            schema_id: self.schema_id.into(),
            name: self.name,
            comment: self.comment,
            ..Table::default()
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct ColumnRow {
    id: String,
    table_id: String,
    name: String,
    ordinal_position: i32,
    data_type: String,
    length_scale: Option<String>,
    is_auto_increment: bool,
    comment: Option<String>,
}

impl StoredRow for ColumnRow {
    const ENTITY: EntityType = EntityType::Column;
    const COLUMNS: &'static str = "id, table_id, name, ordinal_position, data_type, length_scale, is_auto_increment, comment";
    type Model = Column;

    fn into_model(self) -> Result<Column> {
        Ok(Column {
            id: self.id.into(),
            table_id: self.table_id.into(),
            name: self.name,
            ordinal_position: to_u32("ordinal_position", self.ordinal_position)?,
            data_type: self.data_type,
            length_scale: self.length_scale,
            is_auto_increment: self.is_auto_increment,
            comment: self.comment,
            is_affected: false,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct IndexRow {
    id: String,
    table_id: String,
    name: String,
    index_type: String,
}

impl StoredRow for IndexRow {
    const ENTITY: EntityType = EntityType::Index;
    const COLUMNS: &'static str = "id, table_id, name, index_type";
    type Model = Index;

    fn into_model(self) -> Result<Index> {
        Ok(Index {
            id: self.id.into(),
            table_id: self.table_id.into(),
            name: self.name,
            index_type: self.index_type,
            is_affected: false,
            columns: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct IndexColumnRow {
    id: String,
    index_id: String,
    column_id: String,
    seq_no: i32,
    sort_dir: String,
}

impl StoredRow for IndexColumnRow {
    const ENTITY: EntityType = EntityType::IndexColumn;
    const COLUMNS: &'static str = "id, index_id, column_id, seq_no, sort_dir";
    type Model = IndexColumn;

    fn into_model(self) -> Result<IndexColumn> {
        Ok(IndexColumn {
            sort_dir: SortDirection::from_db_value(&self.sort_dir)
                .ok_or_else(|| stored_value_err("sort_dir", &self.sort_dir))?,
            id: self.id.into(),
            index_id: self.index_id.into(),
            column_id: self.column_id.into(),
            seq_no: to_u32("seq_no", self.seq_no)?,
            is_affected: false,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct ConstraintRow {
    id: String,
    table_id: String,
    name: String,
    kind: String,
    check_expr: Option<String>,
    default_expr: Option<String>,
}

impl StoredRow for ConstraintRow {
    const ENTITY: EntityType = EntityType::Constraint;
    const COLUMNS: &'static str = "id, table_id, name, kind, check_expr, default_expr";
    type Model = Constraint;

    fn into_model(self) -> Result<Constraint> {
        Ok(Constraint {
            kind: ConstraintKind::from_db_value(&self.kind)
                .ok_or_else(|| stored_value_err("kind", &self.kind))?,
            id: self.id.into(),
            table_id: self.table_id.into(),
            name: self.name,
            check_expr: self.check_expr,
            default_expr: self.default_expr,
            is_affected: false,
            columns: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct ConstraintColumnRow {
    id: String,
    constraint_id: String,
    column_id: String,
    seq_no: i32,
}

impl StoredRow for ConstraintColumnRow {
    const ENTITY: EntityType = EntityType::ConstraintColumn;
    const COLUMNS: &'static str = "id, constraint_id, column_id, seq_no";
    type Model = ConstraintColumn;

    fn into_model(self) -> Result<ConstraintColumn> {
        Ok(ConstraintColumn {
            id: self.id.into(),
            constraint_id: self.constraint_id.into(),
            column_id: self.column_id.into(),
            seq_no: to_u32("seq_no", self.seq_no)?,
            is_affected: false,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct RelationshipRow {
    id: String,
    pk_table_id: String,
    fk_table_id: String,
    name: String,
    kind: String,
    cardinality: String,
    on_delete: String,
    on_update: String,
    extra: Option<String>,
}

impl StoredRow for RelationshipRow {
    const ENTITY: EntityType = EntityType::Relationship;
    const COLUMNS: &'static str =
        "id, pk_table_id, fk_table_id, name, kind, cardinality, on_delete, on_update, extra";
    type Model = Relationship;

    fn into_model(self) -> Result<Relationship> {
        Ok(Relationship {
            kind: RelationshipKind::from_db_value(&self.kind)
                .ok_or_else(|| stored_value_err("kind", &self.kind))?,
            cardinality: Cardinality::from_db_value(&self.cardinality)
                .ok_or_else(|| stored_value_err("cardinality", &self.cardinality))?,
            on_delete: ReferentialAction::from_db_value(&self.on_delete)
                .ok_or_else(|| stored_value_err("on_delete", &self.on_delete))?,
            on_update: ReferentialAction::from_db_value(&self.on_update)
                .ok_or_else(|| stored_value_err("on_update", &self.on_update))?,
            id: self.id.into(),
            pk_table_id: self.pk_table_id.into(),
            fk_table_id: self.fk_table_id.into(),
            name: self.name,
            extra: self.extra,
            is_affected: false,
            columns: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct RelationshipColumnRow {
    id: String,
    relationship_id: String,
    pk_column_id: String,
    fk_column_id: String,
    seq_no: i32,
}

impl StoredRow for RelationshipColumnRow {
    const ENTITY: EntityType = EntityType::RelationshipColumn;
    const COLUMNS: &'static str = "id, relationship_id, pk_column_id, fk_column_id, seq_no";
    type Model = RelationshipColumn;

    fn into_model(self) -> Result<RelationshipColumn> {
        Ok(RelationshipColumn {
            id: self.id.into(),
            relationship_id: self.relationship_id.into(),
            pk_column_id: self.pk_column_id.into(),
            fk_column_id: self.fk_column_id.into(),
            seq_no: to_u32("seq_no", self.seq_no)?,
            is_affected: false,
        })
    }
}

fn to_u32(column: &'static str, value: i32) -> Result<u32> {
    u32::try_from(value).map_err(|_| stored_value_err(column, &value.to_string()))
}

fn to_i32(value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|err| {
        LibError::invalid(
            "Position or sequence number is too large",
            anyhow!("{} does not fit a database integer: {}", value, err),
        )
    })
}

/// Live rows of `R` whose `filter` column is one of `keys`, oldest first.
async fn fetch_live<R>(conn: &mut PgConnection, filter: &str, keys: Vec<String>) -> Result<Vec<R::Model>>
where
    R: StoredRow,
{
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ANY($1) AND deleted_at IS NULL ORDER BY created_at, id",
        R::COLUMNS,
        table_name(R::ENTITY),
        filter
    );
    let rows = sqlx::query_as::<Postgres, R>(&sql)
        .bind(keys)
        .fetch_all(&mut *conn)
        .await
        .map_err(|err| db_err("Failed to load schema rows", err))?;
    rows.into_iter().map(R::into_model).collect()
}

fn ids_of<'a, I>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a EntityId>,
{
    ids.into_iter().map(|id| id.as_str().to_string()).collect()
}

fn group_by<T, F>(items: Vec<T>, parent: F) -> HashMap<EntityId, Vec<T>>
where
    F: Fn(&T) -> &EntityId,
{
    let mut grouped: HashMap<EntityId, Vec<T>> = HashMap::new();
    for item in items {
        grouped.entry(parent(&item).clone()).or_default().push(item);
    }
    grouped
}

async fn load_schema(conn: &mut PgConnection, schema_id: &EntityId) -> Result<Database> {
    let Some(mut schema) = fetch_live::<SchemaRow>(conn, "id", vec![schema_id.to_string()])
        .await?
        .pop()
    else {
        return Err(LibError::not_found(
            "Schema not found",
            anyhow!("schema {} not found", schema_id),
        ));
    };

    let mut tables = fetch_live::<TableRow>(conn, "schema_id", vec![schema_id.to_string()]).await?;
    let table_ids = ids_of(tables.iter().map(|table| &table.id));

    let columns = fetch_live::<ColumnRow>(conn, "table_id", table_ids.clone()).await?;
    let indexes = fetch_live::<IndexRow>(conn, "table_id", table_ids.clone()).await?;
    let constraints = fetch_live::<ConstraintRow>(conn, "table_id", table_ids.clone()).await?;
    let relationships = fetch_live::<RelationshipRow>(conn, "fk_table_id", table_ids).await?;

    let index_columns = fetch_live::<IndexColumnRow>(
        conn,
        "index_id",
        ids_of(indexes.iter().map(|index| &index.id)),
    )
    .await?;
    let constraint_columns = fetch_live::<ConstraintColumnRow>(
        conn,
        "constraint_id",
        ids_of(constraints.iter().map(|constraint| &constraint.id)),
    )
    .await?;
    let relationship_columns = fetch_live::<RelationshipColumnRow>(
        conn,
        "relationship_id",
        ids_of(relationships.iter().map(|relationship| &relationship.id)),
    )
    .await?;

    let mut columns = group_by(columns, |column| &column.table_id);
    let mut indexes = group_by(indexes, |index| &index.table_id);
    let mut constraints = group_by(constraints, |constraint| &constraint.table_id);
    let mut relationships = group_by(relationships, |relationship| &relationship.fk_table_id);
    let mut index_columns = group_by(index_columns, |column| &column.index_id);
    let mut constraint_columns = group_by(constraint_columns, |column| &column.constraint_id);
    let mut relationship_columns =
        group_by(relationship_columns, |column| &column.relationship_id);

    for table in &mut tables {
        table.columns = columns.remove(&table.id).unwrap_or_default();
        table.columns.sort_by_key(|column| column.ordinal_position);

        table.indexes = indexes.remove(&table.id).unwrap_or_default();
        for index in &mut table.indexes {
            index.columns = index_columns.remove(&index.id).unwrap_or_default();
            index.columns.sort_by_key(|column| column.seq_no);
        }

        table.constraints = constraints.remove(&table.id).unwrap_or_default();
        for constraint in &mut table.constraints {
            constraint.columns = constraint_columns.remove(&constraint.id).unwrap_or_default();
            constraint.columns.sort_by_key(|column| column.seq_no);
        }

        table.relationships = relationships.remove(&table.id).unwrap_or_default();
        for relationship in &mut table.relationships {
            relationship.columns = relationship_columns
                .remove(&relationship.id)
                .unwrap_or_default();
            relationship.columns.sort_by_key(|column| column.seq_no);
        }
    }

    schema.tables = tables;
    Ok(Database {
        id: schema.project_id.clone(),
        schemas: vec![schema],
    })
}

async fn find_live(
    conn: &mut PgConnection,
    entity_type: EntityType,
    id: &EntityId,
) -> Result<Option<Entity>> {
    let keys = vec![id.to_string()];
    let entity = match entity_type {
        EntityType::Schema => fetch_live::<SchemaRow>(conn, "id", keys)
            .await?
            .pop()
            .map(Entity::Schema),
        EntityType::Table => fetch_live::<TableRow>(conn, "id", keys)
            .await?
            .pop()
            .map(Entity::Table),
        EntityType::Column => fetch_live::<ColumnRow>(conn, "id", keys)
            .await?
            .pop()
            .map(Entity::Column),
        EntityType::Index => fetch_live::<IndexRow>(conn, "id", keys)
            .await?
            .pop()
            .map(Entity::Index),
        EntityType::IndexColumn => fetch_live::<IndexColumnRow>(conn, "id", keys)
            .await?
            .pop()
            .map(Entity::IndexColumn),
        EntityType::Constraint => fetch_live::<ConstraintRow>(conn, "id", keys)
            .await?
            .pop()
            .map(Entity::Constraint),
        EntityType::ConstraintColumn => fetch_live::<ConstraintColumnRow>(conn, "id", keys)
            .await?
            .pop()
            .map(Entity::ConstraintColumn),
        EntityType::Relationship => fetch_live::<RelationshipRow>(conn, "id", keys)
            .await?
            .pop()
            .map(Entity::Relationship),
        EntityType::RelationshipColumn => fetch_live::<RelationshipColumnRow>(conn, "id", keys)
            .await?
            .pop()
            .map(Entity::RelationshipColumn),
    };
    Ok(entity)
}

/// Inserts the row or updates it in place. Returns the number of rows written, which is
/// zero when the row exists but is soft-deleted.
async fn upsert(conn: &mut PgConnection, id: &str, entity: &Entity) -> Result<u64> {
    let result = match entity {
        Entity::Schema(schema) => {
            sqlx::query(
                r#"
                INSERT INTO erd.schemas (id, project_id, name, db_vendor, charset, collation)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO UPDATE
                SET project_id = EXCLUDED.project_id,
                    name = EXCLUDED.name,
                    db_vendor = EXCLUDED.db_vendor,
                    charset = EXCLUDED.charset,
                    collation = EXCLUDED.collation,
                    updated_at = now()
                WHERE erd.schemas.deleted_at IS NULL
                "#,
            )
            .bind(id)
            .bind(schema.project_id.as_str())
            .bind(&schema.name)
            .bind(&schema.db_vendor)
            .bind(&schema.charset)
            .bind(&schema.collation)
            .execute(&mut *conn)
            .await
        }
        Entity::Table(table) => {
            sqlx::query(
                r#"
                INSERT INTO erd.tables (id, schema_id, name, comment)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO UPDATE
                SET schema_id = EXCLUDED.schema_id,
                    name = EXCLUDED.name,
                    comment = EXCLUDED.comment,
                    updated_at = now()
                WHERE erd.tables.deleted_at IS NULL
                "#,
            )
            .bind(id)
            .bind(table.schema_id.as_str())
            .bind(&table.name)
            .bind(&table.comment)
            .execute(&mut *conn)
            .await
        }
        Entity::Column(column) => {
            sqlx::query(
                r#"
                INSERT INTO erd.columns (
                    id, table_id, name, ordinal_position, data_type, length_scale,
                    is_auto_increment, comment
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO UPDATE
                SET table_id = EXCLUDED.table_id,
                    name = EXCLUDED.name,
                    ordinal_position = EXCLUDED.ordinal_position,
                    data_type = EXCLUDED.data_type,
                    length_scale = EXCLUDED.length_scale,
                    is_auto_increment = EXCLUDED.is_auto_increment,
                    comment = EXCLUDED.comment,
                    updated_at = now()
                WHERE erd.columns.deleted_at IS NULL
                "#,
            )
            .bind(id)
            .bind(column.table_id.as_str())
            .bind(&column.name)
            .bind(to_i32(column.ordinal_position)?)
            .bind(&column.data_type)
            .bind(&column.length_scale)
            .bind(column.is_auto_increment)
            .bind(&column.comment)
            .execute(&mut *conn)
            .await
        }
        Entity::Index(index) => {
            sqlx::query(
                r#"
                INSERT INTO erd.indexes (id, table_id, name, index_type)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO UPDATE
                SET table_id = EXCLUDED.table_id,
                    name = EXCLUDED.name,
                    index_type = EXCLUDED.index_type,
                    updated_at = now()
                WHERE erd.indexes.deleted_at IS NULL
                "#,
            )
            .bind(id)
            .bind(index.table_id.as_str())
            .bind(&index.name)
            .bind(&index.index_type)
            .execute(&mut *conn)
            .await
        }
        Entity::IndexColumn(column) => {
            sqlx::query(
                r#"
                INSERT INTO erd.index_columns (id, index_id, column_id, seq_no, sort_dir)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO UPDATE
                SET index_id = EXCLUDED.index_id,
                    column_id = EXCLUDED.column_id,
                    seq_no = EXCLUDED.seq_no,
                    sort_dir = EXCLUDED.sort_dir,
                    updated_at = now()
                WHERE erd.index_columns.deleted_at IS NULL
                "#,
            )
            .bind(id)
            .bind(column.index_id.as_str())
            .bind(column.column_id.as_str())
            .bind(to_i32(column.seq_no)?)
            .bind(column.sort_dir.as_db_value())
            .execute(&mut *conn)
            .await
        }
        Entity::Constraint(constraint) => {
            sqlx::query(
                r#"
                INSERT INTO erd.constraints (id, table_id, name, kind, check_expr, default_expr)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO UPDATE
                SET table_id = EXCLUDED.table_id,
                    name = EXCLUDED.name,
                    kind = EXCLUDED.kind,
                    check_expr = EXCLUDED.check_expr,
                    default_expr = EXCLUDED.default_expr,
                    updated_at = now()
                WHERE erd.constraints.deleted_at IS NULL
                "#,
            )
            .bind(id)
            .bind(constraint.table_id.as_str())
            .bind(&constraint.name)
            .bind(constraint.kind.as_db_value())
            .bind(&constraint.check_expr)
            .bind(&constraint.default_expr)
            .execute(&mut *conn)
            .await
        }
        Entity::ConstraintColumn(column) => {
            sqlx::query(
                r#"
                INSERT INTO erd.constraint_columns (id, constraint_id, column_id, seq_no)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO UPDATE
                SET constraint_id = EXCLUDED.constraint_id,
                    column_id = EXCLUDED.column_id,
                    seq_no = EXCLUDED.seq_no,
                    updated_at = now()
                WHERE erd.constraint_columns.deleted_at IS NULL
                "#,
            )
            .bind(id)
            .bind(column.constraint_id.as_str())
            .bind(column.column_id.as_str())
            .bind(to_i32(column.seq_no)?)
            .execute(&mut *conn)
            .await
        }
        Entity::Relationship(relationship) => {
            sqlx::query(
                r#"
                INSERT INTO erd.relationships (
                    id, pk_table_id, fk_table_id, name, kind, cardinality, on_delete,
                    on_update, extra
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (id) DO UPDATE
                SET pk_table_id = EXCLUDED.pk_table_id,
                    fk_table_id = EXCLUDED.fk_table_id,
                    name = EXCLUDED.name,
                    kind = EXCLUDED.kind,
                    cardinality = EXCLUDED.cardinality,
                    on_delete = EXCLUDED.on_delete,
                    on_update = EXCLUDED.on_update,
                    extra = EXCLUDED.extra,
                    updated_at = now()
                WHERE erd.relationships.deleted_at IS NULL
                "#,
            )
            .bind(id)
            .bind(relationship.pk_table_id.as_str())
            .bind(relationship.fk_table_id.as_str())
            .bind(&relationship.name)
            .bind(relationship.kind.as_db_value())
            .bind(relationship.cardinality.as_db_value())
            .bind(relationship.on_delete.as_db_value())
            .bind(relationship.on_update.as_db_value())
            .bind(&relationship.extra)
            .execute(&mut *conn)
            .await
        }
        Entity::RelationshipColumn(column) => {
            sqlx::query(
                r#"
                INSERT INTO erd.relationship_columns (
                    id, relationship_id, pk_column_id, fk_column_id, seq_no
                )
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO UPDATE
                SET relationship_id = EXCLUDED.relationship_id,
                    pk_column_id = EXCLUDED.pk_column_id,
                    fk_column_id = EXCLUDED.fk_column_id,
                    seq_no = EXCLUDED.seq_no,
                    updated_at = now()
                WHERE erd.relationship_columns.deleted_at IS NULL
                "#,
            )
            .bind(id)
            .bind(column.relationship_id.as_str())
            .bind(column.pk_column_id.as_str())
            .bind(column.fk_column_id.as_str())
            .bind(to_i32(column.seq_no)?)
            .execute(&mut *conn)
            .await
        }
    };

    result
        .map(|done| done.rows_affected())
        .map_err(|err| db_err("Failed to write schema row", err))
}

#[derive(Clone)]
pub struct PgEntityStore {
    pool: Arc<PgPool>,
    ids: Arc<dyn IdGenerator>,
}

impl PgEntityStore {
    pub fn new(pool: Arc<PgPool>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { pool, ids }
    }

    pub fn from_pool(pool: &PgPool, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            pool: Arc::new(pool.clone()),
            ids,
        }
    }

    pub fn pool(&self) -> Arc<PgPool> {
        Arc::clone(&self.pool)
    }
}

impl EntityStore for PgEntityStore {
    type Tx = PgEntityTransaction;

    async fn load_snapshot(&self, schema_id: &EntityId) -> Result<Database> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| db_err("Failed to acquire connection", err))?;
        load_schema(&mut conn, schema_id).await
    }

    async fn begin(&self) -> Result<PgEntityTransaction> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|err| db_err("Failed to start transaction", err))?;
        Ok(PgEntityTransaction {
            tx,
            ids: Arc::clone(&self.ids),
        })
    }
}

/// Rolls back on drop unless committed.
pub struct PgEntityTransaction {
    tx: Transaction<'static, Postgres>,
    ids: Arc<dyn IdGenerator>,
}

impl EntityTransaction for PgEntityTransaction {
    async fn save(&mut self, entity: &Entity) -> Result<PersistedId> {
        let entity_type = entity.entity_type();
        let sql = format!(
            "SELECT deleted_at IS NOT NULL FROM {} WHERE id = $1",
            table_name(entity_type)
        );
        let existing: Option<(bool,)> = sqlx::query_as(&sql)
            .bind(entity.id().as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|err| db_err("Failed to query schema row", err))?;

        let id = match existing {
            None => self.ids.generate(),
            Some((true,)) => return Err(conflict(entity_type, entity.id())),
            Some((false,)) => entity.id().as_str().to_string(),
        };

        if upsert(&mut self.tx, &id, entity).await? == 0 {
            return Err(conflict(entity_type, entity.id()));
        }
        Ok(PersistedId::from_store(id))
    }

    async fn find_by_id_and_not_deleted(
        &mut self,
        entity_type: EntityType,
        id: &EntityId,
    ) -> Result<Option<Entity>> {
        find_live(&mut self.tx, entity_type, id).await
    }

    async fn mark_deleted(&mut self, entity_type: EntityType, id: &EntityId) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET deleted_at = now(), updated_at = now() WHERE id = $1 AND deleted_at IS NULL",
            table_name(entity_type)
        );
        let done = sqlx::query(&sql)
            .bind(id.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(|err| db_err("Failed to delete schema row", err))?;
        if done.rows_affected() == 0 {
            return Err(conflict(entity_type, id));
        }
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|err| db_err("Failed to commit transaction", err))
    }
}
