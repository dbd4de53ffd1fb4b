use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::snapshot::EntityRef;

/// Identifier carried by a snapshot entity. It may still be a provisional id handed out by
/// the structural validator or the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier assigned by an [`crate::store::EntityTransaction`] on save. Only stores mint
/// these, so holding one proves the row exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PersistedId(String);

impl PersistedId {
    pub fn from_store(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_entity_id(&self) -> EntityId {
        EntityId(self.0.clone())
    }
}

impl fmt::Display for PersistedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Schema,
    Table,
    Column,
    Index,
    IndexColumn,
    Constraint,
    ConstraintColumn,
    Relationship,
    RelationshipColumn,
}

impl EntityType {
    /// Every kind, parents before children. Cross-table references (relationship to pk
    /// table, relationship column to pk column) also point backwards in this order.
    pub const PERSIST_ORDER: [EntityType; 9] = [
        EntityType::Schema,
        EntityType::Table,
        EntityType::Column,
        EntityType::Index,
        EntityType::IndexColumn,
        EntityType::Constraint,
        EntityType::ConstraintColumn,
        EntityType::Relationship,
        EntityType::RelationshipColumn,
    ];

    pub const SOFT_DELETE_ORDER: [EntityType; 9] = [
        EntityType::RelationshipColumn,
        EntityType::ConstraintColumn,
        EntityType::IndexColumn,
        EntityType::Relationship,
        EntityType::Constraint,
        EntityType::Index,
        EntityType::Column,
        EntityType::Table,
        EntityType::Schema,
    ];

    pub const fn as_db_value(self) -> &'static str {
        match self {
            EntityType::Schema => "SCHEMA",
            EntityType::Table => "TABLE",
            EntityType::Column => "COLUMN",
            EntityType::Index => "INDEX",
            EntityType::IndexColumn => "INDEX_COLUMN",
            EntityType::Constraint => "CONSTRAINT",
            EntityType::ConstraintColumn => "CONSTRAINT_COLUMN",
            EntityType::Relationship => "RELATIONSHIP",
            EntityType::RelationshipColumn => "RELATIONSHIP_COLUMN",
        }
    }

    pub fn persist_rank(self) -> usize {
        Self::PERSIST_ORDER
            .iter()
            .position(|ty| *ty == self)
            .unwrap_or(Self::PERSIST_ORDER.len())
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_value())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipKind {
    Identifying,
    #[default]
    NonIdentifying,
}

impl RelationshipKind {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            RelationshipKind::Identifying => "IDENTIFYING",
            RelationshipKind::NonIdentifying => "NON_IDENTIFYING",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "IDENTIFYING" => Some(RelationshipKind::Identifying),
            "NON_IDENTIFYING" => Some(RelationshipKind::NonIdentifying),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Cardinality {
    OneToOne,
    #[default]
    OneToMany,
}

impl Cardinality {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            Cardinality::OneToOne => "ONE_TO_ONE",
            Cardinality::OneToMany => "ONE_TO_MANY",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "ONE_TO_ONE" => Some(Cardinality::OneToOne),
            "ONE_TO_MANY" => Some(Cardinality::OneToMany),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO_ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET_NULL",
            ReferentialAction::SetDefault => "SET_DEFAULT",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "NO_ACTION" => Some(ReferentialAction::NoAction),
            "RESTRICT" => Some(ReferentialAction::Restrict),
            "CASCADE" => Some(ReferentialAction::Cascade),
            "SET_NULL" => Some(ReferentialAction::SetNull),
            "SET_DEFAULT" => Some(ReferentialAction::SetDefault),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintKind {
    PrimaryKey,
    #[default]
    Unique,
    Check,
    Default,
    NotNull,
}

impl ConstraintKind {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            ConstraintKind::PrimaryKey => "PRIMARY_KEY",
            ConstraintKind::Unique => "UNIQUE",
            ConstraintKind::Check => "CHECK",
            ConstraintKind::Default => "DEFAULT",
            ConstraintKind::NotNull => "NOT_NULL",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "PRIMARY_KEY" => Some(ConstraintKind::PrimaryKey),
            "UNIQUE" => Some(ConstraintKind::Unique),
            "CHECK" => Some(ConstraintKind::Check),
            "DEFAULT" => Some(ConstraintKind::Default),
            "NOT_NULL" => Some(ConstraintKind::NotNull),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "ASC" => Some(SortDirection::Asc),
            "DESC" => Some(SortDirection::Desc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Database {
    pub id: EntityId,
    #[serde(default)]
    pub schemas: Vec<Schema>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub id: EntityId,
    pub project_id: EntityId,
    pub name: String,
    pub db_vendor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collation: Option<String>,
    #[serde(default)]
    pub is_affected: bool,
    #[serde(default)]
    pub tables: Vec<Table>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub id: EntityId,
    pub schema_id: EntityId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub is_affected: bool,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub indexes: Vec<Index>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub id: EntityId,
    pub table_id: EntityId,
    pub name: String,
    pub ordinal_position: u32,
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length_scale: Option<String>,
    #[serde(default)]
    pub is_auto_increment: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub is_affected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub id: EntityId,
    pub table_id: EntityId,
    pub name: String,
    #[serde(default = "default_index_type")]
    pub index_type: String,
    #[serde(default)]
    pub is_affected: bool,
    #[serde(default)]
    pub columns: Vec<IndexColumn>,
}

fn default_index_type() -> String {
    "BTREE".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct IndexColumn {
    pub id: EntityId,
    pub index_id: EntityId,
    pub column_id: EntityId,
    pub seq_no: u32,
    #[serde(default)]
    pub sort_dir: SortDirection,
    #[serde(default)]
    pub is_affected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    pub id: EntityId,
    pub table_id: EntityId,
    pub name: String,
    pub kind: ConstraintKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_expr: Option<String>,
    #[serde(default)]
    pub is_affected: bool,
    #[serde(default)]
    pub columns: Vec<ConstraintColumn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintColumn {
    pub id: EntityId,
    pub constraint_id: EntityId,
    pub column_id: EntityId,
    pub seq_no: u32,
    #[serde(default)]
    pub is_affected: bool,
}

/// Lives under its fk (child) table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub id: EntityId,
    #[serde(alias = "tgtTableId")]
    pub pk_table_id: EntityId,
    #[serde(alias = "srcTableId")]
    pub fk_table_id: EntityId,
    pub name: String,
    pub kind: RelationshipKind,
    pub cardinality: Cardinality,
    #[serde(default)]
    pub on_delete: ReferentialAction,
    #[serde(default)]
    pub on_update: ReferentialAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
    #[serde(default)]
    pub is_affected: bool,
    #[serde(default)]
    pub columns: Vec<RelationshipColumn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipColumn {
    pub id: EntityId,
    pub relationship_id: EntityId,
    pub pk_column_id: EntityId,
    pub fk_column_id: EntityId,
    pub seq_no: u32,
    #[serde(default)]
    pub is_affected: bool,
}

impl Table {
    pub fn primary_key(&self) -> Option<&Constraint> {
        self.constraints
            .iter()
            .find(|constraint| constraint.kind == ConstraintKind::PrimaryKey)
    }

    pub fn primary_key_column_ids(&self) -> BTreeSet<&EntityId> {
        self.primary_key()
            .map(|pk| pk.columns.iter().map(|column| &column.column_id).collect())
            .unwrap_or_default()
    }

    /// Copy of the table row without its child collections.
    pub fn detached(&self) -> Self {
        Self {
            columns: Vec::new(),
            indexes: Vec::new(),
            constraints: Vec::new(),
            relationships: Vec::new(),
            ..self.clone()
        }
    }
}

impl Schema {
    pub fn detached(&self) -> Self {
        Self {
            tables: Vec::new(),
            ..self.clone()
        }
    }
}

impl Index {
    pub fn detached(&self) -> Self {
        Self {
            columns: Vec::new(),
            ..self.clone()
        }
    }
}

impl Constraint {
    pub fn detached(&self) -> Self {
        Self {
            columns: Vec::new(),
            ..self.clone()
        }
    }
}

impl Relationship {
    pub fn detached(&self) -> Self {
        Self {
            columns: Vec::new(),
            ..self.clone()
        }
    }

    pub const fn is_identifying(&self) -> bool {
        matches!(self.kind, RelationshipKind::Identifying)
    }

    pub fn is_self_referencing(&self) -> bool {
        self.pk_table_id == self.fk_table_id
    }
}

impl Database {
    pub fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.schemas
            .iter()
            .flat_map(|schema| schema.tables.iter())
            .flat_map(|table| table.relationships.iter())
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.schemas.iter().flat_map(|schema| schema.tables.iter())
    }

    pub fn table(&self, table_id: &EntityId) -> Option<&Table> {
        self.tables().find(|table| &table.id == table_id)
    }

    pub fn relationship(&self, relationship_id: &EntityId) -> Option<&Relationship> {
        self.relationships()
            .find(|relationship| &relationship.id == relationship_id)
    }
}

/// A single row, without nested children, as handed to the persistence ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "entity", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Entity {
    Schema(Schema),
    Table(Table),
    Column(Column),
    Index(Index),
    IndexColumn(IndexColumn),
    Constraint(Constraint),
    ConstraintColumn(ConstraintColumn),
    Relationship(Relationship),
    RelationshipColumn(RelationshipColumn),
}

impl Entity {
    pub const fn entity_type(&self) -> EntityType {
        match self {
            Entity::Schema(_) => EntityType::Schema,
            Entity::Table(_) => EntityType::Table,
            Entity::Column(_) => EntityType::Column,
            Entity::Index(_) => EntityType::Index,
            Entity::IndexColumn(_) => EntityType::IndexColumn,
            Entity::Constraint(_) => EntityType::Constraint,
            Entity::ConstraintColumn(_) => EntityType::ConstraintColumn,
            Entity::Relationship(_) => EntityType::Relationship,
            Entity::RelationshipColumn(_) => EntityType::RelationshipColumn,
        }
    }

    pub fn id(&self) -> &EntityId {
        EntityRef::from(self).id()
    }

    pub fn set_id(&mut self, id: EntityId) {
        match self {
            Entity::Schema(e) => e.id = id,
            Entity::Table(e) => e.id = id,
            Entity::Column(e) => e.id = id,
            Entity::Index(e) => e.id = id,
            Entity::IndexColumn(e) => e.id = id,
            Entity::Constraint(e) => e.id = id,
            Entity::ConstraintColumn(e) => e.id = id,
            Entity::Relationship(e) => e.id = id,
            Entity::RelationshipColumn(e) => e.id = id,
        }
    }

    /// The id of the enclosing entity in the snapshot tree. Schemas hang off a project,
    /// which this crate does not track.
    pub fn parent_id(&self) -> Option<&EntityId> {
        EntityRef::from(self).parent_id()
    }

    /// Every id-shaped foreign field with the kind of entity it points at.
    pub fn references(&self) -> Vec<(EntityType, &EntityId)> {
        EntityRef::from(self).references()
    }

    pub fn is_affected(&self) -> bool {
        EntityRef::from(self).is_affected()
    }

    pub fn set_affected(&mut self, value: bool) {
        match self {
            Entity::Schema(e) => e.is_affected = value,
            Entity::Table(e) => e.is_affected = value,
            Entity::Column(e) => e.is_affected = value,
            Entity::Index(e) => e.is_affected = value,
            Entity::IndexColumn(e) => e.is_affected = value,
            Entity::Constraint(e) => e.is_affected = value,
            Entity::ConstraintColumn(e) => e.is_affected = value,
            Entity::Relationship(e) => e.is_affected = value,
            Entity::RelationshipColumn(e) => e.is_affected = value,
        }
    }
}

/// Ids grouped by entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(transparent)]
pub struct EntityIdSets(BTreeMap<EntityType, BTreeSet<EntityId>>);

impl EntityIdSets {
    pub fn insert(&mut self, entity_type: EntityType, id: EntityId) -> bool {
        self.0.entry(entity_type).or_default().insert(id)
    }

    pub fn get(&self, entity_type: EntityType) -> Option<&BTreeSet<EntityId>> {
        self.0.get(&entity_type)
    }

    pub fn contains(&self, entity_type: EntityType, id: &EntityId) -> bool {
        self.0
            .get(&entity_type)
            .is_some_and(|ids| ids.contains(id))
    }

    pub fn contains_any(&self, id: &EntityId) -> bool {
        self.0.values().any(|ids| ids.contains(id))
    }

    pub fn len(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityType, &EntityId)> {
        self.0
            .iter()
            .flat_map(|(entity_type, ids)| ids.iter().map(move |id| (*entity_type, id)))
    }
}

/// Old id to store-assigned id, kept separately for each entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(transparent)]
pub struct IdMappings(BTreeMap<EntityType, HashMap<EntityId, PersistedId>>);

impl IdMappings {
    pub fn insert(&mut self, entity_type: EntityType, old: EntityId, new: PersistedId) {
        self.0.entry(entity_type).or_default().insert(old, new);
    }

    pub fn get(&self, entity_type: EntityType, old: &EntityId) -> Option<&PersistedId> {
        self.0.get(&entity_type).and_then(|ids| ids.get(old))
    }

    /// The mapped id, or the input unchanged when it is already authoritative.
    pub fn resolve(&self, entity_type: EntityType, id: &EntityId) -> EntityId {
        self.get(entity_type, id)
            .map(PersistedId::to_entity_id)
            .unwrap_or_else(|| id.clone())
    }

    pub fn len(&self) -> usize {
        self.0.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPair {
    pub before: Database,
    pub after: Database,
}

/// The entity whose mutation caused a cascade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagationSource {
    pub source_type: EntityType,
    pub source_id: EntityId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagationRecord {
    pub entity_id: PersistedId,
    pub parent_id: EntityId,
    pub source_type: EntityType,
    pub source_id: EntityId,
}

/// Snapshot whose ids have been passed through the store's id mappings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AuthoritativeSnapshot(pub(crate) Database);

impl AuthoritativeSnapshot {
    pub fn as_database(&self) -> &Database {
        &self.0
    }

    pub fn into_inner(self) -> Database {
        self.0
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagationSummary {
    pub schema_id: EntityId,
    pub source: PropagationSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_id: Option<PersistedId>,
    pub columns: Vec<PropagationRecord>,
    pub index_columns: Vec<PropagationRecord>,
    pub constraint_columns: Vec<PropagationRecord>,
    pub removed: EntityIdSets,
    pub id_mappings: IdMappings,
    pub after: AuthoritativeSnapshot,
}
