pub mod algorithms;
#[cfg(feature = "api")]
pub mod api;
pub mod cascade;
pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod diff;
pub mod error;
pub mod invariants;
pub mod memory;
pub mod models;
pub mod operations;
pub mod persist;
pub mod remap;
pub mod snapshot;
pub mod store;
pub mod validator;

pub mod prelude {
    #[cfg(feature = "api")]
    pub use crate::api::{AppError, SchemaApp};
    pub use crate::cascade::{PkCascade, PkEffect};
    pub use crate::config::EngineConfig;
    #[cfg(feature = "sqlx")]
    pub use crate::db::{PgEntityStore, PgEntityTransaction, create_schema_tables};
    pub use crate::diff::{SnapshotDiff, diff};
    pub use crate::error::{ErrorKind, LibError, Result};
    pub use crate::invariants::{SchemaInvariantViolation, validate_kind_change};
    pub use crate::memory::MemoryStore;
    pub use crate::models::{
        AuthoritativeSnapshot, Database, Entity, EntityId, EntityIdSets, EntityType, IdMappings,
        PersistedId, PropagationRecord, PropagationSource, PropagationSummary, RelationshipKind,
        SnapshotPair,
    };
    pub use crate::operations::{MutationCommand, SchemaMutationEngine};
    pub use crate::remap::rewrite;
    pub use crate::store::{EntityStore, EntityTransaction, IdGenerator, UlidGenerator};
    pub use crate::validator::StructuralValidator;
}
