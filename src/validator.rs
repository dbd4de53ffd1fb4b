use std::future::Future;
use std::sync::Arc;

use crate::error::Result;
use crate::models::{EntityId, SnapshotPair};
use crate::operations::MutationCommand;

/// The external pass that applies a command to the schema graph and flags every entity it
/// touched as affected.
///
/// `before` and `after` must both be full snapshots of the schema. Errors are passed on to
/// the caller unchanged, so an implementation reports transient trouble as
/// [`crate::error::ErrorKind::Unavailable`].
pub trait StructuralValidator: Send + Sync {
    fn validate(
        &self,
        schema_id: &EntityId,
        command: &MutationCommand,
    ) -> impl Future<Output = Result<SnapshotPair>> + Send;
}

impl<V> StructuralValidator for Arc<V>
where
    V: StructuralValidator,
{
    fn validate(
        &self,
        schema_id: &EntityId,
        command: &MutationCommand,
    ) -> impl Future<Output = Result<SnapshotPair>> + Send {
        (**self).validate(schema_id, command)
    }
}
