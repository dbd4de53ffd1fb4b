use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};

use crate::error::{ErrorKind, LibError};
use crate::models::EntityId;
use crate::operations::{MutationCommand, SchemaMutationEngine};
use crate::store::EntityStore;
use crate::validator::StructuralValidator;

#[derive(Debug)]
pub struct AppError(pub LibError);

impl From<LibError> for AppError {
    fn from(value: LibError) -> Self {
        Self(value)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Database => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind);
        tracing::error!(
            kind = ?self.0.kind,
            code = self.0.code,
            error = %self.0.source,
            "schema api request failed"
        );
        let body = serde_json::json!({
            "code": self.0.code,
            "message": self.0.public,
        });
        (status, Json(body)).into_response()
    }
}

/// Application state that owns a mutation engine.
pub trait SchemaApp: Clone + Send + Sync + 'static {
    type Store: EntityStore + 'static;
    type Validator: StructuralValidator + 'static;

    fn engine(&self) -> Arc<SchemaMutationEngine<Self::Store, Self::Validator>>;
}

async fn get_schema_handler<S>(
    State(app): State<S>,
    Path(schema_id): Path<EntityId>,
) -> Result<impl IntoResponse, AppError>
where
    S: SchemaApp,
{
    let snapshot = app.engine().snapshot(&schema_id).await?;
    Ok(Json(snapshot))
}

async fn mutate_schema_handler<S>(
    State(app): State<S>,
    Path(schema_id): Path<EntityId>,
    Json(command): Json<MutationCommand>,
) -> Result<impl IntoResponse, AppError>
where
    S: SchemaApp,
{
    let summary = app.engine().execute(&schema_id, command).await?;
    Ok(Json(summary))
}

pub fn routes<S>() -> Router<S>
where
    S: SchemaApp,
{
    tracing::info!("Registering route /schema/{{schema_id}} [GET]");
    tracing::info!("Registering route /schema/{{schema_id}}/mutations [POST]");

    Router::new()
        .route("/schema/{schema_id}", get(get_schema_handler::<S>))
        .route(
            "/schema/{schema_id}/mutations",
            post(mutate_schema_handler::<S>),
        )
}
