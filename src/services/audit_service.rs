use axum::extract::{Path, Query, State};
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::{Extension, Json, Router};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::middleware::{require_auth, require_role, AuthenticatedUser, AUDIT_VIEW_ROLES};
use crate::models::{AuditAction, AuditLog};
use crate::services::Pagination;
use crate::AppState;

const AUDIT_COLUMNS: &str = "id, action, item_id, user_id, changes, timestamp";

/// Appends one immutable audit row on the caller's connection. Runs inside
/// the caller's transaction; the caller owns commit and rollback, so a
/// mutation and its audit entry land or vanish together.
pub async fn record(
    conn: &mut PgConnection,
    action: AuditAction,
    item_id: Option<Uuid>,
    user_id: Uuid,
    changes: Option<&serde_json::Value>,
) -> AppResult<AuditLog> {
    let payload = match changes {
        Some(value) => Some(
            serde_json::to_string(value)
                .map_err(|e| AppError::Internal(format!("Failed to serialize changes: {}", e)))?,
        ),
        None => None,
    };

    let log: AuditLog = sqlx::query_as(&format!(
        "INSERT INTO audit_logs (action, item_id, user_id, changes) \
         VALUES ($1, $2, $3, $4) \
         RETURNING {}",
        AUDIT_COLUMNS
    ))
    .bind(action)
    .bind(item_id)
    .bind(user_id)
    .bind(payload)
    .fetch_one(conn)
    .await?;

    Ok(log)
}

async fn list_audit_logs(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(actor)): Extension<AuthenticatedUser>,
    Query(page): Query<Pagination>,
) -> AppResult<Json<Vec<AuditLog>>> {
    require_role(&actor, AUDIT_VIEW_ROLES)?;
    let (skip, limit) = page.clamp();

    let logs: Vec<AuditLog> = sqlx::query_as(&format!(
        "SELECT {} FROM audit_logs ORDER BY timestamp DESC OFFSET $1 LIMIT $2",
        AUDIT_COLUMNS
    ))
    .bind(skip)
    .bind(limit)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(logs))
}

/// Returns the full history for one item id, including entries for items
/// that have since been deleted.
async fn list_item_audit_logs(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(actor)): Extension<AuthenticatedUser>,
    Path(item_id): Path<Uuid>,
) -> AppResult<Json<Vec<AuditLog>>> {
    require_role(&actor, AUDIT_VIEW_ROLES)?;

    let logs: Vec<AuditLog> = sqlx::query_as(&format!(
        "SELECT {} FROM audit_logs WHERE item_id = $1 ORDER BY timestamp DESC",
        AUDIT_COLUMNS
    ))
    .bind(item_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(logs))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/audit", get(list_audit_logs))
        .route("/audit/item/:id", get(list_item_audit_logs))
        .route_layer(from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}
