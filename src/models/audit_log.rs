use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "audit_action", rename_all = "UPPERCASE")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

/// Append-only audit row. `item_id` is nullable and unconstrained so the
/// history of a deleted item keeps its id.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub action: AuditAction,
    pub item_id: Option<Uuid>,
    pub user_id: Uuid,
    pub changes: Option<String>,
    pub timestamp: DateTime<Utc>,
}
