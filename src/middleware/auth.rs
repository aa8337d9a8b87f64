use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::{AppError, AppResult};
use crate::models::{Role, User};
use crate::services::auth_service::decode_access_token;
use crate::AppState;

/// Authenticated user resolved by the auth middleware and injected into
/// request extensions.
#[derive(Clone, Debug)]
pub struct AuthenticatedUser(pub User);

/// Roles allowed to create and update inventory items.
pub const ITEM_WRITE_ROLES: &[Role] = &[Role::Admin, Role::Manager];
/// Roles allowed to delete inventory items.
pub const ITEM_DELETE_ROLES: &[Role] = &[Role::Admin];
/// Roles allowed to read audit logs.
pub const AUDIT_VIEW_ROLES: &[Role] = &[Role::Admin, Role::Manager];

/// Resolves the bearer token to an active user or rejects the request.
/// Applied as a route layer on every endpoint except register/login/health.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::Unauthenticated("Not authenticated".to_string()))?;

    let claims = decode_access_token(token, &state.config.jwt_secret)?;

    // The token subject is the account email; the user row is the source of
    // truth for role and active status, not the token claims.
    let user: Option<User> = sqlx::query_as(
        "SELECT id, email, username, hashed_password, full_name, role, is_active, \
         created_at, updated_at \
         FROM users WHERE email = $1",
    )
    .bind(&claims.sub)
    .fetch_optional(&state.pool)
    .await?;

    let user = user
        .ok_or_else(|| AppError::Unauthenticated("Could not validate credentials".to_string()))?;

    if !user.is_active {
        return Err(AppError::Unauthenticated("Inactive user account".to_string()));
    }

    req.extensions_mut().insert(AuthenticatedUser(user));
    Ok(next.run(req).await)
}

/// Flat set-membership check against the closed role enumeration.
pub fn require_role(actor: &User, allowed: &[Role]) -> AppResult<()> {
    if allowed.contains(&actor.role) {
        Ok(())
    } else {
        Err(AppError::Forbidden("Not enough permissions".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn user_with_role(role: Role) -> User {
        User {
            id: Uuid::new_v4(),
            email: "user@example.com".to_string(),
            username: "user".to_string(),
            hashed_password: "x".to_string(),
            full_name: None,
            role,
            is_active: true,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn test_item_write_allows_admin_and_manager_only() {
        assert!(require_role(&user_with_role(Role::Admin), ITEM_WRITE_ROLES).is_ok());
        assert!(require_role(&user_with_role(Role::Manager), ITEM_WRITE_ROLES).is_ok());
        assert!(require_role(&user_with_role(Role::Viewer), ITEM_WRITE_ROLES).is_err());
    }

    #[test]
    fn test_item_delete_allows_admin_only() {
        assert!(require_role(&user_with_role(Role::Admin), ITEM_DELETE_ROLES).is_ok());
        assert!(require_role(&user_with_role(Role::Manager), ITEM_DELETE_ROLES).is_err());
        assert!(require_role(&user_with_role(Role::Viewer), ITEM_DELETE_ROLES).is_err());
    }

    #[test]
    fn test_audit_view_allows_admin_and_manager_only() {
        assert!(require_role(&user_with_role(Role::Admin), AUDIT_VIEW_ROLES).is_ok());
        assert!(require_role(&user_with_role(Role::Manager), AUDIT_VIEW_ROLES).is_ok());
        assert!(require_role(&user_with_role(Role::Viewer), AUDIT_VIEW_ROLES).is_err());
    }

    #[test]
    fn test_forbidden_role_maps_to_403() {
        let err = require_role(&user_with_role(Role::Viewer), ITEM_DELETE_ROLES).unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::FORBIDDEN);
    }
}
