use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::middleware::{require_auth, AuthenticatedUser};
use crate::models::{Role, User};
use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub exp: i64,
    pub iat: i64,
}

pub fn create_access_token(
    subject: &str,
    role: Role,
    secret: &str,
    expire_minutes: i64,
) -> AppResult<String> {
    let now = Utc::now();
    let exp = now + chrono::Duration::minutes(expire_minutes);
    let claims = Claims {
        sub: subject.to_string(),
        role,
        exp: exp.timestamp(),
        iat: now.timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("JWT error: {}", e)))
}

/// Fails on a bad signature or an expired token.
pub fn decode_access_token(token: &str, secret: &str) -> AppResult<Claims> {
    jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| AppError::Unauthenticated("Could not validate credentials".to_string()))
}

pub fn hash_password(plaintext: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plaintext.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("Password hashing error: {}", e)))
}

pub fn verify_password(plaintext: &str, hashed: &str) -> bool {
    let Ok(parsed_hash) = PasswordHash::new(hashed) else {
        return false;
    };
    Argon2::default()
        .verify_password(plaintext.as_bytes(), &parsed_hash)
        .is_ok()
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
}

impl RegisterRequest {
    fn validate(&self) -> AppResult<()> {
        if self.email.trim().is_empty() || !self.email.contains('@') {
            return Err(AppError::Validation("Invalid email address".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(AppError::Validation("Username must not be empty".to_string()));
        }
        if self.password.len() < 8 {
            return Err(AppError::Validation(
                "Password must be at least 8 characters".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub full_name: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        UserResponse {
            id: user.id,
            email: user.email,
            username: user.username,
            full_name: user.full_name,
            role: user.role,
            is_active: user.is_active,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

const USER_COLUMNS: &str = "id, email, username, hashed_password, full_name, role, is_active, \
     created_at, updated_at";

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<UserResponse>)> {
    req.validate()?;

    // Pre-check for a friendly message; the unique constraints are the
    // actual guard under concurrency.
    let existing: Option<(String, String)> =
        sqlx::query_as("SELECT email, username FROM users WHERE email = $1 OR username = $2")
            .bind(&req.email)
            .bind(&req.username)
            .fetch_optional(&state.pool)
            .await?;

    if let Some((email, _)) = existing {
        if email == req.email {
            return Err(AppError::Conflict("Email already registered".to_string()));
        }
        return Err(AppError::Conflict("Username already taken".to_string()));
    }

    let hashed_password = hash_password(&req.password)?;
    let role = req.role.unwrap_or(Role::Viewer);

    let user: User = sqlx::query_as(&format!(
        "INSERT INTO users (email, username, hashed_password, full_name, role) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING {}",
        USER_COLUMNS
    ))
    .bind(&req.email)
    .bind(&req.username)
    .bind(&hashed_password)
    .bind(&req.full_name)
    .bind(role)
    .fetch_one(&state.pool)
    .await
    .map_err(|e| {
        if e.to_string().contains("unique") || e.to_string().contains("duplicate") {
            AppError::Conflict("Email or username already registered".to_string())
        } else {
            AppError::from(e)
        }
    })?;

    tracing::info!("Registered user {} with role {:?}", user.username, user.role);
    Ok((StatusCode::CREATED, Json(user.into())))
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> AppResult<Json<TokenResponse>> {
    let user: Option<User> = sqlx::query_as(&format!(
        "SELECT {} FROM users WHERE email = $1",
        USER_COLUMNS
    ))
    .bind(&req.email)
    .fetch_optional(&state.pool)
    .await?;

    let user = user
        .filter(|u| verify_password(&req.password, &u.hashed_password))
        .ok_or_else(|| AppError::Unauthenticated("Incorrect email or password".to_string()))?;

    if !user.is_active {
        return Err(AppError::Validation("Inactive user account".to_string()));
    }

    let access_token = create_access_token(
        &user.email,
        user.role,
        &state.config.jwt_secret,
        state.config.access_token_expire_minutes,
    )?;

    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer".to_string(),
    }))
}

async fn me(
    Extension(AuthenticatedUser(actor)): Extension<AuthenticatedUser>,
) -> Json<UserResponse> {
    Json(actor.into())
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/auth/me", get(me))
        .route_layer(from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .merge(protected)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        let token = create_access_token("alice@x.com", Role::Manager, "test-secret", 30).unwrap();
        let claims = decode_access_token(&token, "test-secret").unwrap();
        assert_eq!(claims.sub, "alice@x.com");
        assert_eq!(claims.role, Role::Manager);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_token_rejected_with_wrong_secret() {
        let token = create_access_token("alice@x.com", Role::Viewer, "test-secret", 30).unwrap();
        assert!(decode_access_token(&token, "other-secret").is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = create_access_token("alice@x.com", Role::Viewer, "test-secret", -5).unwrap();
        assert!(decode_access_token(&token, "test-secret").is_err());
    }

    #[test]
    fn test_password_hash_roundtrip() {
        let hashed = hash_password("correct horse battery").unwrap();
        assert!(verify_password("correct horse battery", &hashed));
        assert!(!verify_password("wrong password", &hashed));
    }

    #[test]
    fn test_hashes_are_salted() {
        let a = hash_password("same-password").unwrap();
        let b = hash_password("same-password").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_register_validation() {
        let valid = RegisterRequest {
            email: "alice@x.com".to_string(),
            username: "alice".to_string(),
            password: "longenough".to_string(),
            full_name: None,
            role: None,
        };
        assert!(valid.validate().is_ok());

        let bad_email = RegisterRequest {
            email: "not-an-email".to_string(),
            ..valid_copy(&valid)
        };
        assert!(bad_email.validate().is_err());

        let short_password = RegisterRequest {
            password: "short".to_string(),
            ..valid_copy(&valid)
        };
        assert!(short_password.validate().is_err());

        let empty_username = RegisterRequest {
            username: "  ".to_string(),
            ..valid_copy(&valid)
        };
        assert!(empty_username.validate().is_err());
    }

    fn valid_copy(req: &RegisterRequest) -> RegisterRequest {
        RegisterRequest {
            email: req.email.clone(),
            username: req.username.clone(),
            password: req.password.clone(),
            full_name: req.full_name.clone(),
            role: req.role,
        }
    }
}
