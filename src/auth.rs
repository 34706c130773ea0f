// Authentication: password hashing, JWT tokens, and the auth extractor.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    Json,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config;
use crate::db::{Database, User};

// ── JWT ──────────────────────────────────────────────────────────────

/// JWT secret – in production this should come from an env var.
fn jwt_secret() -> Vec<u8> {
    std::env::var("JWT_SECRET")
        .unwrap_or_else(|_| "battle-command-dev-secret-change-in-production".to_string())
        .into_bytes()
}

/// Session token lifetime.
const TOKEN_LIFETIME_HOURS: i64 = 12;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub user_id: String,
    pub email: Option<String>,
    pub exp: usize, // expiry (unix timestamp)
}

pub fn create_token(user_id: &str, email: Option<&str>) -> Result<String, String> {
    let expiration = chrono::Utc::now()
        .checked_add_signed(chrono::Duration::hours(TOKEN_LIFETIME_HOURS))
        .expect("valid timestamp")
        .timestamp() as usize;

    let claims = Claims {
        user_id: user_id.to_string(),
        email: email.map(|e| e.to_string()),
        exp: expiration,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(&jwt_secret()),
    )
    .map_err(|e| format!("Failed to create token: {e}"))
}

pub fn verify_token(token: &str) -> Result<Claims, String> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(&jwt_secret()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| format!("Invalid token: {e}"))
}

// ── Password hashing ─────────────────────────────────────────────────

pub fn hash_password(password: &str) -> Result<String, String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| format!("Failed to hash password: {e}"))
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, String> {
    let parsed_hash = PasswordHash::new(hash).map_err(|e| format!("Invalid password hash: {e}"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

// ── Axum extractor: AuthUser ─────────────────────────────────────────

/// Claims used when local mode bypasses authentication.
fn local_claims() -> Claims {
    Claims {
        user_id: config::LOCAL_USER_ID.to_string(),
        email: None,
        exp: usize::MAX,
    }
}

/// Extracts the authenticated user from the Authorization bearer token.
/// In local mode, requests without a valid token act as the local user.
/// Usage: `AuthUser(claims)` in handler parameters.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|header| header.strip_prefix("Bearer "));

        if let Some(token) = token {
            if let Ok(claims) = verify_token(token) {
                return Ok(AuthUser(claims));
            }
        }

        if config::is_local_mode() {
            return Ok(AuthUser(local_claims()));
        }

        Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Unauthorized"})),
        ))
    }
}

// ── Auth API handlers ────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub email: Option<String>,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub user: UserPublic,
}

#[derive(Serialize)]
pub struct UserPublic {
    pub user_id: String,
    pub username: String,
    pub email: Option<String>,
    pub profile_picture: Option<String>,
    pub created_at: String,
}

impl UserPublic {
    pub fn from_user(user: User) -> Self {
        Self {
            user_id: user.id,
            username: user.username,
            email: user.email,
            profile_picture: user.profile_picture,
            created_at: user.created_at,
        }
    }
}

pub async fn register(
    State(db): State<Arc<Database>>,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    if req.username.is_empty() || req.password.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "username and password are required"})),
        )
            .into_response();
    }

    if req.username.len() < 3 || req.username.len() > 30 {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "username must be 3-30 characters"})),
        )
            .into_response();
    }

    if req.password.len() < 8 {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "password must be at least 8 characters"})),
        )
            .into_response();
    }

    let password_hash = match hash_password(&req.password) {
        Ok(h) => h,
        Err(e) => {
            tracing::error!("Password hash error: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Internal error"})),
            )
                .into_response();
        }
    };

    match db
        .create_user(&req.username, req.email.as_deref(), Some(&password_hash), None)
        .await
    {
        Ok(user) => {
            let token = match create_token(&user.id, user.email.as_deref()) {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!("Token creation error: {e}");
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(serde_json::json!({"error": "Internal error"})),
                    )
                        .into_response();
                }
            };
            (
                StatusCode::CREATED,
                Json(serde_json::json!(AuthResponse {
                    access_token: token,
                    user: UserPublic::from_user(user),
                })),
            )
                .into_response()
        }
        Err(e) => {
            if crate::error::is_unique_violation(&e) {
                (
                    StatusCode::CONFLICT,
                    Json(serde_json::json!({"error": "Username or email already taken"})),
                )
                    .into_response()
            } else {
                tracing::error!("DB error in register: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({"error": "Internal error"})),
                )
                    .into_response()
            }
        }
    }
}

pub async fn login(
    State(db): State<Arc<Database>>,
    Json(req): Json<LoginRequest>,
) -> impl IntoResponse {
    let user = match db.get_user_by_username(&req.username).await {
        Ok(Some(u)) => u,
        Ok(None) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Invalid username or password"})),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!("DB error in login: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Internal error"})),
            )
                .into_response();
        }
    };

    let Some(ref password_hash) = user.password_hash else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "This account has no password login"})),
        )
            .into_response();
    };

    match verify_password(&req.password, password_hash) {
        Ok(true) => {}
        Ok(false) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Invalid username or password"})),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!("Password verify error: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Internal error"})),
            )
                .into_response();
        }
    }

    let token = match create_token(&user.id, user.email.as_deref()) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!("Token creation error: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Internal error"})),
            )
                .into_response();
        }
    };

    (
        StatusCode::OK,
        Json(serde_json::json!(AuthResponse {
            access_token: token,
            user: UserPublic::from_user(user),
        })),
    )
        .into_response()
}

pub async fn me(AuthUser(claims): AuthUser, State(db): State<Arc<Database>>) -> impl IntoResponse {
    match db.get_user(&claims.user_id).await {
        Ok(Some(user)) => (
            StatusCode::OK,
            Json(serde_json::json!(UserPublic::from_user(user))),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "user not found"})),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("DB error: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Internal error"})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_and_verify() {
        let password = "testpassword123";
        let hash = hash_password(password).unwrap();
        assert!(verify_password(password, &hash).unwrap());
        assert!(!verify_password("wrongpassword", &hash).unwrap());
    }

    #[test]
    fn test_jwt_create_and_verify() {
        let token = create_token("user-id-1", Some("cmdr@example.com")).unwrap();
        let claims = verify_token(&token).unwrap();
        assert_eq!(claims.user_id, "user-id-1");
        assert_eq!(claims.email.as_deref(), Some("cmdr@example.com"));
        assert!(claims.exp > chrono::Utc::now().timestamp() as usize);
    }

    #[test]
    fn test_jwt_without_email() {
        let token = create_token("user-id-2", None).unwrap();
        let claims = verify_token(&token).unwrap();
        assert!(claims.email.is_none());
    }

    #[test]
    fn test_jwt_invalid_token() {
        assert!(verify_token("invalid.token.here").is_err());
    }

    #[test]
    fn test_local_claims_use_local_user() {
        let claims = local_claims();
        assert_eq!(claims.user_id, config::LOCAL_USER_ID);
        assert!(claims.email.is_none());
    }
}
