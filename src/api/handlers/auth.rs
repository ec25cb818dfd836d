//! Sign-up, login and current-user handlers

use std::sync::OnceLock;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tracing::{info, warn};

use crate::api::middleware::AuthenticatedUser;
use crate::api::server::AppState;
use crate::error::{AppError, Result};
use crate::models::{Credentials, UserResponse};
use crate::repository::UserRepository;

/// Login response
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_in: i64,
}

/// Register a new user
pub async fn signup(
    State(state): State<AppState>,
    Json(req): Json<Credentials>,
) -> Result<impl IntoResponse> {
    req.validate()
        .map_err(|msg| AppError::InvalidRequest(msg.to_string()))?;

    // Hashing is CPU bound
    let password = req.password;
    let password_hash = tokio::task::spawn_blocking(move || password_auth::generate_hash(password))
        .await
        .map_err(|e| AppError::Internal(format!("Password hashing failed: {}", e)))?;

    let repo = UserRepository::new(state.db.pool().clone());
    let user = repo.create(req.email.trim(), &password_hash).await?;

    Ok((StatusCode::CREATED, Json(UserResponse::from(user))))
}

/// Hash verified against when the email is unknown
static DUMMY_HASH: OnceLock<String> = OnceLock::new();

/// Verify `password` against `stored`, or against a throwaway hash when
/// there is no stored hash so both paths cost about the same.
async fn check_password(password: String, stored: Option<String>) -> Result<bool> {
    tokio::task::spawn_blocking(move || match stored {
        Some(hash) => password_auth::verify_password(password, &hash).is_ok(),
        None => {
            let dummy =
                DUMMY_HASH.get_or_init(|| password_auth::generate_hash("postfeed-unknown-user"));
            let _ = password_auth::verify_password(password, dummy);
            false
        }
    })
    .await
    .map_err(|e| AppError::Internal(format!("Password verification failed: {}", e)))
}

/// Exchange credentials for a token
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<Credentials>,
) -> Result<impl IntoResponse> {
    req.validate()
        .map_err(|msg| AppError::InvalidRequest(msg.to_string()))?;

    let repo = UserRepository::new(state.db.pool().clone());
    let user = repo.get_by_email(req.email.trim()).await?;

    // Unknown emails still pay for a hash check
    let stored_hash = user.as_ref().map(|u| u.password.clone());
    let verified = check_password(req.password, stored_hash).await?;

    let user = match user {
        Some(user) if verified => user,
        Some(user) => {
            warn!("Login failed for user: {}", user.email);
            return Err(AppError::InvalidCredentials);
        }
        None => {
            warn!("Login failed for unknown user: {}", req.email);
            return Err(AppError::InvalidCredentials);
        }
    };

    let expiry_hours = state.config.api.jwt_expiry_hours;
    let token = state
        .jwt_auth
        .generate_token(&user.id.to_string(), expiry_hours)?;

    info!(user_id = %user.id, "User logged in");

    Ok(Json(LoginResponse {
        token,
        expires_in: expiry_hours * 3600,
    }))
}

/// The caller's own account
pub async fn me(user: AuthenticatedUser, State(state): State<AppState>) -> Result<impl IntoResponse> {
    let repo = UserRepository::new(state.db.pool().clone());

    let account = repo
        .get_by_id(user.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

    Ok(Json(UserResponse::from(account)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_check_password_known_user() {
        let hash = password_auth::generate_hash("hunter2");

        assert!(check_password("hunter2".to_string(), Some(hash.clone())).await.unwrap());
        assert!(!check_password("wrong".to_string(), Some(hash)).await.unwrap());
    }

    #[tokio::test]
    async fn test_check_password_unknown_user_still_hashes() {
        // Even the dummy hash's own password must not authenticate
        assert!(!check_password("postfeed-unknown-user".to_string(), None)
            .await
            .unwrap());
        assert!(DUMMY_HASH.get().is_some());
    }
}
