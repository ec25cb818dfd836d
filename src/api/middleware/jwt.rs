//! JWT authentication
//!
//! Tokens are HS256 with the user's id as subject. Handlers that need a
//! caller take an [`AuthenticatedUser`] argument; the extractor rejects the
//! request with 401 before the handler body runs.

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// JWT claims
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
}

impl Claims {
    /// Create new claims for a user
    pub fn new(user_id: &str, expiry_hours: i64) -> Self {
        let now = Utc::now();
        Self {
            sub: user_id.to_string(),
            exp: (now + Duration::hours(expiry_hours)).timestamp(),
            iat: now.timestamp(),
        }
    }
}

/// JWT signer/verifier
#[derive(Clone)]
pub struct JwtAuth {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtAuth {
    /// Create a new JWT auth handler
    ///
    /// An empty secret gets a random key, so tokens do not survive a restart.
    pub fn new(secret: &str) -> Result<Self> {
        let key = if secret.is_empty() {
            let mut key_bytes = [0u8; 32];
            OsRng.try_fill_bytes(&mut key_bytes).map_err(|e| {
                AppError::Internal(format!("Failed to generate random JWT key: {}", e))
            })?;

            debug!("Generated random JWT secret");
            key_bytes.to_vec()
        } else {
            secret.as_bytes().to_vec()
        };

        Ok(Self {
            encoding_key: EncodingKey::from_secret(&key),
            decoding_key: DecodingKey::from_secret(&key),
        })
    }

    /// Generate a JWT token for the given user
    pub fn generate_token(&self, user_id: &str, expiry_hours: i64) -> std::result::Result<String, AuthError> {
        let claims = Claims::new(user_id, expiry_hours);

        encode(&Header::default(), &claims, &self.encoding_key).map_err(|e| {
            error!("Failed to generate JWT: {}", e);
            AuthError::TokenCreation
        })
    }

    /// Validate a JWT token and return the claims
    pub fn validate_token(&self, token: &str) -> std::result::Result<Claims, AuthError> {
        let validation = Validation::default();

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!("JWT validation failed: {}", e);
                AuthError::InvalidToken
            })
    }

    /// Extract the token from an Authorization header value.
    ///
    /// Both `Bearer <token>` and a bare token are accepted.
    pub fn extract_token(authorization: &str) -> Option<&str> {
        let value = authorization.trim_start();
        let token = match value.strip_prefix("Bearer") {
            // "Bearer" followed by nothing or whitespace; "Bearerxyz" is a raw token
            Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => rest.trim(),
            _ => value.trim(),
        };

        if token.is_empty() {
            None
        } else {
            Some(token)
        }
    }
}

/// Authentication error types
#[derive(Debug)]
pub enum AuthError {
    TokenCreation,
    InvalidToken,
    MissingToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::TokenCreation => (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create token"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid token"),
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "Missing authorization token"),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::TokenCreation => AppError::Internal("Failed to create token".to_string()),
            AuthError::InvalidToken | AuthError::MissingToken => AppError::InvalidCredentials,
        }
    }
}

/// Extractor for authenticated requests
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub claims: Claims,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    JwtAuth: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(AuthError::MissingToken)?;

        let token = JwtAuth::extract_token(auth_header).ok_or(AuthError::MissingToken)?;

        let jwt_auth = JwtAuth::from_ref(state);
        let claims = jwt_auth.validate_token(token)?;

        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| {
            debug!("JWT subject is not a user id");
            AuthError::InvalidToken
        })?;

        Ok(AuthenticatedUser { user_id, claims })
    }
}
