use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
};

pub const DEFAULT_TOKEN_TTL_SECONDS: i64 = 72 * 3600;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    user_id: i64,
    iat: i64,
    exp: i64,
}

pub fn mint_token(cfg: &AuthConfig, user_id: UserId) -> Result<String, ApiError> {
    let now = Utc::now();
    let exp = Duration::try_seconds(cfg.token_ttl_seconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| {
            ApiError::new(
                ErrorCode::Internal,
                format!("token ttl of {}s is out of range", cfg.token_ttl_seconds),
            )
        })?;
    let claims = Claims {
        user_id: user_id.0,
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(cfg.jwt_secret.as_bytes()),
    )
    .map_err(|e| ApiError::new(ErrorCode::Internal, e.to_string()))
}

/// Checks signature and expiry and returns the user the token was minted for.
pub fn verify_token(cfg: &AuthConfig, token: &str) -> Result<UserId, ApiError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.jwt_secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|e| ApiError::new(ErrorCode::Unauthorized, format!("invalid token: {e}")))?;
    Ok(UserId(data.claims.user_id))
}

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let mut salt_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| ApiError::new(ErrorCode::Internal, e.to_string()))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ApiError::new(ErrorCode::Internal, e.to_string()))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
