//! Access token signing/validation and opaque refresh token material
//!
//! Access tokens are short-lived HS256 JWTs; validity is signature + expiry
//! only, no ledger lookup. Refresh tokens are NOT decoded anywhere: they are
//! random opaque values, stored and looked up as a keyed SHA-256 digest.

use crate::{config::AppConfig, error::AppError};
use base64::Engine;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// JWT claims for access tokens
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,

    /// Username
    pub username: String,

    /// User roles
    pub roles: Vec<String>,

    /// Issued at
    pub iat: i64,

    /// Expiration
    pub exp: i64,

    /// JWT ID (unique token identifier)
    pub jti: String,
}

/// JWT service
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    refresh_secret: Secret<String>,
    access_token_exp_secs: u64,
}

impl JwtService {
    /// Create JWT service from config
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let secret = config.security.access_token_secret.expose_secret();

        // Ensure secret is at least 32 bytes for HS256
        if secret.len() < 32 {
            return Err(AppError::Config(
                "Access token secret too short (min 32 chars)".to_string(),
            ));
        }

        let encoding_key = EncodingKey::from_secret(secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(secret.as_bytes());

        Ok(Self {
            encoding_key,
            decoding_key,
            refresh_secret: config.security.refresh_token_secret.clone(),
            access_token_exp_secs: config.security.access_token_exp_secs,
        })
    }

    /// Seconds until a freshly issued access token expires
    pub fn access_token_exp_secs(&self) -> u64 {
        self.access_token_exp_secs
    }

    /// Generate access token
    pub fn generate_access_token(
        &self,
        user_id: &Uuid,
        username: &str,
        roles: Vec<String>,
    ) -> Result<String, AppError> {
        let now = Utc::now();
        let expiration = now + Duration::seconds(self.access_token_exp_secs as i64);

        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            roles,
            iat: now.timestamp(),
            exp: expiration.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(&Header::default(), &claims, &self.encoding_key).map_err(|e| {
            tracing::error!("Failed to encode access token: {:?}", e);
            AppError::Internal(format!("Failed to encode access token: {}", e))
        })
    }

    /// Validate and decode access token
    pub fn validate_access_token(&self, token: &str) -> Result<Claims, AppError> {
        Ok(
            decode::<Claims>(token, &self.decoding_key, &Validation::new(Algorithm::HS256))
                .map_err(|e| {
                    tracing::debug!("Access token validation failed: {:?}", e);
                    AppError::Unauthorized
                })?
                .claims,
        )
    }

    /// Generate an opaque refresh token value (256 bits from the OS CSPRNG)
    pub fn generate_refresh_value() -> String {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Keyed digest of a refresh token value, used as the ledger lookup key
    ///
    /// Keying with the refresh secret means a dumped ledger alone cannot be
    /// replayed against another deployment
    pub fn refresh_token_digest(&self, value: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.refresh_secret.expose_secret().as_bytes());
        hasher.update(value.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
