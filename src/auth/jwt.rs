//! Bearer-token validation. Tokens are issued elsewhere; this side only
//! verifies them and extracts the subject.

use crate::models::Subject;
use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

pub struct JwtHandler {
    secret: String,
}

impl JwtHandler {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Validates a token and returns the verified subject.
    pub fn validate_token(&self, token: &str) -> Result<Subject> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .context("Invalid or expired token")?;

        debug!(subject = %decoded.claims.sub, "validated bearer token");
        Ok(Subject(decoded.claims.sub))
    }

    /// Mints a token for a subject. Only exercised by tests and tooling;
    /// production tokens come from the identity provider.
    pub fn issue_token(&self, subject: &str, ttl_hours: i64) -> Result<String> {
        let exp = Utc::now()
            .checked_add_signed(chrono::Duration::hours(ttl_hours))
            .context("Invalid timestamp")?
            .timestamp() as usize;
        let claims = Claims {
            sub: subject.to_string(),
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("Failed to sign token")
    }
}
