// ABOUTME: JWT bearer authentication producing the validated principal
// ABOUTME: Token generation for operators and tests, validation for every request
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

//! # Authentication
//!
//! The core treats identity as an external concern: it consumes an
//! already-validated principal. This module is the thin edge that performs
//! that validation — HS256 bearer tokens carrying the user id and role.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{AppError, AppResult, ErrorCode};
use crate::models::{Principal, UserRole};

/// JWT claims carried by access tokens
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// User id
    sub: String,
    /// Role label
    role: String,
    /// Issued-at (seconds)
    iat: i64,
    /// Expiry (seconds)
    exp: i64,
}

/// Token generation and validation
pub struct AuthManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_expiry_hours: u64,
}

impl AuthManager {
    /// Create a manager from the shared HMAC secret
    #[must_use]
    pub fn new(secret: &str, token_expiry_hours: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            token_expiry_hours,
        }
    }

    /// Mint a token for a user
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn generate_token(&self, user_id: Uuid, role: UserRole) -> AppResult<String> {
        let now = Utc::now();
        let expiry_hours = i64::try_from(self.token_expiry_hours).unwrap_or(24);
        let claims = Claims {
            sub: user_id.to_string(),
            role: role.as_str().to_owned(),
            iat: now.timestamp(),
            exp: (now + Duration::hours(expiry_hours)).timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AppError::internal(format!("Token signing failed: {e}")))
    }

    /// Validate a raw token into a principal
    ///
    /// # Errors
    ///
    /// Returns `AuthInvalid`/`AuthExpired` on bad or stale tokens.
    pub fn validate_token(&self, token: &str) -> AppResult<Principal> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    AppError::new(ErrorCode::AuthExpired, "Token expired")
                }
                _ => AppError::auth_invalid(format!("Invalid token: {e}")),
            })?;

        let user_id = Uuid::parse_str(&data.claims.sub)
            .map_err(|_| AppError::auth_invalid("Token subject is not a user id"))?;

        Ok(Principal {
            user_id,
            role: UserRole::from_str_or_default(&data.claims.role),
        })
    }

    /// Validate an `Authorization` header value into a principal
    ///
    /// # Errors
    ///
    /// Returns `AuthRequired` when the header is missing and
    /// `AuthInvalid`/`AuthExpired` when the token is bad.
    pub fn validate_bearer(&self, header: Option<&str>) -> AppResult<Principal> {
        let header = header.ok_or_else(AppError::auth_required)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AppError::auth_invalid("Expected a Bearer token"))?;
        self.validate_token(token)
    }
}
