// ==============================================================================
// middleware/auth.rs - Authentication Extractor
// ==============================================================================
// Description: HTTP Basic and token authentication with role checks
// Author: Matt Barham
// Created: 2025-12-16
// Modified: 2026-01-23
// Version: 1.1.0
// ==============================================================================
// Two schemes are accepted on the Authorization header:
//   Basic <base64(login:password)>   verified against the Argon2id hash
//   Token <hex>                      looked up by SHA-256 digest
// ==============================================================================

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use varda_core::models::{Role, User};

use crate::error::ApiError;
use crate::security::{token_digest, verify_password};
use crate::state::AppState;

/// Authenticated user extracted from the Authorization header.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl AuthUser {
    /// Admins pass every check; everyone else needs the named role.
    pub fn require_role(&self, role: Role) -> Result<(), ApiError> {
        if self.0.has_role(Role::Admin) || self.0.has_role(role) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!(
                "Role {} required",
                role.as_str()
            )))
        }
    }

    /// Any of the named roles (or admin).
    pub fn require_any_role(&self, roles: &[Role]) -> Result<(), ApiError> {
        if self.0.has_role(Role::Admin) || roles.iter().any(|r| self.0.has_role(*r)) {
            Ok(())
        } else {
            let names: Vec<&str> = roles.iter().map(|r| r.as_str()).collect();
            Err(ApiError::Forbidden(format!(
                "One of roles {} required",
                names.join(", ")
            )))
        }
    }

    pub fn is_admin(&self) -> bool {
        self.0.has_role(Role::Admin)
    }

    /// Owner-or-admin check for per-resource access.
    pub fn require_owner(&self, owner_id: i64) -> Result<(), ApiError> {
        if self.is_admin() || self.0.id == owner_id {
            Ok(())
        } else {
            Err(ApiError::Forbidden("Not the resource owner".to_string()))
        }
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("Missing Authorization header".to_string()))?;

        if let Some(encoded) = header.strip_prefix("Basic ") {
            return basic_auth(state, encoded).await;
        }
        if let Some(token) = header.strip_prefix("Token ") {
            return token_auth(state, token.trim()).await;
        }

        Err(ApiError::Unauthorized(
            "Unsupported authorization scheme".to_string(),
        ))
    }
}

async fn basic_auth(state: &AppState, encoded: &str) -> Result<AuthUser, ApiError> {
    let decoded = BASE64
        .decode(encoded.trim())
        .map_err(|_| ApiError::Unauthorized("Invalid Basic credentials".to_string()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| ApiError::Unauthorized("Invalid Basic credentials".to_string()))?;
    let (login, password) = decoded
        .split_once(':')
        .ok_or_else(|| ApiError::Unauthorized("Invalid Basic credentials".to_string()))?;

    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE login = $1")
        .bind(login)
        .fetch_optional(state.store().pool())
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Unknown user or wrong password".to_string()))?;

    let verified = verify_password(password, &user.password_hash)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if !verified {
        return Err(ApiError::Unauthorized(
            "Unknown user or wrong password".to_string(),
        ));
    }

    Ok(AuthUser(user))
}

async fn token_auth(state: &AppState, token: &str) -> Result<AuthUser, ApiError> {
    let digest = token_digest(token);

    let user = sqlx::query_as::<_, User>(
        "SELECT u.* FROM users u
         JOIN tokens t ON t.user_id = u.id
         WHERE t.token_digest = $1",
    )
    .bind(digest)
    .fetch_optional(state.store().pool())
    .await?
    .ok_or_else(|| ApiError::Unauthorized("Unknown token".to_string()))?;

    Ok(AuthUser(user))
}

#[cfg(test)]
mod tests {
    use super::*;
    use varda_core::models::bits_from_roles;

    fn user_with_roles(roles: &[Role]) -> AuthUser {
        AuthUser(User {
            id: 7,
            name: "Test".to_string(),
            login: "test".to_string(),
            password_hash: String::new(),
            roles: bits_from_roles(roles),
            added: chrono::Utc::now(),
        })
    }

    #[test]
    fn test_role_checks() {
        let importer = user_with_roles(&[Role::Importer]);
        assert!(importer.require_role(Role::Importer).is_ok());
        assert!(importer.require_role(Role::Annotator).is_err());
        assert!(importer
            .require_any_role(&[Role::Annotator, Role::Importer])
            .is_ok());

        let admin = user_with_roles(&[Role::Admin]);
        assert!(admin.require_role(Role::Importer).is_ok());
        assert!(admin.require_any_role(&[Role::Querier]).is_ok());
    }

    #[test]
    fn test_owner_check() {
        let user = user_with_roles(&[Role::Importer]);
        assert!(user.require_owner(7).is_ok());
        assert!(user.require_owner(8).is_err());
        let admin = user_with_roles(&[Role::Admin]);
        assert!(admin.require_owner(8).is_ok());
    }
}
