use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiError;
use crate::services::AppState;

/// Claims of tokens issued by the LMS.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JwtClaims {
    #[serde(alias = "id", alias = "userId")]
    pub sub: String,
    #[serde(default = "default_role")]
    pub role: String,
    pub exp: usize,
    #[serde(default)]
    pub iat: usize,
}

fn default_role() -> String {
    "student".to_string()
}

impl JwtClaims {
    pub fn is_staff(&self) -> bool {
        matches!(self.role.as_str(), "admin" | "instructor")
    }
}

/// Stored in request extensions by [`auth_middleware`]. The raw token is
/// forwarded on every upstream call.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub claims: JwtClaims,
    pub token: String,
}

impl AuthContext {
    pub fn user_id(&self) -> &str {
        &self.claims.sub
    }
}

pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn generate_token(&self, claims: &JwtClaims) -> Result<String, ApiError> {
        encode(&Header::default(), claims, &self.encoding_key)
            .map_err(|e| ApiError::Validation(format!("Failed to sign token: {}", e)))
    }

    pub fn validate_token(&self, token: &str) -> Result<JwtClaims, ApiError> {
        decode::<JwtClaims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => ApiError::AuthExpiry,
                _ => ApiError::rejection(401, format!("Invalid token: {}", e)),
            })
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(&headers)
        .ok_or_else(|| ApiError::rejection(401, "Missing authorization token"))?;

    let jwt_service = JwtService::new(&state.config.jwt_secret);
    let claims = jwt_service.validate_token(token).inspect_err(|e| {
        tracing::warn!("JWT validation failed: {}", e);
    })?;

    tracing::debug!("Authenticated user: {} (role: {})", claims.sub, claims.role);

    request.extensions_mut().insert(AuthContext {
        claims,
        token: token.to_string(),
    });

    Ok(next.run(request).await)
}

/// Admin routes: role `admin` or `instructor`.
pub async fn staff_guard_middleware(request: Request, next: Next) -> Result<Response, ApiError> {
    match request.extensions().get::<AuthContext>() {
        Some(auth) if auth.claims.is_staff() => Ok(next.run(request).await),
        Some(auth) => {
            tracing::warn!(
                "Access denied for {} (role: {}): staff role required",
                auth.claims.sub,
                auth.claims.role
            );
            Err(ApiError::Forbidden(
                "Instructor or admin role required".to_string(),
            ))
        }
        None => Err(ApiError::rejection(401, "Missing authorization token")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(exp_offset: i64) -> JwtClaims {
        let now = chrono::Utc::now().timestamp();
        JwtClaims {
            sub: "student-1".to_string(),
            role: "student".to_string(),
            exp: (now + exp_offset) as usize,
            iat: now as usize,
        }
    }

    #[test]
    fn test_jwt_generation_and_validation() {
        let service = JwtService::new("test-secret");

        let token = service.generate_token(&claims(3600)).unwrap();
        let validated = service.validate_token(&token).unwrap();

        assert_eq!(validated.sub, "student-1");
        assert!(!validated.is_staff());
    }

    #[test]
    fn expired_token_is_auth_expiry() {
        let service = JwtService::new("test-secret");
        let token = service.generate_token(&claims(-3600)).unwrap();

        assert!(matches!(
            service.validate_token(&token),
            Err(ApiError::AuthExpiry)
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = JwtService::new("one").generate_token(&claims(3600)).unwrap();
        let result = JwtService::new("two").validate_token(&token);
        assert!(matches!(
            result,
            Err(ApiError::ServerRejection { status: 401, .. })
        ));
    }

    #[test]
    fn lms_style_claims_are_accepted() {
        let claims: JwtClaims = serde_json::from_value(serde_json::json!({
            "id": "64f1c0ffee",
            "role": "instructor",
            "exp": 4102444800u64
        }))
        .unwrap();
        assert_eq!(claims.sub, "64f1c0ffee");
        assert!(claims.is_staff());
    }
}
