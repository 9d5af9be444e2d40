//! Analyst authentication middleware.
//!
//! When an analyst API token is configured, the session and security
//! surfaces require `Authorization: Bearer <token>`. Without a configured
//! token the check is disabled and every request passes.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// Shared auth configuration for the analyst surfaces.
#[derive(Clone)]
pub struct AnalystAuth {
    token: Option<Arc<String>>,
}

impl AnalystAuth {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.map(Arc::new),
        }
    }

    fn accepts(&self, header: Option<&str>) -> Result<(), AuthError> {
        let Some(expected) = &self.token else {
            return Ok(());
        };
        let token = header
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or(AuthError::MissingToken)?;
        if token == expected.as_str() {
            Ok(())
        } else {
            Err(AuthError::InvalidToken)
        }
    }
}

/// Middleware guarding analyst endpoints.
pub async fn analyst_auth(
    State(auth): State<AnalystAuth>,
    req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok());
    auth.accepts(header)?;
    Ok(next.run(req).await)
}

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "Missing authorization token"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
        };
        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_without_token() {
        let auth = AnalystAuth::new(None);
        assert!(auth.accepts(None).is_ok());
        assert!(auth.accepts(Some("Bearer anything")).is_ok());
    }

    #[test]
    fn test_bearer_token_checked() {
        let auth = AnalystAuth::new(Some("secret".to_string()));
        assert!(auth.accepts(Some("Bearer secret")).is_ok());
        assert!(matches!(
            auth.accepts(Some("Bearer wrong")),
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(auth.accepts(None), Err(AuthError::MissingToken)));
        assert!(matches!(
            auth.accepts(Some("secret")),
            Err(AuthError::MissingToken)
        ));
    }

    #[test]
    fn test_auth_error_responses() {
        let missing = AuthError::MissingToken.into_response();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let invalid = AuthError::InvalidToken.into_response();
        assert_eq!(invalid.status(), StatusCode::UNAUTHORIZED);
    }
}
