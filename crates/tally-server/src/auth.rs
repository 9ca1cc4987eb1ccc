use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Identity extracted from a validated bearer token. Handlers take the
/// username from here and never from the request payload.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub username: String,
}

/// Validate an Authorization header value and return the verified username
fn validate_bearer(secret: &[u8], auth_header: &str) -> Option<String> {
    let token = auth_header.strip_prefix("Bearer ")?;
    let decoding_key = DecodingKey::from_secret(secret);
    let validation = Validation::default();
    match decode::<Claims>(token, &decoding_key, &validation) {
        Ok(token_data) => Some(token_data.claims.sub),
        Err(e) => {
            eprintln!("JWT validation error: {}", e);
            None
        }
    }
}

pub async fn jwt_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok());

    if let Some(auth_header) = auth_header {
        if let Some(username) = validate_bearer(state.settings.auth.jwt_secret.as_bytes(), auth_header)
        {
            req.extensions_mut().insert(AuthUser { username });
            return Ok(next.run(req).await);
        }
    }
    Err(StatusCode::UNAUTHORIZED)
}
