//! Bearer-token guard for the board API.

use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

#[derive(Clone)]
pub struct AuthState {
    pub token: String,
}

fn bearer(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

pub async fn auth_middleware(
    State(auth): State<AuthState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let presented = bearer(&request).ok_or(StatusCode::UNAUTHORIZED)?;
    if !bool::from(presented.as_bytes().ct_eq(auth.token.as_bytes())) {
        tracing::debug!("Rejected request to {} with a bad token", request.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(request).await)
}
