//! Authentication middleware
//!
//! Resolves the caller identity, enforces the expected audience, and strips
//! credentials so they never reach the upstream.

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use dsproxy_common::ID_TOKEN_HEADER;

use crate::auth::{extract_bearer_token, Identity};
use crate::error::{Error, Result};
use crate::server::AppState;

/// Credential presented by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
enum Credential {
    IdToken(String),
    Bearer(String),
}

/// `X-Id-Token` wins over `Authorization: Bearer`
fn credential(headers: &HeaderMap) -> Option<Credential> {
    let id_token = headers
        .get(ID_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = id_token {
        return Some(Credential::IdToken(token.to_string()));
    }
    extract_bearer_token(headers).map(|t| Credential::Bearer(t.to_string()))
}

/// Verify the caller and attach its [`Identity`] to the request
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let credential = credential(request.headers())
        .ok_or_else(|| Error::Unauthenticated("missing bearer token".into()))?;

    let identity: Identity = match &credential {
        Credential::IdToken(token) => state.auth.verify_id_token(token).await?,
        Credential::Bearer(token) => state.auth.verify_bearer(token).await?,
    };

    if !identity.has_audience(&state.audience) {
        debug!(
            subject = %identity.subject,
            audiences = ?identity.audiences,
            "Token audience mismatch"
        );
        return Err(Error::InvalidAudience);
    }

    let headers = request.headers_mut();
    headers.remove(header::AUTHORIZATION);
    headers.remove(ID_TOKEN_HEADER);
    request.extensions_mut().insert(identity);

    Ok(next.run(request).await)
}
