//! Authorization middleware
//!
//! Resolves which `(cluster, namespace)` pairs the caller may read from the
//! requested datasource. An empty result is a denial.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;

use crate::auth::Identity;
use crate::context::{AuthorizedScope, DatasourceContext};
use crate::error::{Error, Result};
use crate::server::AppState;

/// Attach the [`DatasourceContext`] and [`AuthorizedScope`] to the request
///
/// Must run after [`crate::authn::authenticate`].
pub async fn authorize(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let identity = request
        .extensions()
        .get::<Identity>()
        .cloned()
        .ok_or_else(|| Error::Unauthenticated("request has no identity".into()))?;

    if !state.policy.is_ready() {
        return Err(Error::ServiceUnavailable("policy not loaded".into()));
    }

    let context = DatasourceContext::from_headers(request.headers());
    let scope = resolve_scope(&state, &identity, &context);

    info!(
        subject = %identity.subject,
        groups = ?identity.groups,
        datasource = %context.uid,
        datasource_type = %context.kind,
        action = %state.action,
        scope = ?scope.entries(),
        allowed = !scope.is_empty(),
        "Authorization decision"
    );

    if scope.is_empty() {
        return Err(Error::Forbidden(format!(
            "no rule grants '{}' on datasource '{}'",
            state.action, context.uid
        )));
    }

    let extensions = request.extensions_mut();
    extensions.insert(context);
    extensions.insert(scope);
    Ok(next.run(request).await)
}

/// Objects granted to the identity, split into scope entries
pub fn resolve_scope(
    state: &AppState,
    identity: &Identity,
    context: &DatasourceContext,
) -> AuthorizedScope {
    let objects = state
        .policy
        .resolve(&identity.principals(), &context.uid, &state.action);
    AuthorizedScope::from_objects(objects)
}
