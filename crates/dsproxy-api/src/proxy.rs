//! Proxy handler: label injection and forwarding
//!
//! Runs behind [`crate::authn::authenticate`] and [`crate::authz::authorize`].

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use axum::Extension;
use tracing::{debug, warn};

use crate::context::{AuthorizedScope, DatasourceContext};
use crate::error::{Error, Result};
use crate::forwarder::{ListenerScheme, UpstreamRequest};
use crate::injection::{plan_for, ParamRewriter, RewritePlan};
use crate::server::AppState;

/// Maximum buffered request body (query payloads are small)
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Constrain the request to the first authorized namespace and forward it
pub async fn proxy_handler(
    State(state): State<AppState>,
    Extension(context): Extension<DatasourceContext>,
    Extension(scope): Extension<AuthorizedScope>,
    request: Request,
) -> Result<Response<Body>> {
    let scheme = request
        .extensions()
        .get::<ListenerScheme>()
        .copied()
        .unwrap_or(ListenerScheme::Http);
    let namespace = pick_namespace(&scope)?;
    let plan = plan_for(&context.kind, request.uri().path())?;

    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_BODY_SIZE)
        .await
        .map_err(|e| Error::BadRequest(format!("failed to read request body: {}", e)))?;

    let (query, body) = match plan {
        RewritePlan::Passthrough => (parts.uri.query().map(str::to_string), body),
        RewritePlan::Rewrite {
            dialect,
            param,
            add_if_absent,
        } => {
            let rewriter = ParamRewriter::new(dialect, param, state.injection.label(dialect), &namespace);
            let (body, in_body) = rewrite_body(&rewriter, &parts.headers, body)?;
            let (query, _) = rewriter
                .rewrite_encoded(parts.uri.query().unwrap_or(""), add_if_absent && !in_body)?;
            (Some(query), body)
        }
    };

    debug!(
        path = %parts.uri.path(),
        namespace = %namespace,
        datasource_type = %context.kind,
        "Injected namespace constraint"
    );

    state
        .upstream
        .forward(UpstreamRequest {
            method: parts.method,
            path: parts.uri.path().to_string(),
            query,
            headers: parts.headers,
            body,
            scheme,
        })
        .await
}

/// First authorized namespace; more than one is logged since only one is
/// enforced
fn pick_namespace(scope: &AuthorizedScope) -> Result<String> {
    let namespaces = scope.namespaces();
    let first = namespaces
        .first()
        .ok_or_else(|| Error::Forbidden("no authorized namespace".into()))?;
    if namespaces.len() > 1 {
        warn!(
            injected = %first,
            authorized = ?namespaces,
            "Multiple namespaces authorized; only the first is injected"
        );
    }
    Ok(first.to_string())
}

/// Rewrite a form-encoded body; returns the body and whether it carried the
/// parameter
fn rewrite_body(rewriter: &ParamRewriter<'_>, headers: &HeaderMap, body: Bytes) -> Result<(Bytes, bool)> {
    if body.is_empty() {
        return Ok((body, false));
    }

    let is_form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with(FORM_CONTENT_TYPE));
    if !is_form {
        return Err(Error::BadRequest(format!(
            "query requests must use {} bodies",
            FORM_CONTENT_TYPE
        )));
    }

    let text = std::str::from_utf8(&body)
        .map_err(|_| Error::BadRequest("request body is not valid UTF-8".into()))?;
    let (encoded, found) = rewriter.rewrite_encoded(text, false)?;
    Ok((Bytes::from(encoded), found))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injection::Dialect;

    #[test]
    fn first_namespace_wins() {
        let scope = AuthorizedScope::from_objects(["cluster1/ns1", "cluster1/ns2", "cluster1/ns3"]);
        assert_eq!(pick_namespace(&scope).unwrap(), "ns1");
    }

    #[test]
    fn empty_scope_is_forbidden() {
        let err = pick_namespace(&AuthorizedScope::default()).unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[test]
    fn form_body_is_rewritten() {
        let rewriter = ParamRewriter::new(Dialect::PromQl, "query", "namespace", "ns1");
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, FORM_CONTENT_TYPE.parse().unwrap());
        let (body, found) =
            rewrite_body(&rewriter, &headers, Bytes::from_static(b"query=up&step=15")).unwrap();
        assert!(found);
        assert_eq!(&body[..], b"query=up%7Bnamespace%3D%22ns1%22%7D&step=15");
    }

    #[test]
    fn non_form_body_is_rejected() {
        let rewriter = ParamRewriter::new(Dialect::PromQl, "query", "namespace", "ns1");
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let err = rewrite_body(&rewriter, &headers, Bytes::from_static(b"{}")).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn empty_body_passes() {
        let rewriter = ParamRewriter::new(Dialect::PromQl, "query", "namespace", "ns1");
        let (body, found) = rewrite_body(&rewriter, &HeaderMap::new(), Bytes::new()).unwrap();
        assert!(body.is_empty());
        assert!(!found);
    }
}
