//! Proxy server: router assembly and listeners

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::Request;
use axum::middleware::{from_fn, from_fn_with_state, Next};
use axum::response::Response;
use axum::routing::{any, delete, get, MethodRouter};
use axum::{Extension, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use dsproxy_policy::PolicyEngine;

use crate::auth_chain::AuthChain;
use crate::authn::authenticate;
use crate::authz::authorize;
use crate::error::{Error, Result};
use crate::forwarder::{ListenerScheme, Upstream};
use crate::injection::InjectionConfig;
use crate::proxy::proxy_handler;
use crate::rules_api::{create_rule, delete_rule, list_rules};

/// Default drain period for in-flight requests on shutdown
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// TLS certificate and key files
#[derive(Debug, Clone)]
pub struct TlsFiles {
    /// PEM certificate chain
    pub cert: PathBuf,
    /// PEM private key
    pub key: PathBuf,
}

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Plain HTTP listener
    pub http_addr: SocketAddr,
    /// TLS listener, used when `tls` is set
    pub https_addr: SocketAddr,
    /// Certificate material for the TLS listener
    pub tls: Option<TlsFiles>,
    /// Drain period on shutdown
    pub shutdown_grace: Duration,
}

/// Shared state for handlers and middleware
#[derive(Clone)]
pub struct AppState {
    /// Token verifiers
    pub auth: Arc<AuthChain>,
    /// Loaded policy
    pub policy: Arc<PolicyEngine>,
    /// Upstream client
    pub upstream: Arc<dyn Upstream>,
    /// Injected labels
    pub injection: Arc<InjectionConfig>,
    /// Action checked for every proxied request
    pub action: String,
    /// Required token audience
    pub audience: String,
    /// Cluster client for the rule API
    pub kube: Option<kube::Client>,
}

/// Build the router for one listener
pub fn build_router(state: AppState, scheme: ListenerScheme) -> Router {
    // Layers run outermost-last: authenticate, then authorize, then the handler
    let proxied: MethodRouter = any(proxy_handler)
        .layer(from_fn_with_state(state.clone(), authorize))
        .layer(from_fn_with_state(state.clone(), authenticate))
        .with_state(state.clone());

    // Rule management needs a verified token but no datasource scope
    let rules = Router::new()
        .route("/api/v1/rules", get(list_rules).post(create_rule))
        .route("/api/v1/rules/{name}", delete(delete_rule))
        .route_layer(from_fn_with_state(state.clone(), authenticate));

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .merge(rules)
        .fallback_service(proxied)
        .with_state(state)
        .layer(from_fn(log_request))
        .layer(Extension(scheme))
}

/// Log request start and finish with status and latency
async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let span = tracing::info_span!("request", %method, %path);

    async move {
        debug!("Request started");
        let started = Instant::now();
        let response = next.run(request).await;
        debug!(
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request completed"
        );
        response
    }
    .instrument(span)
    .await
}

/// Run the HTTP listener, and the HTTPS listener when TLS is configured,
/// until `cancel` fires
pub async fn serve(config: ServerConfig, state: AppState, cancel: CancellationToken) -> Result<()> {
    let http_handle = Handle::new();
    let https_handle = Handle::new();

    let shutdown = {
        let handles = [http_handle.clone(), https_handle.clone()];
        let grace = config.shutdown_grace;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            info!(grace_secs = grace.as_secs(), "Shutting down listeners");
            for handle in handles {
                handle.graceful_shutdown(Some(grace));
            }
        })
    };

    let http_app = build_router(state.clone(), ListenerScheme::Http);
    info!(addr = %config.http_addr, "Starting HTTP listener");
    let http = axum_server::bind(config.http_addr)
        .handle(http_handle)
        .serve(http_app.into_make_service());

    let result = match &config.tls {
        Some(files) => {
            let tls = RustlsConfig::from_pem_file(&files.cert, &files.key)
                .await
                .map_err(|e| Error::Config(format!("TLS config error: {}", e)))?;
            let https_app = build_router(state, ListenerScheme::Https);
            info!(addr = %config.https_addr, "Starting HTTPS listener");
            let https = axum_server::bind_rustls(config.https_addr, tls)
                .handle(https_handle)
                .serve(https_app.into_make_service());
            tokio::try_join!(http, https).map(|_| ())
        }
        None => http.await,
    };

    shutdown.abort();
    result.map_err(|e| Error::Internal(format!("server error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::StatusCode;
    use dsproxy_policy::{MemoryAdapter, PolicySet};
    use tower::ServiceExt;
    use url::Url;

    use crate::auth::{Identity, MockVerifier};
    use crate::forwarder::{Forwarder, MockUpstream, UpstreamTarget};

    fn identity(subject: &str, audience: &str) -> Identity {
        Identity {
            subject: subject.to_string(),
            audiences: vec![audience.to_string()],
            ..Default::default()
        }
    }

    async fn state(policy: &str, identity: Option<Identity>) -> AppState {
        let mut verifier = MockVerifier::new();
        verifier.expect_name().return_const("mock");
        verifier.expect_verify().returning(move |_| {
            identity
                .clone()
                .ok_or_else(|| Error::Unauthenticated("bad token".into()))
        });

        let rules = PolicySet::parse(policy).unwrap();
        let engine = PolicyEngine::load(Arc::new(MemoryAdapter::new(rules)), None)
            .await
            .unwrap();

        AppState {
            auth: Arc::new(AuthChain::new(Arc::new(verifier))),
            policy: Arc::new(engine),
            upstream: Arc::new(Forwarder::with_client(
                reqwest::Client::new(),
                UpstreamTarget::Static(Url::parse("http://127.0.0.1:1").unwrap()),
            )),
            injection: Arc::new(InjectionConfig::default()),
            action: "read".into(),
            audience: "example-app".into(),
            kube: None,
        }
    }

    fn get_with_token(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::get(uri)
            .header("authorization", "Bearer token")
            .header("x-datasource-uid", "ds1")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn healthz_needs_no_token() {
        let app = build_router(state("", None).await, ListenerScheme::Http);
        let response = app
            .oneshot(axum::http::Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rejected_token_is_401() {
        let app = build_router(state("", None).await, ListenerScheme::Http);
        let response = app.oneshot(get_with_token("/api/v1/query?query=up")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_audience_is_401() {
        let state = state(
            "p, alice, ds1, c/ns, read",
            Some(identity("alice", "other-app")),
        )
        .await;
        let app = build_router(state, ListenerScheme::Http);
        let response = app.oneshot(get_with_token("/api/v1/query?query=up")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn no_rule_is_403() {
        let state = state(
            "p, alice, ds1, c/ns, read",
            Some(identity("bob", "example-app")),
        )
        .await;
        let app = build_router(state, ListenerScheme::Http);
        let response = app.oneshot(get_with_token("/api/v1/query?query=up")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unloaded_policy_is_503() {
        let mut state = state("", Some(identity("alice", "example-app"))).await;
        state.policy = Arc::new(PolicyEngine::new(
            Arc::new(MemoryAdapter::new(PolicySet::default())),
            None,
        ));
        let app = build_router(state, ListenerScheme::Http);
        let response = app.oneshot(get_with_token("/api/v1/query?query=up")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn disallowed_path_is_403() {
        let state = state(
            "p, alice, ds1, c/ns, read",
            Some(identity("alice", "example-app")),
        )
        .await;
        let app = build_router(state, ListenerScheme::Http);
        let response = app
            .oneshot(get_with_token("/api/v1/admin/tsdb/snapshot"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn rules_api_requires_token() {
        let app = build_router(state("", None).await, ListenerScheme::Http);
        let grant_all = r#"{"metadata": {"name": "everything"}, "spec": {"user": "mallory",
            "dataSourceId": "*", "permissions": [{"action": "read", "resource": "*/*"}]}}"#;

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::post("/api/v1/rules")
                    .body(Body::from(grant_all))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(axum::http::Request::get("/api/v1/rules").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                axum::http::Request::delete("/api/v1/rules/everything")
                    .header("authorization", "Bearer forged")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rules_api_with_token_but_no_client() {
        let state = state("", Some(identity("alice", "example-app"))).await;
        let app = build_router(state, ListenerScheme::Http);

        let response = app
            .clone()
            .oneshot(get_with_token("/api/v1/rules"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app
            .oneshot(
                axum::http::Request::post("/api/v1/rules")
                    .header("authorization", "Bearer token")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rules_api_checks_audience() {
        let state = state("", Some(identity("alice", "other-app"))).await;
        let app = build_router(state, ListenerScheme::Http);
        let response = app.oneshot(get_with_token("/api/v1/rules")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_502() {
        let state = state(
            "p, alice, ds1, c/ns, read",
            Some(identity("alice", "example-app")),
        )
        .await;
        let app = build_router(state, ListenerScheme::Http);
        let response = app.oneshot(get_with_token("/api/v1/query?query=up")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn forwards_constrained_request_upstream() {
        let mut state = state(
            "p, alice, ds1, c/ns, read",
            Some(identity("alice", "example-app")),
        )
        .await;
        let mut upstream = MockUpstream::new();
        upstream
            .expect_forward()
            .withf(|req| {
                req.path == "/api/v1/query"
                    && req.query.as_deref() == Some("query=up%7Bnamespace%3D%22ns%22%7D")
                    && req.headers.get("authorization").is_none()
                    && req.scheme == ListenerScheme::Https
            })
            .times(1)
            .returning(|_| Ok(Response::new(Body::from("ok"))));
        state.upstream = Arc::new(upstream);

        let app = build_router(state, ListenerScheme::Https);
        let response = app.oneshot(get_with_token("/api/v1/query?query=up")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn denied_request_never_reaches_upstream() {
        let mut state = state(
            "p, alice, ds1, c/ns, read",
            Some(identity("mallory", "example-app")),
        )
        .await;
        let mut upstream = MockUpstream::new();
        upstream.expect_forward().never();
        state.upstream = Arc::new(upstream);

        let app = build_router(state, ListenerScheme::Http);
        let response = app.oneshot(get_with_token("/api/v1/query?query=up")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
