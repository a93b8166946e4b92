//! Request pipeline for dsproxy
//!
//! Every proxied request passes through:
//!
//! 1. [`authn::authenticate`]: verify the caller token, check the audience,
//!    strip credentials
//! 2. [`authz::authorize`]: resolve the authorized `(cluster, namespace)`
//!    scope for the requested datasource; empty scope is a 403
//! 3. [`proxy::proxy_handler`]: inject the namespace matcher into the query
//!    and forward it upstream
//!
//! The server also exposes `/healthz` and a thin rule management API.

#![deny(missing_docs)]

pub mod auth;
pub mod auth_chain;
pub mod authn;
pub mod authz;
pub mod context;
pub mod error;
pub mod forwarder;
pub mod injection;
pub mod proxy;
pub mod rules_api;
pub mod sa_auth;
pub mod server;

pub use auth::{Identity, TokenVerifier, Verifier, VerifierConfig};
pub use auth_chain::AuthChain;
pub use context::{AuthorizedScope, DatasourceContext, DatasourceType, ScopeEntry};
pub use error::{Error, Result};
pub use forwarder::{
    Forwarder, ForwarderConfig, ListenerScheme, Upstream, UpstreamRequest, UpstreamTarget,
};
pub use injection::InjectionConfig;
pub use sa_auth::TokenReviewVerifier;
pub use server::{build_router, serve, AppState, ServerConfig, TlsFiles};
