//! Namespace label injection for upstream-bound requests
//!
//! Each datasource type has a fixed table of endpoints it may reach. Query
//! endpoints get their selector parameter rewritten; metadata endpoints pass
//! through; anything else is rejected so an unconstrained read can never
//! reach the backend.

mod selector;

pub use selector::{inject, namespace_matcher, Dialect, SelectorError};

use crate::context::DatasourceType;
use crate::error::{Error, Result};

/// Labels pinned per backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionConfig {
    /// Label injected into PromQL selectors
    pub prometheus_label: String,
    /// Label injected into LogQL stream selectors
    pub loki_label: String,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            prometheus_label: "namespace".to_string(),
            loki_label: "kubernetes_namespace_name".to_string(),
        }
    }
}

impl InjectionConfig {
    /// Label for `dialect`
    pub fn label(&self, dialect: Dialect) -> &str {
        match dialect {
            Dialect::PromQl => &self.prometheus_label,
            Dialect::LogQl => &self.loki_label,
        }
    }
}

/// How one request is constrained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewritePlan {
    /// Endpoint returns no tenant data
    Passthrough,
    /// Rewrite every `param` value; add one if none is present and
    /// `add_if_absent` is set
    Rewrite {
        /// Query language of the parameter
        dialect: Dialect,
        /// Parameter name
        param: &'static str,
        /// Whether an absent parameter is added as a bare selector
        add_if_absent: bool,
    },
}

const QUERY: &str = "query";
const MATCH: &str = "match[]";

fn rewrite(dialect: Dialect, param: &'static str, add_if_absent: bool) -> Option<RewritePlan> {
    Some(RewritePlan::Rewrite {
        dialect,
        param,
        add_if_absent,
    })
}

/// Pick the plan for `path` on a datasource of type `kind`
pub fn plan_for(kind: &DatasourceType, path: &str) -> Result<RewritePlan> {
    let path = match path.trim_end_matches('/') {
        "" => "/",
        p => p,
    };
    let plan = match kind {
        DatasourceType::Prometheus => prometheus_plan(path),
        DatasourceType::Loki => loki_plan(path),
        DatasourceType::Unsupported(other) => {
            return Err(Error::Forbidden(format!("unsupported datasource type '{}'", other)));
        }
    };
    plan.ok_or_else(|| Error::Forbidden(format!("path '{}' is not allowed for {}", path, kind)))
}

fn prometheus_plan(path: &str) -> Option<RewritePlan> {
    use Dialect::PromQl;
    match path {
        "/api/v1/query" | "/api/v1/query_range" | "/api/v1/query_exemplars" => {
            rewrite(PromQl, QUERY, false)
        }
        "/api/v1/series" | "/api/v1/labels" | "/federate" => rewrite(PromQl, MATCH, true),
        "/api/v1/status/buildinfo" | "/api/v1/metadata" => Some(RewritePlan::Passthrough),
        p if is_label_values(p, "/api/v1/label/") => rewrite(PromQl, MATCH, true),
        _ => None,
    }
}

fn loki_plan(path: &str) -> Option<RewritePlan> {
    use Dialect::LogQl;
    match path {
        "/loki/api/v1/query"
        | "/loki/api/v1/query_range"
        | "/loki/api/v1/index/stats"
        | "/loki/api/v1/index/volume" => rewrite(LogQl, QUERY, false),
        "/loki/api/v1/series" => rewrite(LogQl, MATCH, true),
        "/loki/api/v1/labels" => rewrite(LogQl, QUERY, true),
        "/loki/api/v1/status/buildinfo" => Some(RewritePlan::Passthrough),
        p if is_label_values(p, "/loki/api/v1/label/") => rewrite(LogQl, QUERY, true),
        _ => None,
    }
}

/// `<prefix><name>/values` with a single-segment name
fn is_label_values(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix)
        .and_then(|rest| rest.strip_suffix("/values"))
        .is_some_and(|name| !name.is_empty() && !name.contains('/'))
}

/// Rewrites urlencoded parameter lists for one request
#[derive(Debug, Clone)]
pub struct ParamRewriter<'a> {
    dialect: Dialect,
    param: &'static str,
    label: &'a str,
    matcher: String,
}

impl<'a> ParamRewriter<'a> {
    /// Rewriter pinning `label` to `namespace`
    pub fn new(dialect: Dialect, param: &'static str, label: &'a str, namespace: &str) -> Self {
        Self {
            dialect,
            param,
            label,
            matcher: namespace_matcher(label, namespace),
        }
    }

    /// Bare selector used when a parameter has to be added
    pub fn bare_selector(&self) -> String {
        format!("{{{}}}", self.matcher)
    }

    /// Rewrite an `application/x-www-form-urlencoded` string
    ///
    /// Returns the new encoding and whether the parameter was present.
    pub fn rewrite_encoded(&self, encoded: &str, add_if_absent: bool) -> Result<(String, bool)> {
        let mut found = false;
        let mut pairs: Vec<(String, String)> = Vec::new();
        for (key, value) in form_urlencoded::parse(encoded.as_bytes()) {
            if key == self.param {
                found = true;
                let rewritten = inject(self.dialect, &value, self.label, &self.matcher)
                    .map_err(|e| Error::BadRequest(format!("invalid {}: {}", self.param, e)))?;
                pairs.push((key.into_owned(), rewritten));
            } else {
                pairs.push((key.into_owned(), value.into_owned()));
            }
        }
        if !found && add_if_absent {
            pairs.push((self.param.to_string(), self.bare_selector()));
        }

        let encoded = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        Ok((encoded, found))
    }
}
