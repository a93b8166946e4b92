//! Per-request datasource context and authorized scope

use std::fmt;

use axum::http::HeaderMap;
use tracing::warn;

use dsproxy_common::{DATASOURCE_TYPE_HEADER, DATASOURCE_UID_HEADER};

/// Backend flavour, selecting the query rewrite strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasourceType {
    /// Prometheus-compatible metrics API (PromQL)
    Prometheus,
    /// Loki log API (LogQL)
    Loki,
    /// Anything else; always rejected
    Unsupported(String),
}

impl DatasourceType {
    /// Parse a type header value; a missing value means Prometheus
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("prometheus") => DatasourceType::Prometheus,
            Some("loki") => DatasourceType::Loki,
            Some(other) => DatasourceType::Unsupported(other.to_string()),
        }
    }
}

impl fmt::Display for DatasourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasourceType::Prometheus => f.write_str("prometheus"),
            DatasourceType::Loki => f.write_str("loki"),
            DatasourceType::Unsupported(other) => f.write_str(other),
        }
    }
}

/// Tenant context supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasourceContext {
    /// Datasource identifier (policy domain); empty when absent
    pub uid: String,
    /// Datasource type
    pub kind: DatasourceType,
}

impl DatasourceContext {
    /// Read the context headers
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        Self {
            uid: header(DATASOURCE_UID_HEADER)
                .map(|v| v.trim().to_string())
                .unwrap_or_default(),
            kind: DatasourceType::parse(header(DATASOURCE_TYPE_HEADER)),
        }
    }
}

/// One authorized `(cluster, namespace)` pair; either side may be a pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeEntry {
    /// Cluster name or pattern
    pub cluster: String,
    /// Namespace name or pattern
    pub namespace: String,
}

/// Resolved authorization for one request, in policy load order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizedScope {
    entries: Vec<ScopeEntry>,
}

impl AuthorizedScope {
    /// Build from tuple objects (`cluster/namespace`); a bare `*` means any
    /// cluster and namespace, other objects without `/` are skipped
    pub fn from_objects<I, S>(objects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries = Vec::new();
        for object in objects {
            let object = object.as_ref();
            let entry = match object.split_once('/') {
                Some((cluster, namespace)) if !cluster.is_empty() && !namespace.is_empty() => {
                    ScopeEntry {
                        cluster: cluster.to_string(),
                        namespace: namespace.to_string(),
                    }
                }
                None if object == "*" => ScopeEntry {
                    cluster: "*".to_string(),
                    namespace: "*".to_string(),
                },
                _ => {
                    warn!(object = %object, "Ignoring policy object that is not cluster/namespace");
                    continue;
                }
            };
            if !entries.contains(&entry) {
                entries.push(entry);
            }
        }
        Self { entries }
    }

    /// Authorized pairs
    pub fn entries(&self) -> &[ScopeEntry] {
        &self.entries
    }

    /// Whether nothing is authorized
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct namespaces, in order
    pub fn namespaces(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for entry in &self.entries {
            if !out.contains(&entry.namespace.as_str()) {
                out.push(&entry.namespace);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_type_defaults_to_prometheus() {
        assert_eq!(DatasourceType::parse(None), DatasourceType::Prometheus);
        assert_eq!(DatasourceType::parse(Some("Loki")), DatasourceType::Loki);
        assert_eq!(
            DatasourceType::parse(Some("tempo")),
            DatasourceType::Unsupported("tempo".into())
        );
    }

    #[test]
    fn context_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Datasource-Uid", "ds1".parse().unwrap());
        headers.insert("X-Datasource-Type", "loki".parse().unwrap());
        let ctx = DatasourceContext::from_headers(&headers);
        assert_eq!(ctx.uid, "ds1");
        assert_eq!(ctx.kind, DatasourceType::Loki);

        let ctx = DatasourceContext::from_headers(&HeaderMap::new());
        assert_eq!(ctx.uid, "");
        assert_eq!(ctx.kind, DatasourceType::Prometheus);
    }

    #[test]
    fn scope_splits_and_dedups() {
        let scope = AuthorizedScope::from_objects([
            "cluster1/ns1",
            "cluster1/ns2",
            "cluster1/ns1",
            "cluster2/ns1",
            "broken",
            "*",
        ]);
        assert_eq!(scope.entries().len(), 4);
        assert_eq!(scope.namespaces(), vec!["ns1", "ns2", "*"]);
    }

    #[test]
    fn namespace_may_not_be_empty() {
        assert!(AuthorizedScope::from_objects(["cluster1/", "/ns"]).is_empty());
    }

    #[test]
    fn namespace_keeps_remaining_slashes() {
        let scope = AuthorizedScope::from_objects(["c/a/b"]);
        assert_eq!(scope.entries()[0].namespace, "a/b");
    }
}
