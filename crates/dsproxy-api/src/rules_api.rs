//! Rule management API over `GrafanaDataSourceRule` objects
//!
//! List, create, and delete only; the policy watcher picks up changes on its
//! next poll. The router mounts these behind token verification; there is no
//! per-rule authorization beyond that.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client};
use serde::Deserialize;
use tracing::info;

use dsproxy_common::crd::{GrafanaDataSourceRule, GrafanaDataSourceRuleSpec};
use dsproxy_common::DEFAULT_RULE_NAMESPACE;

use crate::error::{Error, Result};
use crate::server::AppState;

/// `?namespace=` filter
#[derive(Debug, Default, Deserialize)]
pub struct NamespaceQuery {
    /// Target namespace
    pub namespace: Option<String>,
}

/// Create payload: a rule object; `apiVersion`/`kind` are optional
#[derive(Debug, Deserialize)]
struct NewRule {
    #[serde(default)]
    metadata: ObjectMeta,
    spec: GrafanaDataSourceRuleSpec,
}

fn client(state: &AppState) -> Result<Client> {
    state
        .kube
        .clone()
        .ok_or_else(|| Error::ServiceUnavailable("no Kubernetes client configured".into()))
}

/// `GET /api/v1/rules`
pub async fn list_rules(
    State(state): State<AppState>,
    Query(query): Query<NamespaceQuery>,
) -> Result<Json<Vec<GrafanaDataSourceRule>>> {
    let client = client(&state)?;
    let api: Api<GrafanaDataSourceRule> = match query.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => Api::namespaced(client, ns),
        _ => Api::all(client),
    };
    let rules = api.list(&ListParams::default()).await?;
    Ok(Json(rules.items))
}

/// `POST /api/v1/rules`
pub async fn create_rule(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<GrafanaDataSourceRule>)> {
    let rule = parse_new_rule(&body)?;
    let client = client(&state)?;

    let namespace = rule
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| DEFAULT_RULE_NAMESPACE.to_string());
    let api: Api<GrafanaDataSourceRule> = Api::namespaced(client, &namespace);
    let created = api.create(&PostParams::default(), &rule).await?;

    info!(
        name = ?created.metadata.name,
        namespace = %namespace,
        datasource = %created.spec.data_source_id,
        "Created GrafanaDataSourceRule"
    );
    Ok((StatusCode::CREATED, Json(created)))
}

/// `DELETE /api/v1/rules/{name}?namespace=`
pub async fn delete_rule(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<NamespaceQuery>,
) -> Result<StatusCode> {
    let client = client(&state)?;
    let namespace = query
        .namespace
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| DEFAULT_RULE_NAMESPACE.to_string());
    let api: Api<GrafanaDataSourceRule> = Api::namespaced(client, &namespace);
    api.delete(&name, &DeleteParams::default()).await?;

    info!(name = %name, namespace = %namespace, "Deleted GrafanaDataSourceRule");
    Ok(StatusCode::NO_CONTENT)
}

/// Decode and validate a create payload
fn parse_new_rule(body: &[u8]) -> Result<GrafanaDataSourceRule> {
    let new: NewRule = serde_json::from_slice(body)
        .map_err(|e| Error::BadRequest(format!("invalid rule payload: {}", e)))?;
    new.spec.validate().map_err(Error::BadRequest)?;

    let has_name = new.metadata.name.as_deref().is_some_and(|n| !n.is_empty())
        || new.metadata.generate_name.as_deref().is_some_and(|n| !n.is_empty());
    if !has_name {
        return Err(Error::BadRequest("metadata.name is required".into()));
    }

    let mut metadata = new.metadata;
    if metadata.namespace.as_deref().is_none_or(str::is_empty) {
        metadata.namespace = Some(DEFAULT_RULE_NAMESPACE.to_string());
    }

    Ok(GrafanaDataSourceRule {
        metadata,
        spec: new.spec,
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rule_and_defaults_namespace() {
        let body = br#"{
            "apiVersion": "grafoo.cloudmonkey.org/v1alpha1",
            "kind": "GrafanaDataSourceRule",
            "metadata": {"name": "alice-ds1"},
            "spec": {
                "user": "alice",
                "dataSourceId": "ds1",
                "permissions": [{"action": "read", "resource": "cluster1/default"}]
            }
        }"#;
        let rule = parse_new_rule(body).unwrap();
        assert_eq!(rule.metadata.name.as_deref(), Some("alice-ds1"));
        assert_eq!(rule.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(rule.spec.user.as_deref(), Some("alice"));
    }

    #[test]
    fn keeps_explicit_namespace() {
        let body = br#"{
            "metadata": {"name": "team", "namespace": "monitoring"},
            "spec": {"group": "team-a", "dataSourceId": "*",
                     "permissions": [{"action": "read", "resource": "*/*"}]}
        }"#;
        let rule = parse_new_rule(body).unwrap();
        assert_eq!(rule.metadata.namespace.as_deref(), Some("monitoring"));
    }

    #[test]
    fn rejects_malformed_payloads() {
        let cases: [&[u8]; 4] = [
            b"not json",
            br#"{"metadata": {"name": "x"}, "spec": {"dataSourceId": "ds1",
                "permissions": [{"action": "read", "resource": "c/n"}]}}"#,
            br#"{"metadata": {"name": "x"}, "spec": {"user": "bob", "dataSourceId": "ds1"}}"#,
            br#"{"spec": {"user": "bob", "dataSourceId": "ds1",
                "permissions": [{"action": "read", "resource": "c/n"}]}}"#,
        ];
        for body in cases {
            let err = parse_new_rule(body).unwrap_err();
            assert!(matches!(err, Error::BadRequest(_)), "{:?}", err);
        }
    }
}
