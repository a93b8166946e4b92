//! GrafanaDataSourceRule CRD
//!
//! A GrafanaDataSourceRule grants a user or group a set of `(action, resource)`
//! permissions on one datasource. The proxy projects every rule into policy
//! tuples of the form `p, <user|group>, <dataSourceId>, <resource>, <action>`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// GrafanaDataSourceRule grants access to cluster/namespace scopes of a datasource.
///
/// Example:
/// ```yaml
/// apiVersion: grafoo.cloudmonkey.org/v1alpha1
/// kind: GrafanaDataSourceRule
/// metadata:
///   name: team-a-metrics
///   namespace: monitoring
/// spec:
///   group: team-a
///   dataSourceId: prometheus-main
///   permissions:
///     - action: read
///       resource: cluster1/team-a
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "grafoo.cloudmonkey.org",
    version = "v1alpha1",
    kind = "GrafanaDataSourceRule",
    namespaced,
    status = "GrafanaDataSourceRuleStatus",
    printcolumn = r#"{"name":"User","type":"string","jsonPath":".spec.user"}"#,
    printcolumn = r#"{"name":"Group","type":"string","jsonPath":".spec.group"}"#,
    printcolumn = r#"{"name":"DataSource","type":"string","jsonPath":".spec.dataSourceId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GrafanaDataSourceRuleSpec {
    /// Subject the rule applies to (token subject claim)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Group the rule applies to (token groups claim)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Datasource identifier, or `*` for every datasource
    pub data_source_id: String,

    /// Granted permissions
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

/// A single granted permission
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Permission {
    /// Action, e.g. `read`
    pub action: String,
    /// `cluster/namespace` pair; either side may contain `*`
    pub resource: String,
}

/// GrafanaDataSourceRule status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GrafanaDataSourceRuleStatus {
    /// Observed conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<RuleCondition>,
}

/// Condition reported on a rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    /// Condition type, e.g. `Ready`
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False` or `Unknown`
    pub status: String,
    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// RFC 3339 timestamp of the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl GrafanaDataSourceRuleSpec {
    /// Subjects (user and/or group) this rule grants to, user first
    pub fn subjects(&self) -> Vec<&str> {
        [self.user.as_deref(), self.group.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Check that the rule names at least one subject and one usable permission
    pub fn validate(&self) -> Result<(), String> {
        if self.subjects().is_empty() {
            return Err("rule must set user or group".to_string());
        }
        if self.data_source_id.is_empty() {
            return Err("dataSourceId is required".to_string());
        }
        if self.permissions.is_empty() {
            return Err("rule must declare at least one permission".to_string());
        }
        for permission in &self.permissions {
            if permission.action.is_empty() || permission.resource.is_empty() {
                return Err("permission action and resource must be non-empty".to_string());
            }
        }
        Ok(())
    }
}
