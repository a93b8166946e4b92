//! Cluster-backed rule source (`GrafanaDataSourceRule` objects)
//!
//! Each rule becomes one tuple per permission per subject:
//! `p, <user|group>, <dataSourceId>, <resource>, <action>`.
//! The source is read-only; rules are managed through the Kubernetes API.

use async_trait::async_trait;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, warn};

use dsproxy_common::crd::GrafanaDataSourceRule;

use super::PolicyAdapter;
use crate::error::{PolicyError, Result};
use crate::tuple::{LineKind, PolicyLine, PolicySet, PolicyTuple};

/// Lists `GrafanaDataSourceRule` objects and projects them into tuples
#[derive(Clone)]
pub struct KubeAdapter {
    api: Api<GrafanaDataSourceRule>,
}

impl KubeAdapter {
    /// Watch rules in every namespace
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }

    /// Watch rules in a single namespace
    pub fn namespaced(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

/// Project rules into a policy set, in rule then permission order.
///
/// Rules naming neither a user nor a group are skipped.
pub fn rules_to_policy(rules: &[GrafanaDataSourceRule]) -> PolicySet {
    let mut set = PolicySet::new();
    let mut skipped = 0;

    for rule in rules {
        let subjects = rule.spec.subjects();
        if subjects.is_empty() {
            warn!(
                rule = %rule.name_any(),
                namespace = ?rule.namespace(),
                "Skipping rule without user or group"
            );
            skipped += 1;
            continue;
        }

        for permission in &rule.spec.permissions {
            if permission.action.is_empty() || permission.resource.is_empty() {
                warn!(rule = %rule.name_any(), "Skipping permission with empty field");
                continue;
            }
            for subject in &subjects {
                set.add_tuple(PolicyTuple::new(
                    *subject,
                    rule.spec.data_source_id.as_str(),
                    permission.resource.as_str(),
                    permission.action.as_str(),
                ));
            }
        }
    }

    debug!(
        rules = rules.len(),
        skipped,
        tuples = set.tuples().len(),
        "Projected GrafanaDataSourceRules"
    );
    set
}

#[async_trait]
impl PolicyAdapter for KubeAdapter {
    async fn load_policy(&self) -> Result<PolicySet> {
        let list = self.api.list(&ListParams::default()).await?;
        Ok(rules_to_policy(&list.items))
    }

    async fn save_policy(&self, _rules: &PolicySet) -> Result<()> {
        Err(PolicyError::read_only("save_policy"))
    }

    async fn add_policy(&self, _line: &PolicyLine) -> Result<()> {
        Err(PolicyError::read_only("add_policy"))
    }

    async fn remove_policy(&self, _line: &PolicyLine) -> Result<()> {
        Err(PolicyError::read_only("remove_policy"))
    }

    async fn remove_filtered_policy(
        &self,
        _kind: LineKind,
        _field_index: usize,
        _values: &[String],
    ) -> Result<()> {
        Err(PolicyError::read_only("remove_filtered_policy"))
    }
}
