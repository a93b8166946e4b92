//! Policy engine
//!
//! Holds the loaded model and rule set as one immutable [`PolicySnapshot`].
//! Reload builds a complete new snapshot off to the side and swaps it in, so
//! a failed reload leaves the previous snapshot serving requests.
//!
//! A tuple `(s, d, o, a)` grants `(subject, domain, object, action)` when:
//! - `subject == s` or `subject` holds role `s` through `g` links,
//! - `d == domain` or `d == "*"`,
//! - `o` glob-matches `object` (see [`crate::matcher`]),
//! - `a == action`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::adapter::PolicyAdapter;
use crate::error::{PolicyError, Result};
use crate::matcher::glob_match;
use crate::model::Model;
use crate::snapshot::Snapshot;
use crate::tuple::{PolicySet, PolicyTuple, RoleLink};

/// Maximum number of `g` hops followed when checking role membership
pub const MAX_ROLE_DEPTH: usize = 10;

/// Wildcard domain
const ANY_DOMAIN: &str = "*";

// ============================================================================
// PolicySnapshot
// ============================================================================

/// Immutable view of one loaded rule set
#[derive(Debug, Default)]
pub struct PolicySnapshot {
    model: Model,
    rules: PolicySet,
    /// member -> groups it belongs to, in load order
    memberships: HashMap<String, Vec<String>>,
}

impl PolicySnapshot {
    /// Build a snapshot, rejecting role links the model does not declare
    pub fn build(model: Model, rules: PolicySet) -> Result<Self> {
        if !model.has_roles && !rules.roles().is_empty() {
            return Err(PolicyError::ModelParse(
                "policy contains `g` lines but the model has no [role_definition]".into(),
            ));
        }

        let mut memberships: HashMap<String, Vec<String>> = HashMap::new();
        for RoleLink { member, group } in rules.roles() {
            memberships
                .entry(member.clone())
                .or_default()
                .push(group.clone());
        }

        Ok(Self {
            model,
            rules,
            memberships,
        })
    }

    /// Model this snapshot was built with
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Loaded tuples in load order
    pub fn tuples(&self) -> &[PolicyTuple] {
        self.rules.tuples()
    }

    /// Loaded role links in load order
    pub fn roles(&self) -> &[RoleLink] {
        self.rules.roles()
    }

    /// Whether any tuple grants the request
    pub fn evaluate(&self, subject: &str, domain: &str, object: &str, action: &str) -> bool {
        self.tuples().iter().any(|t| {
            t.action == action
                && domain_matches(&t.domain, domain)
                && glob_match(&t.object, object)
                && self.has_role(subject, &t.subject)
        })
    }

    /// Whether `subject` is `role` or reaches it through role links.
    ///
    /// Follows at most [`MAX_ROLE_DEPTH`] hops; cycles are tolerated.
    pub fn has_role(&self, subject: &str, role: &str) -> bool {
        if subject == role {
            return true;
        }

        let mut seen: HashSet<&str> = HashSet::from([subject]);
        let mut frontier: Vec<&str> = vec![subject];
        for _ in 0..MAX_ROLE_DEPTH {
            let mut next = Vec::new();
            for member in frontier {
                for group in self.memberships.get(member).into_iter().flatten() {
                    if group == role {
                        return true;
                    }
                    if seen.insert(group.as_str()) {
                        next.push(group.as_str());
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        false
    }

    /// Objects granted to any of `subjects` for `(domain, action)`,
    /// deduplicated, in tuple load order
    pub fn resolve(&self, subjects: &[&str], domain: &str, action: &str) -> Vec<String> {
        let mut objects: Vec<String> = Vec::new();
        for tuple in self.tuples() {
            if tuple.action != action || !domain_matches(&tuple.domain, domain) {
                continue;
            }
            let granted = subjects.iter().any(|s| self.has_role(s, &tuple.subject));
            if granted && !objects.contains(&tuple.object) {
                objects.push(tuple.object.clone());
            }
        }
        objects
    }
}

fn domain_matches(pattern: &str, domain: &str) -> bool {
    pattern == domain || pattern == ANY_DOMAIN
}

// ============================================================================
// PolicyEngine
// ============================================================================

/// Counts from a completed reload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadStats {
    /// Tuples now loaded
    pub tuples: usize,
    /// Role links now loaded
    pub roles: usize,
}

/// Policy engine shared by request handlers (readers) and the watcher (writer)
pub struct PolicyEngine {
    snapshot: Snapshot<PolicySnapshot>,
    adapter: Arc<dyn PolicyAdapter>,
    /// Model file; the built-in model is used when unset or missing
    model_path: Option<PathBuf>,
    /// Set once the first load succeeds
    ready: AtomicBool,
}

impl PolicyEngine {
    /// Create an engine with nothing loaded (denies everything until reload)
    pub fn new(adapter: Arc<dyn PolicyAdapter>, model_path: Option<PathBuf>) -> Self {
        Self {
            snapshot: Snapshot::default(),
            adapter,
            model_path,
            ready: AtomicBool::new(false),
        }
    }

    /// Create an engine and perform the initial load
    pub async fn load(adapter: Arc<dyn PolicyAdapter>, model_path: Option<PathBuf>) -> Result<Self> {
        let engine = Self::new(adapter, model_path);
        engine.reload().await?;
        Ok(engine)
    }

    /// Source the engine reloads from
    pub fn adapter(&self) -> &Arc<dyn PolicyAdapter> {
        &self.adapter
    }

    /// Whether a rule set has been loaded successfully at least once
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Current snapshot; hold it to evaluate several queries consistently
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.snapshot.load()
    }

    /// Replace the rule set, keeping the current model.
    ///
    /// The swap only happens if the new set is valid.
    pub fn load_rules(&self, rules: PolicySet) -> Result<ReloadStats> {
        let model = self.snapshot.load().model().clone();
        self.install(model, rules)
    }

    /// Reload the model and rules from their sources.
    ///
    /// On error the previous snapshot stays active.
    #[instrument(skip(self))]
    pub async fn reload(&self) -> Result<ReloadStats> {
        let model = match &self.model_path {
            Some(path) => Model::load(path).await?,
            None => Model::default(),
        };
        let rules = self.adapter.load_policy().await?;
        let stats = self.install(model, rules)?;
        info!(
            tuples = stats.tuples,
            roles = stats.roles,
            "Reloaded authorization policy"
        );
        Ok(stats)
    }

    /// See [`PolicySnapshot::evaluate`]
    pub fn evaluate(&self, subject: &str, domain: &str, object: &str, action: &str) -> bool {
        self.snapshot.load().evaluate(subject, domain, object, action)
    }

    /// See [`PolicySnapshot::has_role`]
    pub fn has_role(&self, subject: &str, role: &str) -> bool {
        self.snapshot.load().has_role(subject, role)
    }

    /// Copy of every loaded tuple
    pub fn all_tuples(&self) -> Vec<PolicyTuple> {
        self.snapshot.load().tuples().to_vec()
    }

    /// See [`PolicySnapshot::resolve`]
    pub fn resolve(&self, subjects: &[&str], domain: &str, action: &str) -> Vec<String> {
        self.snapshot.load().resolve(subjects, domain, action)
    }

    fn install(&self, model: Model, rules: PolicySet) -> Result<ReloadStats> {
        let stats = ReloadStats {
            tuples: rules.tuples().len(),
            roles: rules.roles().len(),
        };
        let next = PolicySnapshot::build(model, rules)?;
        self.snapshot.swap(next);
        self.ready.store(true, Ordering::Release);
        debug!(tuples = stats.tuples, roles = stats.roles, "Swapped policy snapshot");
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MemoryAdapter, MockPolicyAdapter};
    use crate::model::DEFAULT_MODEL;

    fn engine(text: &str) -> PolicyEngine {
        let engine = PolicyEngine::new(Arc::new(MemoryAdapter::default()), None);
        engine
            .load_rules(PolicySet::parse(text).expect("parse"))
            .expect("load");
        engine
    }

    #[test]
    fn empty_engine_denies() {
        let engine = PolicyEngine::new(Arc::new(MemoryAdapter::default()), None);
        assert!(!engine.is_ready());
        assert!(!engine.evaluate("alice", "ds1", "cluster1/default", "read"));
        assert!(engine.all_tuples().is_empty());
    }

    #[test]
    fn exact_tuple_grants() {
        let engine = engine("p, alice, ds1, cluster1/default, read");
        assert!(engine.evaluate("alice", "ds1", "cluster1/default", "read"));
        assert!(!engine.evaluate("alice", "ds1", "cluster1/default", "write"));
        assert!(!engine.evaluate("alice", "ds2", "cluster1/default", "read"));
        assert!(!engine.evaluate("bob", "ds1", "cluster1/default", "read"));
    }

    #[test]
    fn wildcard_domain_matches_any_datasource() {
        let engine = engine("p, admin, *, */*, read");
        for ds in ["anything", "ds1", ""] {
            assert!(engine.evaluate("admin", ds, "cluster9/kube-system", "read"));
        }
    }

    #[test]
    fn literal_domain_is_not_a_pattern() {
        let engine = engine("p, alice, ds-*, c/n, read");
        assert!(!engine.evaluate("alice", "ds-1", "c/n", "read"));
        assert!(engine.evaluate("alice", "ds-*", "c/n", "read"));
    }

    #[test]
    fn role_inheritance_composes_with_tuples() {
        let engine = engine("p, team-a, ds1, cluster1/*, read\ng, alice, team-a");
        assert!(engine.has_role("alice", "team-a"));
        assert!(engine.evaluate("alice", "ds1", "cluster1/monitoring", "read"));
        assert!(!engine.evaluate("alice", "ds1", "cluster2/monitoring", "read"));
    }

    #[test]
    fn role_inheritance_is_transitive() {
        let engine = engine("p, org, *, */*, read\ng, alice, team\ng, team, org");
        assert!(engine.has_role("alice", "org"));
        assert!(engine.evaluate("alice", "x", "c/n", "read"));
    }

    #[test]
    fn role_cycles_terminate() {
        let engine = engine("g, a, b\ng, b, a\ng, b, c");
        assert!(engine.has_role("a", "c"));
        assert!(!engine.has_role("a", "d"));
    }

    #[test]
    fn role_depth_is_bounded() {
        let mut text = String::new();
        for i in 0..12 {
            text.push_str(&format!("g, r{}, r{}\n", i, i + 1));
        }
        let engine = engine(&text);
        assert!(engine.has_role("r0", "r10"));
        assert!(!engine.has_role("r0", "r12"));
    }

    #[test]
    fn resolve_deduplicates_in_load_order() {
        let engine = engine(
            "p, alice, ds1, cluster1/ns2, read\n\
             p, team, ds1, cluster1/ns1, read\n\
             p, alice, *, cluster1/ns2, read\n\
             p, alice, ds1, cluster1/ns3, write\n\
             p, alice, ds2, cluster1/ns4, read\n\
             g, alice, team",
        );
        assert_eq!(
            engine.resolve(&["alice"], "ds1", "read"),
            vec!["cluster1/ns2", "cluster1/ns1"]
        );
    }

    #[test]
    fn resolve_considers_every_group() {
        let engine = engine("p, ops, ds1, c/ops, read\np, dev, ds1, c/dev, read");
        assert_eq!(
            engine.resolve(&["carol", "dev", "ops"], "ds1", "read"),
            vec!["c/ops", "c/dev"]
        );
        assert!(engine.resolve(&["carol"], "ds1", "read").is_empty());
    }

    #[test]
    fn load_rules_is_idempotent() {
        let text = "p, alice, ds1, c/a, read\np, alice, ds1, c/b, read\ng, bob, alice";
        let engine = engine(text);
        let first = engine.resolve(&["bob"], "ds1", "read");
        engine.load_rules(PolicySet::parse(text).unwrap()).unwrap();
        assert_eq!(engine.resolve(&["bob"], "ds1", "read"), first);
        assert_eq!(engine.all_tuples().len(), 2);
    }

    #[test]
    fn snapshot_is_stable_across_swap() {
        let engine = engine("p, alice, ds1, c/a, read");
        let held = engine.snapshot();
        engine.load_rules(PolicySet::new()).unwrap();
        assert!(held.evaluate("alice", "ds1", "c/a", "read"));
        assert!(!engine.evaluate("alice", "ds1", "c/a", "read"));
    }

    #[tokio::test]
    async fn reload_pulls_from_adapter() {
        let mut adapter = MockPolicyAdapter::new();
        adapter
            .expect_load_policy()
            .times(1)
            .returning(|| Ok(PolicySet::parse("p, alice, ds1, c/n, read").unwrap()));

        let engine = PolicyEngine::new(Arc::new(adapter), None);
        let stats = engine.reload().await.unwrap();
        assert!(engine.is_ready());
        assert_eq!(stats, ReloadStats { tuples: 1, roles: 0 });
        assert!(engine.evaluate("alice", "ds1", "c/n", "read"));
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_snapshot() {
        let mut adapter = MockPolicyAdapter::new();
        let mut calls = 0;
        adapter.expect_load_policy().times(2).returning(move || {
            calls += 1;
            if calls == 1 {
                Ok(PolicySet::parse("p, alice, ds1, c/n, read").unwrap())
            } else {
                Err(PolicyError::Watch("source unreachable".into()))
            }
        });

        let engine = PolicyEngine::load(Arc::new(adapter), None).await.unwrap();
        assert!(engine.reload().await.is_err());
        assert!(engine.evaluate("alice", "ds1", "c/n", "read"));
    }

    #[tokio::test]
    async fn malformed_model_file_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("model.conf");
        std::fs::write(&model_path, DEFAULT_MODEL).unwrap();

        let adapter = MemoryAdapter::new(PolicySet::parse("p, alice, ds1, c/n, read").unwrap());
        let engine = PolicyEngine::load(Arc::new(adapter), Some(model_path.clone()))
            .await
            .unwrap();

        std::fs::write(&model_path, "[request_definition]\nr = sub, obj\n").unwrap();
        assert!(matches!(
            engine.reload().await,
            Err(PolicyError::ModelParse(_))
        ));
        assert!(engine.evaluate("alice", "ds1", "c/n", "read"));
    }

    #[test]
    fn role_links_require_role_definition() {
        let model = Model {
            has_roles: false,
            ..Model::default()
        };
        let rules = PolicySet::parse("g, alice, admins").unwrap();
        assert!(PolicySnapshot::build(model, rules).is_err());
    }
}
