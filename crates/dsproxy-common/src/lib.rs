//! Common types for dsproxy: the rule CRD, shared constants, and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod telemetry;

/// Header carrying the datasource identifier (policy domain)
pub const DATASOURCE_UID_HEADER: &str = "x-datasource-uid";

/// Header carrying the datasource type (selects the query rewrite strategy)
pub const DATASOURCE_TYPE_HEADER: &str = "x-datasource-type";

/// Header carrying an OIDC ID token; takes precedence over `Authorization`
pub const ID_TOKEN_HEADER: &str = "x-id-token";

/// Default directory holding `model.conf` and `policy.csv`
pub const DEFAULT_POLICY_PATH: &str = "/etc/dsproxy/policy";

/// File name of the authorization model inside the policy directory
pub const MODEL_FILE_NAME: &str = "model.conf";

/// File name of the policy tuples inside the policy directory
pub const POLICY_FILE_NAME: &str = "policy.csv";

/// Namespace used for rules created without an explicit namespace
pub const DEFAULT_RULE_NAMESPACE: &str = "default";

/// Action bound into the request pipeline when none is configured
pub const DEFAULT_ACTION: &str = "read";
