//! Custom Resource Definitions for dsproxy

mod datasource_rule;

pub use datasource_rule::{
    GrafanaDataSourceRule, GrafanaDataSourceRuleSpec, GrafanaDataSourceRuleStatus, Permission,
    RuleCondition,
};
