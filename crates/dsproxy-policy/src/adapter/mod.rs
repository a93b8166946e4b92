//! Rule sources for the policy engine
//!
//! Every source implements [`PolicyAdapter`]. The file source is read-write;
//! the cluster source is read-only and rejects mutations with
//! [`PolicyError::NotImplemented`](crate::PolicyError::NotImplemented).

mod cluster;
mod file;

pub use cluster::{rules_to_policy, KubeAdapter};
pub use file::FileAdapter;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::tuple::{LineKind, PolicyLine, PolicySet};

/// A source of policy tuples and role links
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicyAdapter: Send + Sync {
    /// Read the complete rule set
    async fn load_policy(&self) -> Result<PolicySet>;

    /// Replace the stored rule set
    async fn save_policy(&self, rules: &PolicySet) -> Result<()>;

    /// Store one additional line
    async fn add_policy(&self, line: &PolicyLine) -> Result<()>;

    /// Delete one line
    async fn remove_policy(&self, line: &PolicyLine) -> Result<()>;

    /// Delete every line of `kind` whose fields from `field_index` on equal
    /// `values` (an empty value matches any field)
    async fn remove_filtered_policy(
        &self,
        kind: LineKind,
        field_index: usize,
        values: &[String],
    ) -> Result<()>;
}

/// In-memory rule source
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    rules: Mutex<PolicySet>,
}

impl MemoryAdapter {
    /// Create a source holding `rules`
    pub fn new(rules: PolicySet) -> Self {
        Self {
            rules: Mutex::new(rules),
        }
    }
}

#[async_trait]
impl PolicyAdapter for MemoryAdapter {
    async fn load_policy(&self) -> Result<PolicySet> {
        Ok(self.rules.lock().clone())
    }

    async fn save_policy(&self, rules: &PolicySet) -> Result<()> {
        *self.rules.lock() = rules.clone();
        Ok(())
    }

    async fn add_policy(&self, line: &PolicyLine) -> Result<()> {
        self.rules.lock().insert(line.clone());
        Ok(())
    }

    async fn remove_policy(&self, line: &PolicyLine) -> Result<()> {
        self.rules.lock().remove(line);
        Ok(())
    }

    async fn remove_filtered_policy(
        &self,
        kind: LineKind,
        field_index: usize,
        values: &[String],
    ) -> Result<()> {
        self.rules
            .lock()
            .retain(|l| !l.matches_filter(kind, field_index, values));
        Ok(())
    }
}
