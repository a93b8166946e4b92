//! Flat-file rule source (`policy.csv`)

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::PolicyAdapter;
use crate::error::{PolicyError, Result};
use crate::tuple::{LineKind, PolicyLine, PolicySet};

/// Reads and writes policy lines in a local file
#[derive(Debug, Clone)]
pub struct FileAdapter {
    path: PathBuf,
}

impl FileAdapter {
    /// Create an adapter for `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File this adapter reads
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<PolicySet> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| PolicyError::io(&self.path, e))?;
        PolicySet::parse(&text)
    }

    /// Write through a temporary file and rename, so readers never see a
    /// half-written file
    async fn write(&self, rules: &PolicySet) -> Result<()> {
        let tmp = self.path.with_extension("csv.tmp");
        tokio::fs::write(&tmp, rules.to_text())
            .await
            .map_err(|e| PolicyError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| PolicyError::io(&self.path, e))
    }
}

#[async_trait]
impl PolicyAdapter for FileAdapter {
    async fn load_policy(&self) -> Result<PolicySet> {
        let rules = self.read().await?;
        debug!(
            path = %self.path.display(),
            tuples = rules.tuples().len(),
            roles = rules.roles().len(),
            "Loaded policy file"
        );
        Ok(rules)
    }

    async fn save_policy(&self, rules: &PolicySet) -> Result<()> {
        self.write(rules).await
    }

    async fn add_policy(&self, line: &PolicyLine) -> Result<()> {
        if self.read().await?.lines().any(|l| &l == line) {
            return Ok(());
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| PolicyError::io(&self.path, e))?;
        file.write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(|e| PolicyError::io(&self.path, e))
    }

    async fn remove_policy(&self, line: &PolicyLine) -> Result<()> {
        let mut rules = self.read().await?;
        if rules.remove(line) {
            self.write(&rules).await?;
        }
        Ok(())
    }

    async fn remove_filtered_policy(
        &self,
        kind: LineKind,
        field_index: usize,
        values: &[String],
    ) -> Result<()> {
        let mut rules = self.read().await?;
        if rules.retain(|l| !l.matches_filter(kind, field_index, values)) > 0 {
            self.write(&rules).await?;
        }
        Ok(())
    }
}
