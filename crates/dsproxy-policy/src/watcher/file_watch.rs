//! inotify-driven reload trigger
//!
//! Watches the directories containing the model and policy files and signals
//! on writes, creates, and renames of those names. Kubernetes ConfigMap and
//! Secret volumes update by swapping a `..data` symlink, so that name counts
//! as a change too. Bursts of events are coalesced into one signal.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use super::WatchStrategy;
use crate::error::Result;

/// Events arriving within this window after the first are folded into one signal
const COALESCE_WINDOW: Duration = Duration::from_millis(100);

/// Symlink swapped by kubelet when a projected volume changes
const KUBELET_DATA_DIR: &str = "..data";

/// Signals when one of a set of files changes
pub struct FileWatch {
    names: HashSet<OsString>,
    #[cfg(target_os = "linux")]
    events: inotify_impl::Events,
}

impl FileWatch {
    /// Watch `paths`; fails if change notification cannot be set up
    pub fn new<I, P>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let paths: Vec<PathBuf> = paths.into_iter().map(|p| p.as_ref().to_path_buf()).collect();
        let mut names: HashSet<OsString> = paths
            .iter()
            .filter_map(|p| p.file_name().map(OsString::from))
            .collect();
        names.insert(OsString::from(KUBELET_DATA_DIR));

        let mut dirs: Vec<PathBuf> = Vec::new();
        for path in &paths {
            let dir = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }

        #[cfg(target_os = "linux")]
        {
            let events = inotify_impl::Events::new(&dirs)?;
            Ok(Self { names, events })
        }

        #[cfg(not(target_os = "linux"))]
        {
            let _ = (names, dirs);
            Err(crate::error::PolicyError::Watch(
                "file change notification is only supported on Linux".into(),
            ))
        }
    }

    #[cfg(target_os = "linux")]
    fn is_relevant(&self, name: Option<&std::ffi::OsStr>) -> bool {
        name.is_some_and(|n| self.names.contains(n))
    }
}

#[async_trait]
impl WatchStrategy for FileWatch {
    fn name(&self) -> &'static str {
        "file-watch"
    }

    #[cfg(target_os = "linux")]
    async fn changed(&mut self) -> Result<()> {
        loop {
            let event = self.events.next().await?;
            if self.is_relevant(event.as_deref()) {
                tracing::trace!(file = ?event, "Policy file event");
                break;
            }
        }

        while let Ok(next) = tokio::time::timeout(COALESCE_WINDOW, self.events.next()).await {
            next?;
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    async fn changed(&mut self) -> Result<()> {
        Err(crate::error::PolicyError::Watch("file change notification unavailable".into()))
    }
}

#[cfg(target_os = "linux")]
mod inotify_impl {
    use std::ffi::OsString;
    use std::path::PathBuf;
    use std::pin::Pin;

    use futures::{Stream, StreamExt};
    use inotify::{EventOwned, Inotify, WatchMask};
    use tracing::debug;

    use crate::error::{PolicyError, Result};

    type EventStream = Pin<Box<dyn Stream<Item = std::io::Result<EventOwned>> + Send>>;

    pub(super) struct Events {
        stream: EventStream,
    }

    impl Events {
        pub(super) fn new(dirs: &[PathBuf]) -> Result<Self> {
            let inotify = Inotify::init()
                .map_err(|e| PolicyError::Watch(format!("inotify init: {}", e)))?;

            let mask = WatchMask::MODIFY
                | WatchMask::CLOSE_WRITE
                | WatchMask::CREATE
                | WatchMask::MOVED_TO;
            for dir in dirs {
                inotify.watches().add(dir, mask).map_err(|e| {
                    PolicyError::Watch(format!("watch {}: {}", dir.display(), e))
                })?;
                debug!(dir = %dir.display(), "Watching policy directory");
            }

            let stream = inotify
                .into_event_stream([0u8; 4096])
                .map_err(|e| PolicyError::Watch(format!("inotify stream: {}", e)))?;
            Ok(Self {
                stream: Box::pin(stream),
            })
        }

        /// Name of the next changed entry (None for events on the directory itself)
        pub(super) async fn next(&mut self) -> Result<Option<OsString>> {
            match self.stream.next().await {
                Some(Ok(event)) => Ok(event.name),
                Some(Err(e)) => Err(PolicyError::Watch(format!("inotify read: {}", e))),
                None => Err(PolicyError::Watch("inotify stream ended".into())),
            }
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::error::PolicyError;

    #[tokio::test]
    async fn signals_on_policy_write() {
        let dir = tempfile::tempdir().unwrap();
        let policy = dir.path().join("policy.csv");
        let model = dir.path().join("model.conf");
        std::fs::write(&policy, "").unwrap();

        let mut watch = FileWatch::new([&policy, &model]).unwrap();
        let writer = {
            let policy = policy.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                std::fs::write(&policy, "p, alice, ds1, c/n, read\n").unwrap();
            })
        };

        tokio::time::timeout(Duration::from_secs(5), watch.changed())
            .await
            .expect("change signalled")
            .unwrap();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn ignores_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        let policy = dir.path().join("policy.csv");
        std::fs::write(&policy, "").unwrap();

        let mut watch = FileWatch::new([&policy]).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        let result = tokio::time::timeout(Duration::from_millis(300), watch.changed()).await;
        assert!(result.is_err(), "unrelated file must not signal");
    }

    #[tokio::test]
    async fn rename_into_place_signals() {
        let dir = tempfile::tempdir().unwrap();
        let policy = dir.path().join("policy.csv");
        std::fs::write(&policy, "").unwrap();
        let mut watch = FileWatch::new([&policy]).unwrap();

        let staged = dir.path().join("staged.tmp");
        std::fs::write(&staged, "p, bob, ds1, c/n, read\n").unwrap();
        std::fs::rename(&staged, &policy).unwrap();

        tokio::time::timeout(Duration::from_secs(5), watch.changed())
            .await
            .expect("rename signalled")
            .unwrap();
    }

    #[test]
    fn missing_directory_fails_setup() {
        let result = FileWatch::new(["/nonexistent/dsproxy/policy.csv"]);
        assert!(matches!(result, Err(PolicyError::Watch(_))));
    }
}
