//! Authorization policy engine for dsproxy
//!
//! Rules are normalized into `(subject, domain, object, action)` tuples plus
//! `(member, group)` role links. The engine keeps the loaded rule set in an
//! immutable [`PolicySnapshot`] that is swapped atomically on reload, so
//! request handlers always evaluate against one complete rule set.
//!
//! # Components
//!
//! - [`PolicyEngine`] - evaluation and reload
//! - [`adapter`] - rule sources (flat files or `GrafanaDataSourceRule` objects)
//! - [`watcher`] - background reload triggers (inotify or polling)

#![deny(missing_docs)]

pub mod adapter;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod model;
pub mod snapshot;
pub mod tuple;
pub mod watcher;

pub use adapter::{FileAdapter, KubeAdapter, MemoryAdapter, PolicyAdapter};
pub use engine::{PolicyEngine, PolicySnapshot, ReloadStats};
pub use error::{PolicyError, Result};
pub use model::Model;
pub use snapshot::Snapshot;
pub use tuple::{LineKind, LineRef, PolicyLine, PolicySet, PolicyTuple, RoleLink};
pub use watcher::{FileWatch, Polling, PolicyWatcher, WatchStrategy};
