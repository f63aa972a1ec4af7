//! crystal-core — the download engine behind the Crystal website archiver.
//!
//! A [`Project`](model::Project) is a directory holding a SQLite catalog of
//! resources, root resources, groups, and revisions, plus the revision body
//! files. Downloads run on a per-project scheduler that drives a tree of
//! tasks: download a body, parse its links, recursively download embedded
//! resources, and keep group memberships fresh while downloading members.

pub mod caffeination;
pub mod config;
pub mod error;
pub mod fetch;
pub mod model;
pub mod task;

mod progress;
mod store;

pub use caffeination::{Caffeination, KeepAwake};
pub use config::DownloadConfig;
pub use error::{CrystalError, Result};
pub use fetch::{FetchedBody, Fetcher, HttpFetcher};
pub use model::{
    DownloadHandle, GroupId, GroupSource, ModelEvent, PersistedError, Project, Resource,
    ResourceGroup, ResourceId, ResourceRevision, RevisionId, RevisionMetadata, RootResource,
    RootResourceId, TaskSnapshot,
};
pub use task::{BodyOutcome, BodyResult, Promise, PromiseFuture, SharedError, TaskEvent, TaskId};
