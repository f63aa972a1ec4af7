//! Persistent data model: projects, resources, root resources, groups,
//! and revisions. All mutations auto-save to the project catalog.

pub mod project;
pub mod resource;
pub mod resource_group;
pub mod revision;
pub mod root_resource;

pub use project::{DownloadHandle, ModelEvent, Project, TaskSnapshot, FILE_EXTENSION};
pub use resource::{Resource, ResourceId};
pub use resource_group::{GroupId, GroupSource, ResourceGroup};
pub use revision::{
    PersistedError, ResourceRevision, RevisionId, RevisionMetadata, MAX_REVISION_ID,
};
pub use root_resource::{RootResource, RootResourceId};
