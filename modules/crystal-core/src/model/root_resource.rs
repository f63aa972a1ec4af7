//! User-pinned resources with display names.

use crate::model::resource::ResourceId;

pub type RootResourceId = i64;

/// A resource promoted by the user into a named top-level entity.
/// At most one root resource exists per resource.
#[derive(Debug, Clone)]
pub struct RootResource {
    pub id: RootResourceId,
    /// Display name; may be empty.
    pub name: String,
    pub resource_id: ResourceId,
}
