//! URL-pattern-matched sets of resources.

use crystal_common::UrlPattern;

use crate::model::resource::ResourceId;
use crate::model::root_resource::RootResourceId;
use crate::task::TaskId;

pub type GroupId = i64;

/// The page (or group of pages) whose download reveals a group's members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSource {
    RootResource(RootResourceId),
    Group(GroupId),
}

impl GroupSource {
    pub(crate) fn to_columns(source: Option<GroupSource>) -> (Option<&'static str>, Option<i64>) {
        match source {
            None => (None, None),
            Some(GroupSource::RootResource(id)) => (Some("root_resource"), Some(id)),
            Some(GroupSource::Group(id)) => (Some("resource_group"), Some(id)),
        }
    }
}

/// A set of resources matching a URL pattern. Membership is derived,
/// computed lazily by scanning existing resources against the pattern and
/// extended as new resources instantiate.
#[derive(Debug, Clone)]
pub struct ResourceGroup {
    pub id: GroupId,
    /// Display name; may be empty.
    pub name: String,
    pub(crate) pattern: UrlPattern,
    pub source: Option<GroupSource>,
    /// Members of this group are not downloaded automatically when embedded
    /// in another page. Useful to exclude ads and other unwanted resources.
    pub do_not_download: bool,
    /// Lazily-computed member cache, in discovery order.
    pub(crate) members: Option<Vec<ResourceId>>,
    /// Member-download tasks watching for newly-discovered members.
    pub(crate) member_watchers: Vec<TaskId>,
}

impl ResourceGroup {
    pub fn url_pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Name shown in user interfaces: the name, or the pattern if unnamed.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.pattern.as_str()
        } else {
            &self.name
        }
    }

    pub fn contains_url(&self, url: &str) -> bool {
        self.pattern.matches(url)
    }
}
