//! A single archived URL.

use crate::task::TaskId;

pub type ResourceId = i64;

/// One archived URL. The URL is unique within a project and fragment-free.
#[derive(Debug, Clone)]
pub struct Resource {
    pub id: ResourceId,
    pub url: String,
    /// Session-only: a download already ran for this resource, so later
    /// download requests can reuse its result without network IO.
    pub(crate) already_downloaded_this_session: bool,
    /// Session-only: known to have no revisions, so readers can skip the
    /// database entirely.
    pub(crate) definitely_has_no_revisions: bool,
    /// In-flight download task for this resource, shared with later callers
    /// until it completes.
    pub(crate) download_task: Option<TaskId>,
    /// In-flight body-download task, shared likewise.
    pub(crate) download_body_task: Option<TaskId>,
}

impl Resource {
    pub(crate) fn new(id: ResourceId, url: String, has_revisions_unknown: bool) -> Resource {
        Resource {
            id,
            url,
            already_downloaded_this_session: false,
            // A freshly-inserted resource definitely has no revisions yet;
            // one loaded from disk must check the database.
            definitely_has_no_revisions: !has_revisions_unknown,
            download_task: None,
            download_body_task: None,
        }
    }

    pub fn already_downloaded_this_session(&self) -> bool {
        self.already_downloaded_this_session
    }
}
