//! Per-resource download tasks: body fetch, link parse, and the recursive
//! download of embedded resources.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crystal_common::http_date;
use crystal_links::Link;

use crate::config;
use crate::error::{CrystalError, Result};
use crate::model::project::{ModelEvent, ProjectCore, ProjectShared};
use crate::model::resource::ResourceId;
use crate::model::revision::{PersistedError, ResourceRevision, RevisionMetadata};
use crate::progress::Progress;
use crate::task::scheduler::{self, PostAction};
use crate::task::{
    finish_task, BodyOutcome, BodyResult, DownloadBodyState, DownloadResourceState,
    ParseLinksState, ParseOutcome, ParseResult, PendingCompletions, Promise, PromiseFuture,
    TaskId, TaskKind,
};

// === Task construction ===

/// Create (or reuse) the task that downloads a resource and, recursively,
/// its embedded resources. An in-flight task for the same resource is
/// returned to later callers instead of duplicating the work.
pub(crate) fn download_resource_task(
    shared: &ProjectShared,
    core: &mut ProjectCore,
    resource_id: ResourceId,
    needs_result: bool,
    is_embedded: bool,
    pending: &mut PendingCompletions,
) -> TaskId {
    if let Some(existing) = core.resources[&resource_id].download_task {
        if core.tree.exists(existing) && !core.tree.is_complete(existing) {
            return existing;
        }
    }

    let url = core.resources[&resource_id].url.clone();
    let already_downloaded = core.resources[&resource_id].already_downloaded_this_session;

    let task = core.tree.add(
        format!("Downloading: {url}"),
        TaskKind::DownloadResource(DownloadResourceState {
            resource: resource_id,
            is_embedded,
            body_task: None,
            parse_task: None,
            already_downloaded,
            progress: None,
        }),
    );

    let body_task = if already_downloaded && !needs_result {
        None
    } else {
        Some(download_body_task(core, resource_id))
    };
    if let Some(TaskKind::DownloadResource(state)) = core.tree.node_mut(task).map(|n| &mut n.kind)
    {
        state.body_task = body_task;
    }
    if let Some(body) = body_task {
        core.tree.append_child(task, body);
    }
    if already_downloaded {
        let placeholder = core.tree.add_placeholder("Already downloaded".to_string());
        core.tree.append_child(task, placeholder);
        core.tree.queue_deferred_complete(task, placeholder, pending);
    }

    // Later download requests within this session reuse this task's work
    // rather than re-fetching.
    if shared.config.assume_fresh_within_session {
        if let Some(resource) = core.resources.get_mut(&resource_id) {
            resource.already_downloaded_this_session = true;
        }
    }
    if let Some(resource) = core.resources.get_mut(&resource_id) {
        resource.download_task = Some(task);
    }
    task
}

/// Create (or reuse) the leaf task that downloads one resource body.
pub(crate) fn download_body_task(core: &mut ProjectCore, resource_id: ResourceId) -> TaskId {
    if let Some(existing) = core.resources[&resource_id].download_body_task {
        if core.tree.exists(existing) && !core.tree.is_complete(existing) {
            return existing;
        }
    }
    let url = core.resources[&resource_id].url.clone();
    let task = core.tree.add(
        format!("Downloading body: {url}"),
        TaskKind::DownloadBody(DownloadBodyState {
            resource: resource_id,
            promise: Promise::new(),
            result: None,
        }),
    );
    if let Some(resource) = core.resources.get_mut(&resource_id) {
        resource.download_body_task = Some(task);
    }
    task
}

fn parse_links_task(core: &mut ProjectCore, revision: ResourceRevision) -> TaskId {
    core.tree.add(
        format!("Finding links in: {}", revision.resource_url),
        TaskKind::ParseLinks(ParseLinksState {
            revision,
            result: None,
        }),
    )
}

/// The future carrying a download task's head revision. For a task that
/// skipped the body download entirely (already downloaded this session,
/// result not needed), the future is pre-resolved with an error.
pub(crate) fn task_future(core: &ProjectCore, task: TaskId) -> PromiseFuture<BodyOutcome> {
    let body_task = match core.tree.node(task).map(|n| &n.kind) {
        Some(TaskKind::DownloadResource(state)) => state.body_task,
        Some(TaskKind::DownloadBody(_)) => Some(task),
        _ => None,
    };
    if let Some(body) = body_task {
        if let Some(TaskKind::DownloadBody(state)) = core.tree.node(body).map(|n| &n.kind) {
            return state.promise.subscribe();
        }
    }
    let promise = Promise::new();
    promise.set(Err(Arc::new(CrystalError::AlreadyDownloadedThisSession)));
    promise.subscribe()
}

// === Body download unit ===

pub(crate) async fn run_download_body(
    shared: &Arc<ProjectShared>,
    task: TaskId,
    resource_id: ResourceId,
) -> BodyOutcome {
    download_body_inner(shared, task, resource_id)
        .await
        .map_err(Arc::new)
}

async fn download_body_inner(
    shared: &Arc<ProjectShared>,
    task: TaskId,
    resource_id: ResourceId,
) -> Result<BodyResult> {
    let (url, definitely_no_revisions, cookie, min_fetch_date) = {
        let core = shared.core.lock().await;
        let resource = core
            .resources
            .get(&resource_id)
            .ok_or(CrystalError::NoSuchEntity)?;
        (
            resource.url.clone(),
            resource.definitely_has_no_revisions,
            core.applicable_cookie(&resource.url),
            core.min_fetch_date(),
        )
    };

    // Reuse the existing head revision when it is still fresh.
    if !definitely_no_revisions {
        if let Some(row) = shared.store.latest_revision(resource_id).await? {
            let revision = ResourceRevision::from_row(&row, url.clone())?;
            if !revision.is_stale(cookie.as_deref(), min_fetch_date) {
                return Ok(BodyResult {
                    revision,
                    did_download: false,
                });
            }
        }
    }

    shared.ensure_writable()?;

    if let Err(e) = check_free_space(shared) {
        // Record the failed attempt so the project shows why nothing was
        // saved, then surface the error to the enclosing task.
        let _ = append_error_revision(shared, resource_id, cookie.clone(), &e).await;
        return Err(e);
    }

    let known_etags: Vec<String> = if definitely_no_revisions {
        Vec::new()
    } else {
        let core = shared.core.lock().await;
        let by_etag = core.revisions_by_etag(shared, resource_id).await?;
        by_etag.keys().cloned().collect()
    };

    set_subtitle(shared, task, "Waiting for response...").await;
    let fetched = shared
        .fetcher
        .fetch(&url, cookie.as_deref(), &known_etags, &shared.tmp_dir())
        .await;

    match fetched {
        Ok(mut fetched) => {
            if let Some(metadata) = &mut fetched.metadata {
                fill_response_metadata(metadata, &known_etags);
            }
            set_subtitle(shared, task, "Receiving response...").await;
            let revision = match append_revision(
                shared,
                resource_id,
                cookie.clone(),
                None,
                fetched.metadata,
                fetched.body,
            )
            .await
            {
                Ok(revision) => revision,
                Err(e @ CrystalError::ProjectHasTooManyRevisions(_)) => return Err(e),
                Err(e @ CrystalError::ProjectClosed) => return Err(e),
                Err(e) => append_error_revision(shared, resource_id, cookie, &e).await?,
            };
            Ok(BodyResult {
                revision,
                did_download: true,
            })
        }
        Err(e @ (CrystalError::NotADownloadableScheme(_) | CrystalError::HttpRequestFailed(_))) => {
            // Fetch failures are archived as error revisions, not raised.
            let revision = append_error_revision(shared, resource_id, cookie, &e).await?;
            Ok(BodyResult {
                revision,
                did_download: true,
            })
        }
        Err(e) => Err(e),
    }
}

/// Post-process response metadata before persisting it:
/// synthesize the ETag on a 304 that omitted it when exactly one candidate
/// exists (so the 304 can later be resolved to its target revision), and
/// inject a Date header when the origin sent none (RFC 7231 §7.1.1.2).
fn fill_response_metadata(metadata: &mut RevisionMetadata, known_etags: &[String]) {
    if metadata.status_code == 304
        && metadata.first_header("etag").is_none()
        && known_etags.len() == 1
    {
        metadata
            .headers
            .push(("ETag".to_string(), known_etags[0].clone()));
    }
    if metadata.first_header("date").is_none() {
        metadata
            .headers
            .push(("Date".to_string(), http_date::format(Utc::now())));
    }
}

fn check_free_space(shared: &Arc<ProjectShared>) -> Result<()> {
    let total = fs2::total_space(&shared.path)?;
    let available = fs2::available_space(&shared.path)?;
    if available < config::min_free_bytes(total) {
        return Err(CrystalError::ProjectFreeSpaceTooLow);
    }
    Ok(())
}

// === Revision creation ===

/// Append a revision row and publish its body file, in that order. If the
/// body cannot be published the row is rolled back; if the rollback itself
/// fails the dangling row is repaired on the next writable open.
pub(crate) async fn append_revision(
    shared: &Arc<ProjectShared>,
    resource_id: ResourceId,
    request_cookie: Option<String>,
    error: Option<PersistedError>,
    metadata: Option<RevisionMetadata>,
    body: Option<tempfile::NamedTempFile>,
) -> Result<ResourceRevision> {
    let error_json = ResourceRevision::encode_error(error.as_ref());
    let metadata_json = ResourceRevision::encode_metadata(metadata.as_ref());

    let (id, url) = {
        let mut core = shared.core.lock().await;
        let resource = core
            .resources
            .get_mut(&resource_id)
            .ok_or(CrystalError::NoSuchEntity)?;
        // Clear the no-revisions bit before the write lands, so concurrent
        // readers never skip checking the database.
        resource.definitely_has_no_revisions = false;
        let url = resource.url.clone();
        if shared.readonly {
            return Err(CrystalError::ProjectReadOnly);
        }
        let id = shared
            .store
            .insert_revision(
                resource_id,
                request_cookie.as_deref(),
                &error_json,
                &metadata_json,
            )
            .await?;
        (id, url)
    };

    if let Some(tmp) = body {
        if let Err(publish_err) =
            crate::model::revision::publish_body_file(&shared.path, shared.major_version, id, tmp)
        {
            match shared.store.delete_revision(id).await {
                Ok(()) => {}
                Err(rollback_err) => {
                    warn!(
                        revision = id,
                        error = %rollback_err,
                        "Could not roll back revision row after body write failure"
                    );
                }
            }
            return Err(publish_err);
        }
    }

    shared.emit(ModelEvent::RevisionDidInstantiate {
        resource: resource_id,
        revision: id,
    });
    Ok(ResourceRevision {
        id,
        resource_id,
        resource_url: url,
        request_cookie,
        error,
        metadata,
    })
}

async fn append_error_revision(
    shared: &Arc<ProjectShared>,
    resource_id: ResourceId,
    request_cookie: Option<String>,
    error: &CrystalError,
) -> Result<ResourceRevision> {
    append_revision(
        shared,
        resource_id,
        request_cookie,
        Some(PersistedError::from_error(error)),
        None,
        None,
    )
    .await
}

// === Link parse unit ===

pub(crate) async fn run_parse_links(
    shared: &Arc<ProjectShared>,
    task: TaskId,
    revision: ResourceRevision,
) -> ParseOutcome {
    parse_links_inner(shared, task, revision)
        .await
        .map_err(Arc::new)
}

async fn parse_links_inner(
    shared: &Arc<ProjectShared>,
    task: TaskId,
    revision: ResourceRevision,
) -> Result<ParseResult> {
    set_subtitle(shared, task, "Parsing links...").await;
    let body =
        crate::model::revision::read_body_file(&shared.path, shared.major_version, &revision)?;

    let content_type = revision.content_type();
    let mut links = crystal_links::extract_links(
        &body,
        revision.declared_charset().as_deref(),
        content_type.as_deref(),
        &revision.resource_url,
    );

    // A redirect is followed by archiving its target as an embedded link.
    if let Some(target) = revision.redirect_url() {
        links.push(Link {
            relative_url: target.to_string(),
            type_title: "Redirect",
            title: revision.redirect_title(),
            embedded: true,
            rewritable: true,
        });
    }

    set_subtitle(shared, task, "Recording links...").await;
    let raw_urls: Vec<String> = links.iter().map(|l| l.relative_url.clone()).collect();
    let resolved_urls: Vec<Option<String>> = raw_urls
        .iter()
        .map(|raw| crystal_common::join_url(&revision.resource_url, raw))
        .collect();

    let created = {
        let mut core = shared.core.lock().await;
        let mut pending = PendingCompletions::new();
        let created = core
            .bulk_create_resources_locked(shared, &raw_urls, &revision.resource_url, &mut pending)
            .await?;
        scheduler::pump_now(shared, &mut core, &mut pending).await?;
        created
    };

    Ok(ParseResult {
        links,
        resolved_urls,
        created,
    })
}

// === DownloadResource completion handling ===

/// React to a child of a DownloadResource task completing, advancing the
/// state machine: body -> parse -> embedded children -> done.
pub(crate) async fn on_child_complete(
    shared: &ProjectShared,
    core: &mut ProjectCore,
    parent: TaskId,
    child: TaskId,
    pending: &mut PendingCompletions,
    actions: &mut Vec<PostAction>,
) -> Result<()> {
    let (resource_id, body_task, parse_task, already_downloaded) =
        match core.tree.node(parent).map(|n| &n.kind) {
            Some(TaskKind::DownloadResource(state)) => (
                state.resource,
                state.body_task,
                state.parse_task,
                state.already_downloaded,
            ),
            _ => return Ok(()),
        };

    if Some(child) == body_task && parse_task.is_none() {
        if !already_downloaded {
            on_body_complete(shared, core, parent, child, resource_id).await?;
        }
        // (When an already-downloaded placeholder exists, don't reparse
        //  links or redownload embedded resources.)
    } else if Some(child) == parse_task {
        on_parse_complete(shared, core, parent, child, resource_id, pending).await?;
    } else if matches!(
        core.tree.node(child).map(|n| &n.kind),
        Some(TaskKind::DownloadResource(_))
    ) {
        if let Some(TaskKind::DownloadResource(state)) =
            core.tree.node_mut(parent).map(|n| &mut n.kind)
        {
            if let Some(progress) = &mut state.progress {
                progress.update(1);
            }
        }
    }

    if core.tree.is_complete(parent) {
        // A parse that discovered only already-downloaded links can have
        // completed this task while its notifications were still queued.
        return Ok(());
    }

    update_progress_subtitle(core, parent);

    let (num_complete, num_children) = {
        let node = core.tree.node(parent).ok_or(CrystalError::NoSuchEntity)?;
        (node.num_children_complete, node.children.len())
    };
    if num_complete == num_children {
        if !already_downloaded {
            cull_download_children(core, parent);
        }
        let did_download = body_did_download(core, parent);
        let is_embedded = match core.tree.node(parent).map(|n| &n.kind) {
            Some(TaskKind::DownloadResource(state)) => state.is_embedded,
            _ => true,
        };
        if !is_embedded && did_download {
            actions.push(PostAction::DelayThenFinish { task: parent });
        } else {
            finish_task(shared, core, parent, pending);
        }
    }
    Ok(())
}

async fn on_body_complete(
    _shared: &ProjectShared,
    core: &mut ProjectCore,
    parent: TaskId,
    body: TaskId,
    _resource_id: ResourceId,
) -> Result<()> {
    let outcome = match core.tree.node(body).map(|n| &n.kind) {
        Some(TaskKind::DownloadBody(state)) => state.result.clone(),
        _ => None,
    };
    let revision = match outcome {
        Some(Ok(result)) => result.revision,
        Some(Err(e)) => {
            if !e.is_project_closed() {
                warn!(task = parent, error = %e, "Unexpected error while downloading");
            }
            // Behave as if there are no embedded resources
            return Ok(());
        }
        None => return Ok(()),
    };

    // 1. Error pages may embed further error pages, recursing infinitely;
    //    don't parse them.
    // 2. Known binary types never carry links.
    let status = revision.status_code().unwrap_or(500);
    let is_error_page = (400..600).contains(&status);
    if revision.error.is_none() && !is_error_page && !revision.is_recognized_binary_type() {
        let parse = parse_links_task(core, revision);
        if let Some(TaskKind::DownloadResource(state)) =
            core.tree.node_mut(parent).map(|n| &mut n.kind)
        {
            state.parse_task = Some(parse);
        }
        core.tree.append_child(parent, parse);
    }
    Ok(())
}

async fn on_parse_complete(
    shared: &ProjectShared,
    core: &mut ProjectCore,
    parent: TaskId,
    parse: TaskId,
    resource_id: ResourceId,
    pending: &mut PendingCompletions,
) -> Result<()> {
    let outcome = match core.tree.node(parse).map(|n| &n.kind) {
        Some(TaskKind::ParseLinks(state)) => state.result.clone(),
        _ => None,
    };
    let parse_result = match outcome {
        Some(Ok(result)) => result,
        Some(Err(e)) => {
            if let CrystalError::RevisionBodyMissing(revision_id) = &*e {
                return redownload_missing_body(shared, core, parent, *revision_id, resource_id)
                    .await;
            }
            if e.is_project_closed() {
                return Err(CrystalError::ProjectClosed);
            }
            core.tree
                .record_crash(parent, "bulkhead", e.to_string());
            return Ok(());
        }
        None => return Ok(()),
    };

    // Identify embedded link targets to download, skipping duplicates,
    // resources already being downloaded by an ancestor, and members of
    // do-not-download groups.
    let ancestors = ancestor_downloading_resources(core, parent);
    let mut new_children = Vec::new();
    if ancestors.len() <= config::MAX_EMBEDDED_RECURSION_DEPTH {
        let mut seen = HashSet::new();
        for (link, resolved) in parse_result.links.iter().zip(&parse_result.resolved_urls) {
            if !link.embedded {
                continue;
            }
            let Some(url) = resolved else { continue };
            if !seen.insert(url.clone()) {
                continue;
            }
            let Some(&target) = core.resources_by_url.get(url) else {
                continue;
            };
            if ancestors.contains(&target) {
                continue;
            }
            let excluded = core
                .groups
                .values()
                .any(|g| g.do_not_download && g.contains_url(url));
            if excluded {
                continue;
            }
            let child = download_resource_task(shared, core, target, false, true, pending);
            new_children.push(child);
        }
    }

    for child in new_children {
        if core.tree.children(parent).contains(&child) {
            continue;
        }
        core.tree.append_child(parent, child);
        if core.tree.is_complete(child) {
            core.tree.queue_deferred_complete(parent, child, pending);
        }
    }

    // Start estimating time remaining
    let (num_complete, num_children) = {
        let node = core.tree.node(parent).ok_or(CrystalError::NoSuchEntity)?;
        (node.num_children_complete, node.children.len())
    };
    if let Some(TaskKind::DownloadResource(state)) =
        core.tree.node_mut(parent).map(|n| &mut n.kind)
    {
        state.progress = Some(Progress::new(num_complete, num_children));
    }
    Ok(())
}

/// A revision row whose body file vanished is deleted and the body is
/// downloaded again, once.
async fn redownload_missing_body(
    shared: &ProjectShared,
    core: &mut ProjectCore,
    parent: TaskId,
    revision_id: i64,
    resource_id: ResourceId,
) -> Result<()> {
    warn!(
        revision = revision_id,
        "Revision is missing its body on disk; redownloading it"
    );
    let url = core
        .resources
        .get(&resource_id)
        .ok_or(CrystalError::NoSuchEntity)?
        .url
        .clone();
    if let Some(row) = shared.store.revision(revision_id).await? {
        let revision = ResourceRevision::from_row(&row, url)?;
        core.delete_revision_locked(shared, &revision).await?;
    }

    let new_body = download_body_task(core, resource_id);
    if let Some(TaskKind::DownloadResource(state)) =
        core.tree.node_mut(parent).map(|n| &mut n.kind)
    {
        state.body_task = Some(new_body);
        state.parse_task = None;
    }
    core.tree.append_child(parent, new_body);
    Ok(())
}

fn ancestor_downloading_resources(core: &ProjectCore, task: TaskId) -> Vec<ResourceId> {
    let mut ancestors = Vec::new();
    let mut cursor = Some(task);
    while let Some(id) = cursor {
        let Some(node) = core.tree.node(id) else { break };
        if let TaskKind::DownloadResource(state) = &node.kind {
            ancestors.push(state.resource);
        }
        cursor = node.parent;
    }
    ancestors
}

fn update_progress_subtitle(core: &mut ProjectCore, task: TaskId) {
    let Some(node) = core.tree.node(task) else {
        return;
    };
    let (num_complete, num_children) = (node.num_children_complete, node.children.len());
    let suffix = match &node.kind {
        TaskKind::DownloadResource(state) => state
            .progress
            .as_ref()
            .map(|p| format!(" -- {}", p.remaining_phrase()))
            .unwrap_or_default(),
        _ => String::new(),
    };
    core.tree.set_subtitle(
        task,
        format!("{num_complete} of {num_children} item(s){suffix}"),
    );
}

/// Replace completed embedded-download children with a compact placeholder
/// so their subtrees can be dropped.
fn cull_download_children(core: &mut ProjectCore, task: TaskId) {
    let (body_task, parse_task) = match core.tree.node(task).map(|n| &n.kind) {
        Some(TaskKind::DownloadResource(state)) => (state.body_task, state.parse_task),
        _ => return,
    };
    let children = core.tree.children(task);
    let mut final_children = Vec::new();
    let mut num_downloads = 0usize;
    for child in children {
        if Some(child) == body_task || Some(child) == parse_task {
            final_children.push(child);
        } else {
            num_downloads += 1;
        }
    }
    let summary = core.tree.add_placeholder(format!(
        "Downloading {num_downloads} item{}",
        if num_downloads == 1 { "" } else { "s" }
    ));
    final_children.push(summary);
    core.tree.finalize_children(task, final_children);
}

fn body_did_download(core: &ProjectCore, task: TaskId) -> bool {
    let body_task = match core.tree.node(task).map(|n| &n.kind) {
        Some(TaskKind::DownloadResource(state)) => state.body_task,
        _ => None,
    };
    let Some(body) = body_task else { return false };
    match core.tree.node(body).map(|n| &n.kind) {
        Some(TaskKind::DownloadBody(state)) => state
            .result
            .as_ref()
            .and_then(|r| r.as_ref().ok().map(|b| b.did_download))
            .unwrap_or(false),
        _ => false,
    }
}

async fn set_subtitle(shared: &Arc<ProjectShared>, task: TaskId, text: &str) {
    let mut core = shared.core.lock().await;
    core.tree.set_subtitle(task, text);
}
