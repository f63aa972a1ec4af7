//! The project: a directory of archived resources and the engine that
//! fills it.
//!
//! A `Project` owns the SQLite catalog, the in-memory arenas of resources,
//! root resources, and groups, the task tree, and one scheduler task. All
//! model mutations run while the single core lock is held, preserving the
//! catalog's single-writer discipline.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crystal_common::UrlPattern;

use crate::caffeination::Caffeination;
use crate::config::DownloadConfig;
use crate::error::{CrystalError, Result};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::model::resource::{Resource, ResourceId};
use crate::model::resource_group::{GroupId, GroupSource, ResourceGroup};
use crate::model::revision::{
    self, ResourceRevision, RevisionId, RevisionMetadata, REVISIONS_DIRNAME,
};
use crate::model::root_resource::{RootResource, RootResourceId};
use crate::store::Store;
use crate::task::{
    download, group, scheduler, PendingCompletions, PromiseFuture, TaskEvent, TaskId, TaskTree,
};

/// File extension conventionally carried by project directories.
pub const FILE_EXTENSION: &str = ".crystalproj";

const DB_FILENAME: &str = "database.sqlite";
const MARKER_FILENAME: &str = ".crystalopen";
const TMP_DIRNAME: &str = "tmp";

const DEFAULT_MAJOR_VERSION: u32 = 2;
const SUPPORTED_MAJOR_VERSION: u32 = 3;

/// Model mutation events, published to every subscriber.
#[derive(Debug, Clone)]
pub enum ModelEvent {
    ResourceDidInstantiate(ResourceId),
    ResourceDidForget(ResourceId),
    RootResourceDidInstantiate(RootResourceId),
    RootResourceDidForget(RootResourceId),
    ResourceGroupDidInstantiate(GroupId),
    ResourceGroupDidForget(GroupId),
    GroupDidAddMember { group: GroupId, member: ResourceId },
    RevisionDidInstantiate { resource: ResourceId, revision: RevisionId },
    RevisionDidForget { resource: ResourceId, revision: RevisionId },
}

/// In-memory state guarded by the core lock: the model arenas plus the
/// task tree. Everything that mutates rows or tree nodes runs here.
pub(crate) struct ProjectCore {
    pub(crate) resources: BTreeMap<ResourceId, Resource>,
    pub(crate) resources_by_url: HashMap<String, ResourceId>,
    pub(crate) root_resources: BTreeMap<RootResourceId, RootResource>,
    pub(crate) groups: BTreeMap<GroupId, ResourceGroup>,
    pub(crate) properties: HashMap<String, String>,
    pub(crate) tree: TaskTree,
}

pub(crate) struct ProjectShared {
    pub(crate) path: PathBuf,
    pub(crate) readonly: bool,
    pub(crate) major_version: u32,
    pub(crate) store: Store,
    pub(crate) config: DownloadConfig,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) closed: AtomicBool,
    pub(crate) core: Mutex<ProjectCore>,
    pub(crate) model_events: broadcast::Sender<ModelEvent>,
    pub(crate) task_events: broadcast::Sender<TaskEvent>,
    pub(crate) caffeination: Caffeination,
}

impl ProjectShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CrystalError::ProjectClosed);
        }
        if self.readonly {
            return Err(CrystalError::ProjectReadOnly);
        }
        Ok(())
    }

    pub(crate) fn tmp_dir(&self) -> PathBuf {
        self.path.join(TMP_DIRNAME)
    }

    pub(crate) fn emit(&self, event: ModelEvent) {
        let _ = self.model_events.send(event);
    }
}

/// Snapshot of one task, taken for display.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub title: String,
    pub subtitle: String,
    pub complete: bool,
    pub crash_reason: Option<String>,
    pub num_children_complete: usize,
    pub children: Vec<TaskId>,
}

/// Handle to an enqueued resource download.
pub struct DownloadHandle {
    pub task: TaskId,
    future: PromiseFuture<crate::task::BodyOutcome>,
}

impl DownloadHandle {
    /// Wait for the head revision (available before embedded resources
    /// finish downloading).
    pub async fn wait(&mut self) -> crate::task::BodyOutcome {
        self.future.wait().await
    }
}

impl std::fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("task", &self.task)
            .finish()
    }
}

/// An open project. Cheap to clone internally; externally a single owner
/// is expected to hold it and call [`Project::close`] when done.
pub struct Project {
    shared: Arc<ProjectShared>,
    scheduler: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("path", &self.shared.path)
            .finish()
    }
}

impl Project {
    // === Open / create / close ===

    /// Create a new project at the given path, which must not already
    /// contain one.
    pub async fn create(path: impl AsRef<Path>) -> Result<Project> {
        Project::open_with(path.as_ref(), false, DownloadConfig::default(), None).await
    }

    /// Open the project at the given path, creating the directory layout
    /// if absent. Refuses projects written by a newer format version.
    pub async fn open(path: impl AsRef<Path>, readonly: bool) -> Result<Project> {
        Project::open_with(path.as_ref(), readonly, DownloadConfig::default(), None).await
    }

    /// Open with explicit configuration and an optional fetcher override
    /// (tests substitute a local fetcher here).
    pub async fn open_with(
        path: &Path,
        readonly: bool,
        config: DownloadConfig,
        fetcher: Option<Arc<dyn Fetcher>>,
    ) -> Result<Project> {
        let db_path = path.join(DB_FILENAME);
        let exists = path.exists();
        let valid = exists
            && db_path.exists()
            && (path.join(MARKER_FILENAME).exists() || path.join(REVISIONS_DIRNAME).exists());

        let (store, created) = if valid {
            (Store::open(&db_path, false, readonly).await?, false)
        } else if exists && std::fs::read_dir(path)?.next().is_some() {
            // Non-empty directory that is not a project
            return Err(CrystalError::NotAProject(path.to_path_buf()));
        } else if readonly {
            return Err(CrystalError::NotAProject(path.to_path_buf()));
        } else {
            std::fs::create_dir_all(path)?;
            std::fs::write(path.join(MARKER_FILENAME), b"")?;
            std::fs::create_dir_all(path.join(REVISIONS_DIRNAME))?;
            std::fs::create_dir_all(path.join(TMP_DIRNAME))?;
            let store = Store::open(&db_path, true, false).await?;
            store.create_schema().await?;
            store
                .set_property("major_version", Some(&DEFAULT_MAJOR_VERSION.to_string()))
                .await?;
            (store, true)
        };

        // Properties and format version
        let mut properties: HashMap<String, String> = HashMap::new();
        for (name, value) in store.properties().await? {
            if let Some(value) = value {
                properties.insert(name, value);
            }
        }
        let major_version: u32 = properties
            .get("major_version")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAJOR_VERSION);
        if major_version > SUPPORTED_MAJOR_VERSION {
            store.close().await;
            return Err(CrystalError::ProjectTooNew {
                found: major_version,
                supported: SUPPORTED_MAJOR_VERSION,
            });
        }

        if !readonly {
            std::fs::create_dir_all(path.join(TMP_DIRNAME))?;
            clear_tmp_dir(&path.join(TMP_DIRNAME));
            if !created {
                repair_dangling_revision(path, major_version, &store).await?;
            }
        }

        // Arenas
        let mut resources = BTreeMap::new();
        let mut resources_by_url = HashMap::new();
        for row in store.resources().await? {
            resources.insert(row.id, Resource::new(row.id, row.url.clone(), true));
            resources_by_url.insert(row.url, row.id);
        }
        let mut root_resources = BTreeMap::new();
        for row in store.root_resources().await? {
            root_resources.insert(
                row.id,
                RootResource {
                    id: row.id,
                    name: row.name,
                    resource_id: row.resource_id,
                },
            );
        }
        let mut groups = BTreeMap::new();
        for row in store.resource_groups().await? {
            let source = match (row.source_type.as_deref(), row.source_id) {
                (Some("root_resource"), Some(id)) => Some(GroupSource::RootResource(id)),
                (Some("resource_group"), Some(id)) => Some(GroupSource::Group(id)),
                _ => None,
            };
            groups.insert(
                row.id,
                ResourceGroup {
                    id: row.id,
                    name: row.name,
                    pattern: UrlPattern::compile(&row.url_pattern)?,
                    source,
                    do_not_download: row.do_not_download,
                    members: None,
                    member_watchers: Vec::new(),
                },
            );
        }

        let (model_events, _) = broadcast::channel(1024);
        let (task_events, _) = broadcast::channel(1024);
        let tree = TaskTree::new(task_events.clone());

        let config_for_fetcher = config.clone();
        let shared = Arc::new(ProjectShared {
            path: path.to_path_buf(),
            readonly,
            major_version,
            store,
            config,
            fetcher: match fetcher {
                Some(f) => f,
                None => Arc::new(HttpFetcher::new(&config_for_fetcher)?),
            },
            closed: AtomicBool::new(false),
            core: Mutex::new(ProjectCore {
                resources,
                resources_by_url,
                root_resources,
                groups,
                properties,
                tree,
            }),
            model_events,
            task_events,
            caffeination: Caffeination::default(),
        });

        let handle = scheduler::spawn(shared.clone());
        info!(path = %path.display(), readonly, major_version, "Project opened");

        Ok(Project {
            shared,
            scheduler: std::sync::Mutex::new(Some(handle)),
        })
    }

    /// Close the project: stop the scheduler, flush pending writes, and
    /// release the database handle. In-flight HTTP requests are not
    /// aborted; their results are discarded.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut core = self.shared.core.lock().await;
            let root = core.tree.root;
            let mut pending = PendingCompletions::new();
            core.tree.complete_task(root, &mut pending);
            // The root task has no subscribers; nothing to pump.
            debug_assert!(pending.is_empty());
        }
        let handle = { self.scheduler.lock().expect("scheduler slot").take() };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.shared.store.close().await;
        info!(path = %self.shared.path.display(), "Project closed");
    }

    // === Accessors ===

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn readonly(&self) -> bool {
        self.shared.readonly
    }

    pub fn major_version(&self) -> u32 {
        self.shared.major_version
    }

    /// Title shown for this project: the directory name.
    pub fn title(&self) -> String {
        self.shared
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.shared.model_events.subscribe()
    }

    pub fn subscribe_tasks(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.task_events.subscribe()
    }

    // === Properties ===

    pub async fn set_property(&self, name: &str, value: Option<&str>) -> Result<()> {
        self.shared.ensure_writable()?;
        let mut core = self.shared.core.lock().await;
        self.shared.store.set_property(name, value).await?;
        match value {
            Some(v) => core.properties.insert(name.to_string(), v.to_string()),
            None => core.properties.remove(name),
        };
        Ok(())
    }

    pub async fn property(&self, name: &str) -> Option<String> {
        self.shared.core.lock().await.properties.get(name).cloned()
    }

    /// URL prefix under which the majority of this project's resources
    /// live. Also scopes the request cookie.
    pub async fn set_default_url_prefix(&self, prefix: Option<&str>) -> Result<()> {
        self.set_property("default_url_prefix", prefix).await
    }

    pub async fn set_request_cookie(&self, cookie: Option<&str>) -> Result<()> {
        self.set_property("request_cookie", cookie).await
    }

    pub async fn set_min_fetch_date(&self, date: Option<DateTime<Utc>>) -> Result<()> {
        let formatted = date.map(|d| d.to_rfc3339());
        self.set_property("min_fetch_date", formatted.as_deref())
            .await
    }

    /// Strip the default URL prefix for display, when configured.
    pub async fn display_url(&self, url: &str) -> String {
        let core = self.shared.core.lock().await;
        match core.properties.get("default_url_prefix") {
            Some(prefix) if url.starts_with(prefix.as_str()) => url[prefix.len()..].to_string(),
            _ => url.to_string(),
        }
    }

    // === Resources ===

    /// Look up or create the resource for a URL. The URL is normalized
    /// (fragment stripped) before the lookup.
    pub async fn create_resource(&self, url: &str) -> Result<Resource> {
        let normalized = crystal_common::normalize_url(url)
            .ok_or_else(|| CrystalError::NotADownloadableScheme(url.to_string()))?;
        let mut core = self.shared.core.lock().await;
        if let Some(&id) = core.resources_by_url.get(&normalized) {
            return Ok(core.resources[&id].clone());
        }
        self.shared.ensure_writable()?;
        let mut pending = PendingCompletions::new();
        let id = core
            .create_resource_locked(&self.shared, normalized, &mut pending)
            .await?;
        scheduler::pump_now(&self.shared, &mut core, &mut pending).await?;
        Ok(core.resources[&id].clone())
    }

    /// Create resources for many URLs at once, joining each against a base
    /// URL. One transaction backs the whole batch, which is substantially
    /// faster than creating resources one at a time when a parsed document
    /// yields hundreds of links. Returns only the newly-created resources.
    pub async fn bulk_create_resources(
        &self,
        urls: &[String],
        base_url: &str,
    ) -> Result<Vec<Resource>> {
        self.shared.ensure_writable()?;
        let mut core = self.shared.core.lock().await;
        let mut pending = PendingCompletions::new();
        let created = core
            .bulk_create_resources_locked(&self.shared, urls, base_url, &mut pending)
            .await?;
        scheduler::pump_now(&self.shared, &mut core, &mut pending).await?;
        Ok(created
            .into_iter()
            .filter_map(|id| core.resources.get(&id).cloned())
            .collect())
    }

    pub async fn get_resource(&self, url: &str) -> Option<Resource> {
        let normalized = crystal_common::normalize_url(url)?;
        let core = self.shared.core.lock().await;
        let id = *core.resources_by_url.get(&normalized)?;
        Some(core.resources[&id].clone())
    }

    pub async fn resources(&self) -> Vec<Resource> {
        self.shared
            .core
            .lock()
            .await
            .resources
            .values()
            .cloned()
            .collect()
    }

    /// Delete a resource, cascading to its revisions and any root resource
    /// pointing at it.
    pub async fn delete_resource(&self, id: ResourceId) -> Result<()> {
        self.shared.ensure_writable()?;
        let mut core = self.shared.core.lock().await;
        let resource = core.resources.get(&id).ok_or(CrystalError::NoSuchEntity)?;
        let url = resource.url.clone();

        let revision_ids: Vec<RevisionId> = self
            .shared
            .store
            .revisions_for_resource(id)
            .await?
            .iter()
            .map(|r| r.id)
            .collect();
        self.shared.store.delete_resource(id).await?;
        for rev_id in revision_ids {
            revision::remove_body_file(&self.shared.path, self.shared.major_version, rev_id)?;
        }

        let root_ids: Vec<RootResourceId> = core
            .root_resources
            .values()
            .filter(|rr| rr.resource_id == id)
            .map(|rr| rr.id)
            .collect();
        for root_id in root_ids {
            core.forget_root_resource_locked(&self.shared, root_id);
        }

        for group in core.groups.values_mut() {
            if let Some(members) = &mut group.members {
                members.retain(|&m| m != id);
            }
        }
        core.resources.remove(&id);
        core.resources_by_url.remove(&url);
        self.shared.emit(ModelEvent::ResourceDidForget(id));
        Ok(())
    }

    // === Root resources ===

    pub async fn create_root_resource(
        &self,
        name: &str,
        resource_id: ResourceId,
    ) -> Result<RootResource> {
        self.shared.ensure_writable()?;
        let mut core = self.shared.core.lock().await;
        if !core.resources.contains_key(&resource_id) {
            return Err(CrystalError::CrossProjectReference);
        }
        if core
            .root_resources
            .values()
            .any(|rr| rr.resource_id == resource_id)
        {
            return Err(CrystalError::RootResourceAlreadyExists);
        }
        let id = self
            .shared
            .store
            .insert_root_resource(name, resource_id)
            .await?;
        let root = RootResource {
            id,
            name: name.to_string(),
            resource_id,
        };
        core.root_resources.insert(id, root.clone());
        self.shared.emit(ModelEvent::RootResourceDidInstantiate(id));
        Ok(root)
    }

    pub async fn root_resources(&self) -> Vec<RootResource> {
        self.shared
            .core
            .lock()
            .await
            .root_resources
            .values()
            .cloned()
            .collect()
    }

    /// Delete a root resource. Any group sourced from it loses its source.
    pub async fn delete_root_resource(&self, id: RootResourceId) -> Result<()> {
        self.shared.ensure_writable()?;
        let mut core = self.shared.core.lock().await;
        if !core.root_resources.contains_key(&id) {
            return Err(CrystalError::NoSuchEntity);
        }
        let affected: Vec<GroupId> = core
            .groups
            .values()
            .filter(|g| g.source == Some(GroupSource::RootResource(id)))
            .map(|g| g.id)
            .collect();
        for group_id in affected {
            self.shared
                .store
                .update_group_source(group_id, None, None)
                .await?;
            if let Some(group) = core.groups.get_mut(&group_id) {
                group.source = None;
            }
        }
        self.shared.store.delete_root_resource(id).await?;
        core.forget_root_resource_locked(&self.shared, id);
        Ok(())
    }

    // === Resource groups ===

    pub async fn create_resource_group(
        &self,
        name: &str,
        url_pattern: &str,
        source: Option<GroupSource>,
        do_not_download: bool,
    ) -> Result<ResourceGroup> {
        self.shared.ensure_writable()?;
        let pattern = UrlPattern::compile(url_pattern)?;
        let mut core = self.shared.core.lock().await;
        core.validate_source(source, None)?;
        let (source_type, source_id) = GroupSource::to_columns(source);
        let id = self
            .shared
            .store
            .insert_resource_group(name, url_pattern, source_type, source_id, do_not_download)
            .await?;
        let group = ResourceGroup {
            id,
            name: name.to_string(),
            pattern,
            source,
            do_not_download,
            members: None,
            member_watchers: Vec::new(),
        };
        core.groups.insert(id, group.clone());
        self.shared.emit(ModelEvent::ResourceGroupDidInstantiate(id));
        Ok(group)
    }

    pub async fn resource_groups(&self) -> Vec<ResourceGroup> {
        self.shared
            .core
            .lock()
            .await
            .groups
            .values()
            .cloned()
            .collect()
    }

    pub async fn set_group_source(&self, id: GroupId, source: Option<GroupSource>) -> Result<()> {
        self.shared.ensure_writable()?;
        let mut core = self.shared.core.lock().await;
        if !core.groups.contains_key(&id) {
            return Err(CrystalError::NoSuchEntity);
        }
        core.validate_source(source, Some(id))?;
        let (source_type, source_id) = GroupSource::to_columns(source);
        self.shared
            .store
            .update_group_source(id, source_type, source_id)
            .await?;
        if let Some(group) = core.groups.get_mut(&id) {
            group.source = source;
        }
        Ok(())
    }

    pub async fn set_group_do_not_download(&self, id: GroupId, value: bool) -> Result<()> {
        self.shared.ensure_writable()?;
        let mut core = self.shared.core.lock().await;
        if !core.groups.contains_key(&id) {
            return Err(CrystalError::NoSuchEntity);
        }
        self.shared
            .store
            .update_group_do_not_download(id, value)
            .await?;
        if let Some(group) = core.groups.get_mut(&id) {
            group.do_not_download = value;
        }
        Ok(())
    }

    /// Delete a group. Any group sourced from it loses its source.
    pub async fn delete_resource_group(&self, id: GroupId) -> Result<()> {
        self.shared.ensure_writable()?;
        let mut core = self.shared.core.lock().await;
        if !core.groups.contains_key(&id) {
            return Err(CrystalError::NoSuchEntity);
        }
        let affected: Vec<GroupId> = core
            .groups
            .values()
            .filter(|g| g.source == Some(GroupSource::Group(id)))
            .map(|g| g.id)
            .collect();
        for group_id in affected {
            self.shared
                .store
                .update_group_source(group_id, None, None)
                .await?;
            if let Some(group) = core.groups.get_mut(&group_id) {
                group.source = None;
            }
        }
        self.shared.store.delete_resource_group(id).await?;
        core.groups.remove(&id);
        self.shared.emit(ModelEvent::ResourceGroupDidForget(id));
        Ok(())
    }

    /// Members of a group, in discovery order. Computed on first access by
    /// scanning all resources against the compiled pattern.
    pub async fn group_members(&self, id: GroupId) -> Result<Vec<Resource>> {
        let mut core = self.shared.core.lock().await;
        let member_ids = core.group_members_locked(id)?;
        Ok(member_ids
            .into_iter()
            .filter_map(|rid| core.resources.get(&rid).cloned())
            .collect())
    }

    // === Revisions ===

    pub async fn revisions(&self, resource_id: ResourceId) -> Result<Vec<ResourceRevision>> {
        let core = self.shared.core.lock().await;
        let url = core
            .resources
            .get(&resource_id)
            .ok_or(CrystalError::NoSuchEntity)?
            .url
            .clone();
        let rows = self.shared.store.revisions_for_resource(resource_id).await?;
        rows.iter()
            .map(|row| ResourceRevision::from_row(row, url.clone()))
            .collect()
    }

    /// The most recent revision of a resource: the one served and used as
    /// link-extraction input.
    pub async fn default_revision(
        &self,
        resource_id: ResourceId,
    ) -> Result<Option<ResourceRevision>> {
        let core = self.shared.core.lock().await;
        let url = core
            .resources
            .get(&resource_id)
            .ok_or(CrystalError::NoSuchEntity)?
            .url
            .clone();
        match self.shared.store.latest_revision(resource_id).await? {
            Some(row) => Ok(Some(ResourceRevision::from_row(&row, url)?)),
            None => Ok(None),
        }
    }

    /// Map from ETag to the most recent revision of a resource declaring
    /// it. Feeds `If-None-Match` requests and HTTP 304 resolution.
    pub async fn revisions_by_etag(
        &self,
        resource_id: ResourceId,
    ) -> Result<HashMap<String, ResourceRevision>> {
        let core = self.shared.core.lock().await;
        core.revisions_by_etag(&self.shared, resource_id).await
    }

    /// Append a successful revision with the given response metadata and
    /// body bytes, honoring the row-then-body write ordering. Intended for
    /// tooling that imports content from outside the download pipeline.
    pub async fn append_revision_from_response(
        &self,
        resource_id: ResourceId,
        metadata: Option<RevisionMetadata>,
        body: &[u8],
        request_cookie: Option<&str>,
    ) -> Result<ResourceRevision> {
        self.shared.ensure_writable()?;
        let mut tmp = tempfile::Builder::new()
            .suffix(".body")
            .tempfile_in(self.shared.tmp_dir())?;
        std::io::Write::write_all(&mut tmp, body)?;
        tmp.as_file().sync_all()?;
        download::append_revision(
            &self.shared,
            resource_id,
            request_cookie.map(str::to_string),
            None,
            metadata,
            Some(tmp),
        )
        .await
    }

    /// Append a revision recording a failed download attempt.
    pub async fn append_revision_from_error(
        &self,
        resource_id: ResourceId,
        error: &CrystalError,
        request_cookie: Option<&str>,
    ) -> Result<ResourceRevision> {
        self.shared.ensure_writable()?;
        download::append_revision(
            &self.shared,
            resource_id,
            request_cookie.map(str::to_string),
            Some(crate::model::revision::PersistedError::from_error(error)),
            None,
            None,
        )
        .await
    }

    /// Read a revision's body bytes from disk.
    pub async fn read_revision_body(&self, rev: &ResourceRevision) -> Result<Vec<u8>> {
        revision::read_body_file(&self.shared.path, self.shared.major_version, rev)
    }

    /// Delete a revision: the row first, then the body file.
    pub async fn delete_revision(&self, rev: &ResourceRevision) -> Result<()> {
        self.shared.ensure_writable()?;
        let mut core = self.shared.core.lock().await;
        core.delete_revision_locked(&self.shared, rev).await
    }

    /// Narrow repair path for revision metadata; revisions are otherwise
    /// immutable.
    pub async fn alter_revision_metadata(
        &self,
        rev: &ResourceRevision,
        metadata: &RevisionMetadata,
    ) -> Result<()> {
        self.shared.ensure_writable()?;
        let json = ResourceRevision::encode_metadata(Some(metadata));
        self.shared.store.update_revision_metadata(rev.id, &json).await
    }

    // === Downloads ===

    /// Enqueue a top-level task downloading a resource and its embedded
    /// resources. The handle resolves to the head revision.
    pub async fn download_resource(
        &self,
        resource_id: ResourceId,
        needs_result: bool,
    ) -> Result<DownloadHandle> {
        let mut core = self.shared.core.lock().await;
        if !core.resources.contains_key(&resource_id) {
            return Err(CrystalError::NoSuchEntity);
        }
        let mut pending = PendingCompletions::new();
        let task = download::download_resource_task(
            &self.shared,
            &mut core,
            resource_id,
            needs_result,
            false,
            &mut pending,
        );
        let future = download::task_future(&core, task);
        core.add_top_level_task_locked(task)?;
        scheduler::pump_now(&self.shared, &mut core, &mut pending).await?;
        Ok(DownloadHandle { task, future })
    }

    /// Enqueue a top-level task downloading every member of a group,
    /// discovering new members from the group's source as it goes.
    pub async fn download_resource_group(&self, group_id: GroupId) -> Result<TaskId> {
        let mut core = self.shared.core.lock().await;
        if !core.groups.contains_key(&group_id) {
            return Err(CrystalError::NoSuchEntity);
        }
        let mut pending = PendingCompletions::new();
        let task = group::download_group_task(&self.shared, &mut core, group_id, &mut pending)?;
        core.add_top_level_task_locked(task)?;
        scheduler::pump_now(&self.shared, &mut core, &mut pending).await?;
        Ok(task)
    }

    /// Enqueue a top-level task refreshing a group's membership by
    /// downloading its source.
    pub async fn update_group_members(&self, group_id: GroupId) -> Result<TaskId> {
        let mut core = self.shared.core.lock().await;
        if !core.groups.contains_key(&group_id) {
            return Err(CrystalError::NoSuchEntity);
        }
        let mut pending = PendingCompletions::new();
        let task =
            group::update_group_members_task(&self.shared, &mut core, group_id, &mut pending)?;
        core.add_top_level_task_locked(task)?;
        scheduler::pump_now(&self.shared, &mut core, &mut pending).await?;
        Ok(task)
    }

    /// The task every top-level task hangs under. Never completes while the
    /// project is open.
    pub async fn root_task(&self) -> TaskId {
        self.shared.core.lock().await.tree.root
    }

    /// Snapshot of one task for display, or None if the task has been
    /// culled from the tree.
    pub async fn task_snapshot(&self, task: TaskId) -> Option<TaskSnapshot> {
        let core = self.shared.core.lock().await;
        let node = core.tree.node(task)?;
        Some(TaskSnapshot {
            id: task,
            title: node.title.clone(),
            subtitle: node.subtitle.clone(),
            complete: node.complete,
            crash_reason: node.crash_reason.clone(),
            num_children_complete: node.num_children_complete,
            children: node.children.clone(),
        })
    }

    /// Whether a task has finished (or has been culled after finishing).
    pub async fn task_is_complete(&self, task: TaskId) -> bool {
        let core = self.shared.core.lock().await;
        !core.tree.exists(task) || core.tree.is_complete(task)
    }

    /// Wait until every enqueued top-level task has completed.
    pub async fn wait_for_tasks(&self) {
        loop {
            {
                let core = self.shared.core.lock().await;
                let root = core.tree.root;
                if core
                    .tree
                    .children(root)
                    .iter()
                    .all(|c| core.tree.is_complete(*c))
                {
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}

impl ProjectCore {
    // === Resource creation (shared with the parse pipeline) ===

    /// Insert one new resource row. The URL must be normalized and absent
    /// from the in-memory index.
    pub(crate) async fn create_resource_locked(
        &mut self,
        shared: &ProjectShared,
        url: String,
        pending: &mut PendingCompletions,
    ) -> Result<ResourceId> {
        debug_assert!(!self.resources_by_url.contains_key(&url));
        let id = shared.store.insert_resource(&url).await?;
        self.resources
            .insert(id, Resource::new(id, url.clone(), false));
        self.resources_by_url.insert(url, id);
        self.resource_did_instantiate(shared, id, pending);
        Ok(id)
    }

    /// Insert many new resources in one transaction. URLs are joined
    /// against `base_url`, normalized, and deduplicated against both the
    /// index and each other. Returns the ids of newly-created resources.
    pub(crate) async fn bulk_create_resources_locked(
        &mut self,
        shared: &ProjectShared,
        raw_urls: &[String],
        base_url: &str,
        pending: &mut PendingCompletions,
    ) -> Result<Vec<ResourceId>> {
        let mut new_urls = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for raw in raw_urls {
            let Some(url) = crystal_common::join_url(base_url, raw) else {
                continue;
            };
            if self.resources_by_url.contains_key(&url) || !seen.insert(url.clone()) {
                continue;
            }
            new_urls.push(url);
        }
        if new_urls.is_empty() {
            return Ok(Vec::new());
        }
        let ids = shared.store.insert_resources_bulk(&new_urls).await?;
        let mut created = Vec::with_capacity(ids.len());
        for (id, url) in ids.into_iter().zip(new_urls) {
            self.resources
                .insert(id, Resource::new(id, url.clone(), false));
            self.resources_by_url.insert(url, id);
            created.push(id);
        }
        for &id in &created {
            self.resource_did_instantiate(shared, id, pending);
        }
        Ok(created)
    }

    /// Fan a new resource out to groups: extend cached member lists and
    /// notify member-download tasks watching for growth.
    fn resource_did_instantiate(
        &mut self,
        shared: &ProjectShared,
        id: ResourceId,
        pending: &mut PendingCompletions,
    ) {
        let url = self.resources[&id].url.clone();
        let group_ids: Vec<GroupId> = self.groups.keys().copied().collect();
        for group_id in group_ids {
            let matches = {
                let group = &self.groups[&group_id];
                group.contains_url(&url)
            };
            if !matches {
                continue;
            }
            if let Some(members) = &mut self
                .groups
                .get_mut(&group_id)
                .expect("group exists")
                .members
            {
                members.push(id);
            }
            group::group_did_add_member(shared, self, group_id, id, pending);
            shared.emit(ModelEvent::GroupDidAddMember {
                group: group_id,
                member: id,
            });
        }
        shared.emit(ModelEvent::ResourceDidInstantiate(id));
    }

    fn forget_root_resource_locked(&mut self, shared: &ProjectShared, id: RootResourceId) {
        if self.root_resources.remove(&id).is_some() {
            shared.emit(ModelEvent::RootResourceDidForget(id));
        }
    }

    // === Groups ===

    /// Validate a prospective source for a group: it must exist, and
    /// following the source chain must never return to the group.
    fn validate_source(&self, source: Option<GroupSource>, group: Option<GroupId>) -> Result<()> {
        match source {
            None => Ok(()),
            Some(GroupSource::RootResource(id)) => {
                if self.root_resources.contains_key(&id) {
                    Ok(())
                } else {
                    Err(CrystalError::CrossProjectReference)
                }
            }
            Some(GroupSource::Group(mut id)) => {
                let mut hops = 0;
                loop {
                    if Some(id) == group {
                        return Err(CrystalError::GroupSourceCycle);
                    }
                    let next = self
                        .groups
                        .get(&id)
                        .ok_or(CrystalError::CrossProjectReference)?
                        .source;
                    match next {
                        Some(GroupSource::Group(next_id)) => {
                            id = next_id;
                            hops += 1;
                            if hops > self.groups.len() {
                                return Err(CrystalError::GroupSourceCycle);
                            }
                        }
                        _ => return Ok(()),
                    }
                }
            }
        }
    }

    /// Member ids of a group, computing the cache on first access.
    pub(crate) fn group_members_locked(&mut self, id: GroupId) -> Result<Vec<ResourceId>> {
        let group = self.groups.get(&id).ok_or(CrystalError::NoSuchEntity)?;
        if let Some(members) = &group.members {
            return Ok(members.clone());
        }
        let prefix = group.pattern.literal_prefix().to_string();
        let members: Vec<ResourceId> = self
            .resources
            .values()
            .filter(|r| r.url.starts_with(&prefix) && self.groups[&id].contains_url(&r.url))
            .map(|r| r.id)
            .collect();
        self.groups
            .get_mut(&id)
            .expect("group exists")
            .members = Some(members.clone());
        Ok(members)
    }

    // === Revisions ===

    pub(crate) async fn delete_revision_locked(
        &mut self,
        shared: &ProjectShared,
        rev: &ResourceRevision,
    ) -> Result<()> {
        shared.store.delete_revision(rev.id).await?;
        if let Some(resource) = self.resources.get_mut(&rev.resource_id) {
            resource.already_downloaded_this_session = false;
        }
        shared.emit(ModelEvent::RevisionDidForget {
            resource: rev.resource_id,
            revision: rev.id,
        });
        revision::remove_body_file(&shared.path, shared.major_version, rev.id)
    }

    /// Map from ETag to the most recent revision declaring it.
    pub(crate) async fn revisions_by_etag(
        &self,
        shared: &ProjectShared,
        resource_id: ResourceId,
    ) -> Result<HashMap<String, ResourceRevision>> {
        let url = self
            .resources
            .get(&resource_id)
            .ok_or(CrystalError::NoSuchEntity)?
            .url
            .clone();
        let mut map = HashMap::new();
        for row in shared.store.revisions_for_resource(resource_id).await? {
            let rev = ResourceRevision::from_row(&row, url.clone())?;
            if rev.error.is_none() {
                if let Some(etag) = rev.etag() {
                    map.insert(etag.to_string(), rev.clone());
                }
            }
        }
        Ok(map)
    }

    // === Tasks ===

    /// Append a task to the root task. Fails once the project is closed.
    pub(crate) fn add_top_level_task_locked(&mut self, task: TaskId) -> Result<()> {
        let root = self.tree.root;
        if self.tree.is_complete(root) {
            return Err(CrystalError::ProjectClosed);
        }
        if self.tree.children(root).contains(&task) {
            return Ok(());
        }
        if self.tree.is_complete(task) {
            // Nothing left to schedule; don't wake the root for it.
            return Ok(());
        }
        self.tree.append_child(root, task);
        Ok(())
    }

    /// The configured request cookie, when its scope predicate accepts the
    /// URL: with a default URL prefix configured the cookie applies only
    /// underneath it, otherwise everywhere.
    pub(crate) fn applicable_cookie(&self, url: &str) -> Option<String> {
        let cookie = self.properties.get("request_cookie")?;
        match self.properties.get("default_url_prefix") {
            Some(prefix) if !url.starts_with(prefix.as_str()) => None,
            _ => Some(cookie.clone()),
        }
    }

    pub(crate) fn min_fetch_date(&self) -> Option<DateTime<Utc>> {
        let raw = self.properties.get("min_fetch_date")?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|d| d.with_timezone(&Utc))
    }
}

fn clear_tmp_dir(tmp: &Path) {
    let Ok(entries) = std::fs::read_dir(tmp) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to clear leftover temp file");
        }
    }
}

/// A crashed write can leave the newest revision row pointing at a body
/// file that was never published. Delete such a row, but only after
/// confirming the filesystem itself is live (so a disconnected disk does
/// not cause data loss).
async fn repair_dangling_revision(path: &Path, major_version: u32, store: &Store) -> Result<()> {
    let Some(row) = store.max_revision().await? else {
        return Ok(());
    };
    if row.error != "null" {
        return Ok(()); // error revisions have no body
    }
    if revision::body_file_exists(path, major_version, row.id)? {
        return Ok(());
    }
    // Probe the filesystem before concluding the body is truly gone
    let probe_path = path.join(TMP_DIRNAME).join(".fs-probe");
    let probe_ok = std::fs::write(&probe_path, b"probe").is_ok()
        && std::fs::read(&probe_path).map(|b| b == b"probe").unwrap_or(false);
    let _ = std::fs::remove_file(&probe_path);
    if probe_ok {
        warn!(revision = row.id, "Deleting dangling revision row with no body file");
        store.delete_revision(row.id).await?;
    }
    Ok(())
}
