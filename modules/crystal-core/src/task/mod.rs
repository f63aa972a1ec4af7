//! The task tree: long-running operations organized as a tree of typed
//! nodes, driven one unit of work at a time by the scheduler.
//!
//! Leaf tasks (body download, link parse) perform one blocking step on the
//! scheduler; container tasks sequence or interleave their children and
//! react to child completions by appending more children. Nodes live in an
//! id-keyed arena owned by the project; observers receive typed events over
//! a broadcast channel.

pub(crate) mod download;
pub(crate) mod group;
pub(crate) mod scheduler;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::warn;

use crystal_links::Link;

use crate::error::CrystalError;
use crate::model::resource::ResourceId;
use crate::model::resource_group::GroupId;
use crate::model::revision::ResourceRevision;
use crate::progress::Progress;

pub type TaskId = u64;

/// Events published by the task tree.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    SubtitleDidChange { task: TaskId, subtitle: String },
    DidAppendChild { parent: TaskId, child: TaskId },
    DidComplete { task: TaskId },
    DidClearChildren { parent: TaskId },
    DidCrash { task: TaskId, reason: String },
}

/// How a container hands out units from its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SchedulingStyle {
    /// Has no children; performs its own single unit of work.
    Leaf,
    /// Each child is fully executed before the next one begins.
    Sequential,
    /// One unit from each child per scheduler pass.
    RoundRobin,
}

// === Results and futures ===

pub type SharedError = Arc<CrystalError>;

/// Result of a body download: the head revision, and whether the network
/// was actually used (as opposed to reusing a cached revision).
#[derive(Debug, Clone)]
pub struct BodyResult {
    pub revision: ResourceRevision,
    pub did_download: bool,
}

pub type BodyOutcome = std::result::Result<BodyResult, SharedError>;

/// Result of a link parse: the links found, each link's resolved absolute
/// URL (None when unresolvable), and the resources created for them.
#[derive(Debug, Clone)]
pub(crate) struct ParseResult {
    pub links: Vec<Link>,
    pub resolved_urls: Vec<Option<String>>,
    #[allow(dead_code)] // part of the parse contract; consumed by observers
    pub created: Vec<ResourceId>,
}

pub(crate) type ParseOutcome = std::result::Result<ParseResult, SharedError>;

/// A single-shot result slot with any number of async observers.
#[derive(Debug, Clone)]
pub struct Promise<T: Clone> {
    tx: Arc<watch::Sender<Option<T>>>,
}

impl<T: Clone> Promise<T> {
    pub fn new() -> Promise<T> {
        let (tx, _) = watch::channel(None);
        Promise { tx: Arc::new(tx) }
    }

    /// Store the result. A second set is ignored.
    pub fn set(&self, value: T) {
        self.tx.send_modify(|slot| {
            if slot.is_none() {
                *slot = Some(value);
            }
        });
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn subscribe(&self) -> PromiseFuture<T> {
        PromiseFuture {
            rx: self.tx.subscribe(),
            _keep: self.tx.clone(),
        }
    }
}

impl<T: Clone> Default for Promise<T> {
    fn default() -> Self {
        Promise::new()
    }
}

/// Observer half of a [`Promise`]. Holds the slot alive, so waiting never
/// fails even after the owning task is culled from the tree.
#[derive(Debug, Clone)]
pub struct PromiseFuture<T: Clone> {
    rx: watch::Receiver<Option<T>>,
    _keep: Arc<watch::Sender<Option<T>>>,
}

impl<T: Clone> PromiseFuture<T> {
    pub async fn wait(&mut self) -> T {
        let guard = self
            .rx
            .wait_for(|slot| slot.is_some())
            .await
            .expect("promise sender is held alive by this future");
        guard.as_ref().expect("slot checked non-empty").clone()
    }

    pub fn peek(&self) -> Option<T> {
        self.rx.borrow().clone()
    }
}

// === Task kinds ===

#[derive(Debug)]
pub(crate) struct DownloadResourceState {
    pub resource: ResourceId,
    pub is_embedded: bool,
    pub body_task: Option<TaskId>,
    pub parse_task: Option<TaskId>,
    /// Set when the resource was already downloaded this session and the
    /// task therefore carries an already-downloaded placeholder child.
    pub already_downloaded: bool,
    pub progress: Option<Progress>,
}

#[derive(Debug)]
pub(crate) struct DownloadBodyState {
    pub resource: ResourceId,
    pub promise: Promise<BodyOutcome>,
    pub result: Option<BodyOutcome>,
}

#[derive(Debug)]
pub(crate) struct ParseLinksState {
    pub revision: ResourceRevision,
    pub result: Option<ParseOutcome>,
}

#[derive(Debug)]
pub(crate) struct UpdateGroupMembersState {
    pub group: GroupId,
}

#[derive(Debug)]
pub(crate) struct DownloadGroupMembersState {
    pub group: GroupId,
    pub done_updating: bool,
    pub progress: Progress,
}

#[derive(Debug)]
pub(crate) struct DownloadGroupState {
    pub group: GroupId,
    pub update_task: TaskId,
    pub members_task: TaskId,
    pub started_members: bool,
}

#[derive(Debug)]
pub(crate) enum TaskKind {
    Root,
    DownloadResource(DownloadResourceState),
    DownloadBody(DownloadBodyState),
    ParseLinks(ParseLinksState),
    UpdateGroupMembers(UpdateGroupMembersState),
    DownloadGroupMembers(DownloadGroupMembersState),
    DownloadGroup(DownloadGroupState),
    /// Pre-completed leaf summarizing culled children (or an
    /// already-downloaded resource). Does not participate in parent
    /// tracking.
    Placeholder,
}

impl TaskKind {
    pub(crate) fn scheduling_style(&self) -> SchedulingStyle {
        match self {
            TaskKind::Root => SchedulingStyle::RoundRobin,
            TaskKind::DownloadResource(_) => SchedulingStyle::Sequential,
            TaskKind::DownloadBody(_) => SchedulingStyle::Leaf,
            TaskKind::ParseLinks(_) => SchedulingStyle::Leaf,
            TaskKind::UpdateGroupMembers(_) => SchedulingStyle::Sequential,
            TaskKind::DownloadGroupMembers(_) => SchedulingStyle::Sequential,
            TaskKind::DownloadGroup(_) => SchedulingStyle::RoundRobin,
            TaskKind::Placeholder => SchedulingStyle::Leaf,
        }
    }
}

// === Units ===

/// The work carried by one task unit. Runs on the scheduler without the
/// project core lock held.
#[derive(Debug)]
pub(crate) enum UnitWork {
    DownloadBody { resource: ResourceId },
    ParseLinks { revision: ResourceRevision },
}

/// The smallest chunk of scheduler work: one leaf task's single step.
#[derive(Debug)]
pub(crate) struct TaskUnit {
    pub task: TaskId,
    pub work: UnitWork,
}

// === Nodes ===

#[derive(Debug)]
pub(crate) struct TaskNode {
    pub title: String,
    pub subtitle: String,
    pub parent: Option<TaskId>,
    /// Tasks notified when this one completes. Usually the single parent,
    /// but a shared in-flight download task may have several.
    pub subscribers: Vec<TaskId>,
    pub children: Vec<TaskId>,
    pub num_children_complete: usize,
    pub complete: bool,
    /// Set when a scheduling step or completion handler for this task
    /// failed; the subtree stops producing work but the scheduler lives on.
    pub crash_reason: Option<String>,
    pub next_child_index: usize,
    pub did_yield_self: bool,
    pub kind: TaskKind,
}

/// Parent/child completion notifications waiting to be processed by the
/// completion pump.
pub(crate) type PendingCompletions = VecDeque<(TaskId, TaskId)>;

pub(crate) struct TaskTree {
    nodes: HashMap<TaskId, TaskNode>,
    next_id: TaskId,
    pub(crate) root: TaskId,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskTree {
    pub(crate) fn new(events: broadcast::Sender<TaskEvent>) -> TaskTree {
        let mut tree = TaskTree {
            nodes: HashMap::new(),
            next_id: 1,
            root: 0,
            events,
        };
        let root = tree.add("ROOT".to_string(), TaskKind::Root);
        tree.nodes.get_mut(&root).expect("root exists").subtitle = "Running".to_string();
        tree.root = root;
        tree
    }

    // === Node management ===

    pub(crate) fn add(&mut self, title: String, kind: TaskKind) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(
            id,
            TaskNode {
                title,
                subtitle: "Queued".to_string(),
                parent: None,
                subscribers: Vec::new(),
                children: Vec::new(),
                num_children_complete: 0,
                complete: false,
                crash_reason: None,
                next_child_index: 0,
                did_yield_self: false,
                kind,
            },
        );
        id
    }

    /// Add a pre-completed placeholder leaf.
    pub(crate) fn add_placeholder(&mut self, title: String) -> TaskId {
        let id = self.add(title, TaskKind::Placeholder);
        let node = self.nodes.get_mut(&id).expect("just added");
        node.complete = true;
        node.subtitle = "Complete".to_string();
        id
    }

    pub(crate) fn node(&self, id: TaskId) -> Option<&TaskNode> {
        self.nodes.get(&id)
    }

    pub(crate) fn node_mut(&mut self, id: TaskId) -> Option<&mut TaskNode> {
        self.nodes.get_mut(&id)
    }

    pub(crate) fn exists(&self, id: TaskId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub(crate) fn is_complete(&self, id: TaskId) -> bool {
        self.nodes.get(&id).map(|n| n.complete).unwrap_or(true)
    }

    pub(crate) fn children(&self, id: TaskId) -> Vec<TaskId> {
        self.nodes
            .get(&id)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    /// Append a child to a container. A complete child may only be appended
    /// when the caller takes responsibility for the deferred completion
    /// bookkeeping (`queue_deferred_complete`).
    pub(crate) fn append_child(&mut self, parent: TaskId, child: TaskId) {
        let child_complete = self.is_complete(child);
        let child_is_placeholder = matches!(
            self.nodes.get(&child).map(|n| &n.kind),
            Some(TaskKind::Placeholder)
        );
        if let Some(node) = self.nodes.get_mut(&child) {
            // Placeholders are flyweights: parent assignment is a no-op.
            if !child_is_placeholder {
                node.parent = Some(parent);
            }
            if !child_complete {
                node.subscribers.push(parent);
                if node.subscribers.len() >= 50 {
                    warn!(task = child, subscribers = node.subscribers.len(),
                        "Task has many subscribers and may be leaking them");
                }
            }
        }
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.push(child);
        }
        let _ = self.events.send(TaskEvent::DidAppendChild { parent, child });
    }

    /// Record the deferred child-complete bookkeeping for a child that was
    /// already complete when appended.
    pub(crate) fn queue_deferred_complete(
        &mut self,
        parent: TaskId,
        child: TaskId,
        pending: &mut PendingCompletions,
    ) {
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.num_children_complete += 1;
        }
        pending.push_back((parent, child));
    }

    // === Subtitles ===

    /// Set a task's subtitle and forward it to interested parents the way
    /// each container kind advertises child activity.
    pub(crate) fn set_subtitle(&mut self, id: TaskId, subtitle: impl Into<String>) {
        let subtitle = subtitle.into();
        let mut queue = vec![(id, subtitle)];
        while let Some((task, text)) = queue.pop() {
            let Some(node) = self.nodes.get_mut(&task) else {
                continue;
            };
            if node.subtitle == "Complete" && text != "Complete" {
                continue;
            }
            if node.subtitle == text {
                continue;
            }
            node.subtitle = text.clone();
            let subscribers = node.subscribers.clone();
            let child_complete = node.complete;
            let _ = self.events.send(TaskEvent::SubtitleDidChange {
                task,
                subtitle: text.clone(),
            });

            for parent in subscribers {
                let Some(parent_node) = self.nodes.get_mut(&parent) else {
                    continue;
                };
                match &mut parent_node.kind {
                    TaskKind::DownloadResource(state) => {
                        if state.body_task == Some(task) && !child_complete {
                            queue.push((parent, text.clone()));
                        }
                    }
                    TaskKind::UpdateGroupMembers(_) => {
                        if !child_complete {
                            queue.push((parent, text.clone()));
                        }
                    }
                    TaskKind::DownloadGroup(state) => {
                        if state.update_task == task && !state.started_members {
                            queue.push((parent, "Updating group members...".to_string()));
                        } else if state.members_task == task {
                            state.started_members = true;
                            queue.push((parent, text.clone()));
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    // === Completion ===

    /// Mark a task complete and queue completion notifications for every
    /// subscriber. Completion is monotonic.
    pub(crate) fn complete_task(&mut self, id: TaskId, pending: &mut PendingCompletions) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        if node.complete {
            return;
        }
        node.complete = true;
        node.subtitle = "Complete".to_string();
        let subscribers = std::mem::take(&mut node.subscribers);
        let _ = self.events.send(TaskEvent::SubtitleDidChange {
            task: id,
            subtitle: "Complete".to_string(),
        });
        let _ = self.events.send(TaskEvent::DidComplete { task: id });

        for parent in subscribers {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.num_children_complete += 1;
                pending.push_back((parent, id));
            }
        }
    }

    /// Capture a failure on the nearest enclosing task and quiesce its
    /// subtree. The scheduler continues to operate.
    pub(crate) fn record_crash(&mut self, id: TaskId, subsystem: &str, reason: String) {
        tracing::error!(task = id, subsystem, %reason, "Task crashed");
        if let Some(node) = self.nodes.get_mut(&id) {
            if node.crash_reason.is_none() {
                node.crash_reason = Some(reason.clone());
            }
        }
        let _ = self.events.send(TaskEvent::DidCrash { task: id, reason });
    }

    /// Replace all (complete) children with a new set of complete children.
    /// Used by containers to cull bulky finished subtrees into a compact
    /// placeholder summary.
    pub(crate) fn finalize_children(&mut self, id: TaskId, final_children: Vec<TaskId>) {
        let old_children = self.children(id);
        debug_assert!(old_children.iter().all(|c| self.is_complete(*c)));
        for child in old_children {
            if !final_children.contains(&child) {
                self.remove_subtree(child);
            } else if let Some(node) = self.nodes.get_mut(&child) {
                node.parent = None;
            }
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.children.clear();
            node.num_children_complete = 0;
            node.next_child_index = 0;
        }
        let _ = self.events.send(TaskEvent::DidClearChildren { parent: id });
        let count = final_children.len();
        for child in final_children {
            self.append_child(id, child);
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.num_children_complete = count;
        }
    }

    /// Drop every completed child of a container. Used by the root task
    /// after each full scheduling pass.
    pub(crate) fn clear_completed_children(&mut self, id: TaskId) -> bool {
        let children = self.children(id);
        let (done, live): (Vec<TaskId>, Vec<TaskId>) =
            children.into_iter().partition(|c| self.is_complete(*c));
        if done.is_empty() {
            return false;
        }
        for child in &done {
            self.remove_subtree(*child);
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.children = live;
            node.num_children_complete = node.num_children_complete.saturating_sub(done.len());
            node.next_child_index = 0;
        }
        let _ = self.events.send(TaskEvent::DidClearChildren { parent: id });
        true
    }

    fn remove_subtree(&mut self, id: TaskId) {
        if let Some(node) = self.nodes.remove(&id) {
            for child in node.children {
                // A shared child may also hang under a live parent; only
                // remove it when this was its recorded parent.
                let still_owned_elsewhere = self
                    .nodes
                    .get(&child)
                    .map(|n| n.parent.is_some() && n.parent != Some(id))
                    .unwrap_or(true);
                if !still_owned_elsewhere {
                    self.remove_subtree(child);
                }
            }
        }
    }

    // === Unit extraction ===

    /// Walk the tree from the given task and extract the next unit of work,
    /// or None if nothing can run until an in-flight unit completes.
    pub(crate) fn try_get_next_task_unit(&mut self, id: TaskId) -> Option<TaskUnit> {
        let node = self.nodes.get(&id)?;
        if node.complete || node.crash_reason.is_some() {
            return None;
        }
        match node.kind.scheduling_style() {
            SchedulingStyle::Leaf => self.leaf_unit(id),
            SchedulingStyle::Sequential => self.sequential_unit(id),
            SchedulingStyle::RoundRobin => self.round_robin_unit(id),
        }
    }

    fn leaf_unit(&mut self, id: TaskId) -> Option<TaskUnit> {
        let node = self.nodes.get_mut(&id)?;
        if node.did_yield_self {
            return None;
        }
        let work = match &node.kind {
            TaskKind::DownloadBody(state) => UnitWork::DownloadBody {
                resource: state.resource,
            },
            TaskKind::ParseLinks(state) => UnitWork::ParseLinks {
                revision: state.revision.clone(),
            },
            // Placeholders are born complete and never reach here.
            _ => return None,
        };
        node.did_yield_self = true;
        Some(TaskUnit { task: id, work })
    }

    fn sequential_unit(&mut self, id: TaskId) -> Option<TaskUnit> {
        let children = self.children(id);
        let mut first_incomplete = self.nodes.get(&id)?.next_child_index;
        while first_incomplete < children.len() && self.is_complete(children[first_incomplete]) {
            first_incomplete += 1;
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.next_child_index = first_incomplete;
        }
        // Scan forward from the first incomplete child: a later child may
        // have work even while an earlier one waits on its in-flight unit.
        let mut cur = first_incomplete;
        while cur < children.len() {
            if let Some(unit) = self.try_get_next_task_unit(children[cur]) {
                return Some(unit);
            }
            cur += 1;
        }
        None
    }

    fn round_robin_unit(&mut self, id: TaskId) -> Option<TaskUnit> {
        let mut children = self.children(id);
        if children.is_empty() {
            return None;
        }
        let mut start = self.nodes.get(&id)?.next_child_index;
        if start >= children.len() {
            start = 0;
        }
        if start == 0 && self.did_schedule_all_children(id) {
            children = self.children(id);
            if children.is_empty() {
                return None;
            }
        }
        let mut cur = start;
        loop {
            if let Some(unit) = self.try_get_next_task_unit(children[cur]) {
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.next_child_index = (cur + 1) % children.len();
                }
                return Some(unit);
            }
            cur = (cur + 1) % children.len();
            if cur == start {
                // Wrapped without finding anything to do
                return None;
            }
            if cur == 0 && self.did_schedule_all_children(id) {
                children = self.children(id);
                if children.is_empty() {
                    return None;
                }
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.next_child_index = 0;
                }
                start = 0;
                cur = 0;
                if let Some(unit) = self.try_get_next_task_unit(children[cur]) {
                    if let Some(node) = self.nodes.get_mut(&id) {
                        node.next_child_index = 1 % children.len();
                    }
                    return Some(unit);
                }
                cur = 1 % children.len();
                if cur == start {
                    return None;
                }
            }
        }
    }

    /// Give a round-robin container the chance to cull or reorder children
    /// after a full pass. Returns whether the child list changed.
    fn did_schedule_all_children(&mut self, id: TaskId) -> bool {
        let is_root = matches!(self.nodes.get(&id).map(|n| &n.kind), Some(TaskKind::Root));
        if is_root {
            self.clear_completed_children(id)
        } else {
            false
        }
    }

    /// Reset the round-robin cursor; used by the scheduler after a crash.
    pub(crate) fn reset_cursor(&mut self, id: TaskId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.next_child_index = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tree() -> TaskTree {
        let (events, _) = broadcast::channel(64);
        TaskTree::new(events)
    }

    fn body_kind(resource: ResourceId) -> TaskKind {
        TaskKind::DownloadBody(DownloadBodyState {
            resource,
            promise: Promise::new(),
            result: None,
        })
    }

    fn container_kind(resource: ResourceId) -> TaskKind {
        TaskKind::DownloadResource(DownloadResourceState {
            resource,
            is_embedded: false,
            body_task: None,
            parse_task: None,
            already_downloaded: false,
            progress: None,
        })
    }

    // --- Leaf scheduling ---

    #[test]
    fn a_leaf_yields_its_unit_exactly_once() {
        let mut tree = test_tree();
        let leaf = tree.add("leaf".to_string(), body_kind(1));
        let root = tree.root;
        tree.append_child(root, leaf);

        let unit = tree.try_get_next_task_unit(root).expect("one unit");
        assert_eq!(unit.task, leaf);
        assert!(tree.try_get_next_task_unit(root).is_none());
    }

    #[test]
    fn completed_tasks_yield_nothing() {
        let mut tree = test_tree();
        let leaf = tree.add("leaf".to_string(), body_kind(1));
        let root = tree.root;
        tree.append_child(root, leaf);
        let mut pending = PendingCompletions::new();
        tree.complete_task(leaf, &mut pending);
        assert!(tree.try_get_next_task_unit(leaf).is_none());
    }

    // --- Sequential containers ---

    #[test]
    fn sequential_children_are_offered_in_order() {
        let mut tree = test_tree();
        let container = tree.add("dl".to_string(), container_kind(1));
        let first = tree.add("first".to_string(), body_kind(2));
        let second = tree.add("second".to_string(), body_kind(3));
        tree.append_child(container, first);
        tree.append_child(container, second);

        let unit = tree.try_get_next_task_unit(container).unwrap();
        assert_eq!(unit.task, first);
        // The first child's unit is in flight; its later sibling may still
        // contribute work.
        let unit = tree.try_get_next_task_unit(container).unwrap();
        assert_eq!(unit.task, second);
        assert!(tree.try_get_next_task_unit(container).is_none());
    }

    #[test]
    fn sequential_cursor_skips_completed_prefix() {
        let mut tree = test_tree();
        let container = tree.add("dl".to_string(), container_kind(1));
        let first = tree.add("first".to_string(), body_kind(2));
        let second = tree.add("second".to_string(), body_kind(3));
        tree.append_child(container, first);
        tree.append_child(container, second);

        let mut pending = PendingCompletions::new();
        tree.complete_task(first, &mut pending);

        let unit = tree.try_get_next_task_unit(container).unwrap();
        assert_eq!(unit.task, second);
        assert_eq!(tree.node(container).unwrap().next_child_index, 1);
    }

    // --- Round-robin containers ---

    #[test]
    fn round_robin_offers_one_unit_per_child_per_pass() {
        let mut tree = test_tree();
        let root = tree.root;
        let a = tree.add("a".to_string(), container_kind(1));
        let b = tree.add("b".to_string(), container_kind(2));
        let a_body = tree.add("a body".to_string(), body_kind(1));
        let b_body = tree.add("b body".to_string(), body_kind(2));
        tree.append_child(a, a_body);
        tree.append_child(b, b_body);
        tree.append_child(root, a);
        tree.append_child(root, b);

        let first = tree.try_get_next_task_unit(root).unwrap();
        let second = tree.try_get_next_task_unit(root).unwrap();
        assert_eq!(first.task, a_body);
        assert_eq!(second.task, b_body);
        assert!(tree.try_get_next_task_unit(root).is_none());
    }

    #[test]
    fn root_culls_completed_children_after_a_full_pass() {
        let mut tree = test_tree();
        let root = tree.root;
        let done = tree.add("done".to_string(), container_kind(1));
        let live = tree.add("live".to_string(), container_kind(2));
        let live_body = tree.add("live body".to_string(), body_kind(2));
        tree.append_child(live, live_body);
        tree.append_child(root, done);
        tree.append_child(root, live);

        let mut pending = PendingCompletions::new();
        tree.complete_task(done, &mut pending);

        // Extraction triggers the end-of-pass cull
        let unit = tree.try_get_next_task_unit(root).unwrap();
        assert_eq!(unit.task, live_body);
        assert_eq!(tree.children(root), vec![live]);
        assert!(!tree.exists(done));
    }

    // --- Completion bookkeeping ---

    #[test]
    fn completion_is_monotonic_and_counted_once() {
        let mut tree = test_tree();
        let container = tree.add("dl".to_string(), container_kind(1));
        let child = tree.add("child".to_string(), body_kind(2));
        tree.append_child(container, child);

        let mut pending = PendingCompletions::new();
        tree.complete_task(child, &mut pending);
        tree.complete_task(child, &mut pending);

        let node = tree.node(container).unwrap();
        assert_eq!(node.num_children_complete, 1);
        assert_eq!(pending.len(), 1);
        assert!(tree.is_complete(child));
    }

    #[test]
    fn crashed_subtrees_stop_producing_work() {
        let mut tree = test_tree();
        let root = tree.root;
        let container = tree.add("dl".to_string(), container_kind(1));
        let child = tree.add("child".to_string(), body_kind(2));
        tree.append_child(container, child);
        tree.append_child(root, container);

        tree.record_crash(container, "bulkhead", "boom".to_string());
        assert!(tree.try_get_next_task_unit(root).is_none());
        assert!(!tree.is_complete(container));
    }

    // --- Promises ---

    #[tokio::test]
    async fn promises_are_single_shot() {
        let promise: Promise<i32> = Promise::new();
        let mut future = promise.subscribe();
        promise.set(7);
        promise.set(9); // ignored
        assert_eq!(future.wait().await, 7);
        assert_eq!(future.peek(), Some(7));
    }

    #[tokio::test]
    async fn promise_futures_outlive_the_promise() {
        let promise: Promise<i32> = Promise::new();
        promise.set(42);
        let mut future = promise.subscribe();
        drop(promise);
        assert_eq!(future.wait().await, 42);
    }
}

/// Finish a task: run its kind-specific teardown (release the caffeine
/// claim, deregister group watchers, clear the resource's in-flight task
/// references), then mark it complete and queue subscriber notifications.
pub(crate) fn finish_task(
    shared: &crate::model::project::ProjectShared,
    core: &mut crate::model::project::ProjectCore,
    id: TaskId,
    pending: &mut PendingCompletions,
) {
    if core.tree.is_complete(id) {
        return;
    }
    match core.tree.node(id).map(|n| &n.kind) {
        Some(TaskKind::DownloadResource(state)) => {
            let resource = state.resource;
            if let Some(r) = core.resources.get_mut(&resource) {
                if r.download_task == Some(id) {
                    r.download_task = None;
                }
            }
        }
        Some(TaskKind::DownloadBody(state)) => {
            let resource = state.resource;
            if let Some(r) = core.resources.get_mut(&resource) {
                if r.download_body_task == Some(id) {
                    r.download_body_task = None;
                }
            }
        }
        Some(TaskKind::DownloadGroupMembers(state)) => {
            let group = state.group;
            if let Some(g) = core.groups.get_mut(&group) {
                g.member_watchers.retain(|&w| w != id);
            }
        }
        Some(TaskKind::DownloadGroup(_)) => {
            shared.caffeination.remove();
        }
        _ => {}
    }
    core.tree.complete_task(id, pending);
}
