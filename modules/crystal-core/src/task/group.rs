//! Group download tasks: refresh a group's membership by downloading its
//! source while, in parallel, downloading every member.

use crate::error::{CrystalError, Result};
use crate::model::project::{ProjectCore, ProjectShared};
use crate::model::resource::ResourceId;
use crate::model::resource_group::{GroupId, GroupSource};
use crate::progress::Progress;
use crate::task::scheduler::PostAction;
use crate::task::{
    download, finish_task, DownloadGroupMembersState, DownloadGroupState, PendingCompletions,
    TaskId, TaskKind, UpdateGroupMembersState,
};

// === Task construction ===

/// Task that downloads a group's source so that new members are
/// discovered. Completes immediately when the group has no source.
pub(crate) fn update_group_members_task(
    shared: &ProjectShared,
    core: &mut ProjectCore,
    group_id: GroupId,
    pending: &mut PendingCompletions,
) -> Result<TaskId> {
    let group = core.groups.get(&group_id).ok_or(CrystalError::NoSuchEntity)?;
    let title = format!("Finding members of group: {}", group.display_name());
    let source = group.source;
    let task = core.tree.add(
        title,
        TaskKind::UpdateGroupMembers(UpdateGroupMembersState { group: group_id }),
    );

    match source {
        None => {
            finish_task(shared, core, task, pending);
        }
        Some(GroupSource::RootResource(root_id)) => {
            let resource_id = core
                .root_resources
                .get(&root_id)
                .ok_or(CrystalError::NoSuchEntity)?
                .resource_id;
            let child =
                download::download_resource_task(shared, core, resource_id, false, false, pending);
            append_maybe_complete(core, task, child, pending);
        }
        Some(GroupSource::Group(source_group)) => {
            let child = download_group_task(shared, core, source_group, pending)?;
            append_maybe_complete(core, task, child, pending);
        }
    }
    Ok(task)
}

/// Task that downloads every member of a group. Grows as the source's
/// download discovers new matching resources.
pub(crate) fn download_group_members_task(
    shared: &ProjectShared,
    core: &mut ProjectCore,
    group_id: GroupId,
    pending: &mut PendingCompletions,
) -> Result<TaskId> {
    let title = {
        let group = core.groups.get(&group_id).ok_or(CrystalError::NoSuchEntity)?;
        format!("Downloading members of group: {}", group.display_name())
    };
    let members = core.group_members_locked(group_id)?;
    let task = core.tree.add(
        title,
        TaskKind::DownloadGroupMembers(DownloadGroupMembersState {
            group: group_id,
            done_updating: false,
            progress: Progress::new(0, members.len()),
        }),
    );
    core.groups
        .get_mut(&group_id)
        .expect("group exists")
        .member_watchers
        .push(task);

    for member in members {
        let child = download::download_resource_task(shared, core, member, false, false, pending);
        if core.tree.children(task).contains(&child) {
            continue;
        }
        append_maybe_complete(core, task, child, pending);
    }
    update_members_subtitle(core, task);
    Ok(task)
}

/// Task that downloads a whole group: the source (to refresh membership)
/// and the members, interleaved round-robin so that newly-discovered
/// members start downloading before all source work is finished.
pub(crate) fn download_group_task(
    shared: &ProjectShared,
    core: &mut ProjectCore,
    group_id: GroupId,
    pending: &mut PendingCompletions,
) -> Result<TaskId> {
    let title = {
        let group = core.groups.get(&group_id).ok_or(CrystalError::NoSuchEntity)?;
        format!("Downloading group: {}", group.display_name())
    };
    let update_task = update_group_members_task(shared, core, group_id, pending)?;
    let members_task = download_group_members_task(shared, core, group_id, pending)?;
    let task = core.tree.add(
        title,
        TaskKind::DownloadGroup(DownloadGroupState {
            group: group_id,
            update_task,
            members_task,
            started_members: false,
        }),
    );

    // Prevent system idle sleep while downloading a potentially large group
    shared.caffeination.add();

    append_maybe_complete(core, task, update_task, pending);
    append_maybe_complete(core, task, members_task, pending);
    Ok(task)
}

fn append_maybe_complete(
    core: &mut ProjectCore,
    parent: TaskId,
    child: TaskId,
    pending: &mut PendingCompletions,
) {
    core.tree.append_child(parent, child);
    if core.tree.is_complete(child) {
        core.tree.queue_deferred_complete(parent, child, pending);
    }
}

// === Membership growth ===

/// A new resource matching the group instantiated; append a download task
/// for it to every watching members task.
pub(crate) fn group_did_add_member(
    shared: &ProjectShared,
    core: &mut ProjectCore,
    group_id: GroupId,
    member: ResourceId,
    pending: &mut PendingCompletions,
) {
    let watchers = match core.groups.get(&group_id) {
        Some(group) => group.member_watchers.clone(),
        None => return,
    };
    for task in watchers {
        if !core.tree.exists(task) || core.tree.is_complete(task) {
            continue;
        }
        let child = download::download_resource_task(shared, core, member, false, false, pending);
        if core.tree.children(task).contains(&child) {
            continue;
        }
        if let Some(TaskKind::DownloadGroupMembers(state)) =
            core.tree.node_mut(task).map(|n| &mut n.kind)
        {
            state.progress.grow_total(1);
        }
        append_maybe_complete(core, task, child, pending);
        update_members_subtitle(core, task);
    }
}

// === Completion handling ===

/// Child of an UpdateGroupMembers task (the source download) completed.
pub(crate) fn on_update_child_complete(
    shared: &ProjectShared,
    core: &mut ProjectCore,
    parent: TaskId,
    _child: TaskId,
    pending: &mut PendingCompletions,
) {
    let Some(node) = core.tree.node(parent) else {
        return;
    };
    if node.num_children_complete == node.children.len() {
        finish_task(shared, core, parent, pending);
    }
}

/// Child of a DownloadGroupMembers task (one member download) completed.
pub(crate) fn on_members_child_complete(
    shared: &ProjectShared,
    core: &mut ProjectCore,
    parent: TaskId,
    _child: TaskId,
    pending: &mut PendingCompletions,
) {
    if core.tree.is_complete(parent) {
        return;
    }
    if let Some(TaskKind::DownloadGroupMembers(state)) =
        core.tree.node_mut(parent).map(|n| &mut n.kind)
    {
        state.progress.update(1);
    }
    update_members_subtitle(core, parent);
    check_members_complete(shared, core, parent, pending);
}

/// The group's source finished downloading; no further members will be
/// discovered.
pub(crate) fn group_members_done_updating(
    shared: &ProjectShared,
    core: &mut ProjectCore,
    members_task: TaskId,
    pending: &mut PendingCompletions,
) {
    if let Some(TaskKind::DownloadGroupMembers(state)) =
        core.tree.node_mut(members_task).map(|n| &mut n.kind)
    {
        state.done_updating = true;
    }
    update_members_subtitle(core, members_task);
    check_members_complete(shared, core, members_task, pending);
}

fn check_members_complete(
    shared: &ProjectShared,
    core: &mut ProjectCore,
    task: TaskId,
    pending: &mut PendingCompletions,
) {
    let Some(node) = core.tree.node(task) else {
        return;
    };
    let done_updating = match &node.kind {
        TaskKind::DownloadGroupMembers(state) => state.done_updating,
        _ => return,
    };
    if done_updating && node.num_children_complete == node.children.len() && !node.complete {
        finish_task(shared, core, task, pending);
    }
}

fn update_members_subtitle(core: &mut ProjectCore, task: TaskId) {
    let Some(node) = core.tree.node(task) else {
        return;
    };
    let (done_updating, phrase) = match &node.kind {
        TaskKind::DownloadGroupMembers(state) => {
            (state.done_updating, state.progress.remaining_phrase())
        }
        _ => return,
    };
    let of_phrase = if done_updating { "of" } else { "of at least" };
    let (num_complete, num_children) = (node.num_children_complete, node.children.len());
    core.tree.set_subtitle(
        task,
        format!("{num_complete} {of_phrase} {num_children} item(s) -- {phrase}"),
    );
}

/// Child of a DownloadResourceGroup task completed (either the membership
/// update or the member downloads).
pub(crate) fn on_group_child_complete(
    shared: &ProjectShared,
    core: &mut ProjectCore,
    parent: TaskId,
    child: TaskId,
    pending: &mut PendingCompletions,
    _actions: &mut Vec<PostAction>,
) {
    let (update_task, members_task) = match core.tree.node(parent).map(|n| &n.kind) {
        Some(TaskKind::DownloadGroup(state)) => (state.update_task, state.members_task),
        _ => return,
    };
    if child == update_task {
        group_members_done_updating(shared, core, members_task, pending);
    }
    let Some(node) = core.tree.node(parent) else {
        return;
    };
    if node.num_children_complete == node.children.len() && !node.complete {
        finish_task(shared, core, parent, pending);
    }
}
