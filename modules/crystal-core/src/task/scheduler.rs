//! The scheduler: one driver per project that walks the task tree,
//! extracts one unit of work at a time, and runs it.
//!
//! Scheduling is strictly single-threaded. Units run to completion before
//! the next unit is fetched, so ordering follows the tree's single cursor:
//! sequential containers finish child N before child N+1, round-robin
//! containers hand out one unit per child per pass.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::project::{ProjectCore, ProjectShared};
use crate::task::{
    download, finish_task, group, BodyOutcome, ParseOutcome, PendingCompletions, TaskId, TaskKind,
    TaskUnit, UnitWork,
};

/// Follow-up work a completion handler defers back to the scheduler.
#[derive(Debug)]
pub(crate) enum PostAction {
    /// Sleep the inter-page delay, then finish the task. Skipped entirely
    /// when the project is closing.
    DelayThenFinish { task: TaskId },
}

enum LeafOutcome {
    Body(BodyOutcome),
    Parse(ParseOutcome),
}

pub(crate) fn spawn(shared: Arc<ProjectShared>) -> JoinHandle<()> {
    tokio::spawn(run(shared))
}

async fn run(shared: Arc<ProjectShared>) {
    info!("Scheduler started");
    'outer: loop {
        let unit = {
            let mut core = shared.core.lock().await;
            let root = core.tree.root;
            if core.tree.is_complete(root) {
                break;
            }
            core.tree.try_get_next_task_unit(root)
        };

        let Some(unit) = unit else {
            tokio::time::sleep(shared.config.poll_interval).await;
            continue;
        };
        debug!(task = unit.task, "Running task unit");

        let outcome = run_unit(&shared, &unit).await;
        if outcome_is_project_closed(&outcome) {
            // The project went away underneath us; exit quietly.
            break;
        }

        let actions = {
            let mut core = shared.core.lock().await;
            let mut pending = PendingCompletions::new();
            apply_leaf_outcome(&shared, &mut core, unit.task, outcome, &mut pending);
            match process_completions(&shared, &mut core, &mut pending).await {
                Ok(actions) => actions,
                Err(e) if e.is_project_closed() => break,
                Err(e) => {
                    // Back off so a persistent failure cannot hot-spin,
                    // then rewind to the first top-level task and resume.
                    warn!(error = %e, "Scheduler step failed; backing off");
                    let root = core.tree.root;
                    core.tree.reset_cursor(root);
                    drop(core);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            }
        };

        let mut worklist: VecDeque<PostAction> = actions.into();
        while let Some(PostAction::DelayThenFinish { task }) = worklist.pop_front() {
            if shared.is_closed() {
                // Cancellation: do not advance, do not sleep.
                continue;
            }
            {
                let mut core = shared.core.lock().await;
                core.tree
                    .set_subtitle(task, "Waiting before performing next request...");
            }
            tokio::time::sleep(shared.config.delay_between_downloads).await;
            if shared.is_closed() {
                continue;
            }
            let mut core = shared.core.lock().await;
            let mut pending = PendingCompletions::new();
            finish_task(&shared, &mut core, task, &mut pending);
            match process_completions(&shared, &mut core, &mut pending).await {
                Ok(more) => worklist.extend(more),
                Err(e) if e.is_project_closed() => break 'outer,
                Err(e) => {
                    warn!(error = %e, "Completion handling failed after delay");
                }
            }
        }
    }
    info!("Scheduler exited");
}

async fn run_unit(shared: &Arc<ProjectShared>, unit: &TaskUnit) -> LeafOutcome {
    match &unit.work {
        UnitWork::DownloadBody { resource } => {
            LeafOutcome::Body(download::run_download_body(shared, unit.task, *resource).await)
        }
        UnitWork::ParseLinks { revision } => LeafOutcome::Parse(
            download::run_parse_links(shared, unit.task, revision.clone()).await,
        ),
    }
}

fn outcome_is_project_closed(outcome: &LeafOutcome) -> bool {
    match outcome {
        LeafOutcome::Body(Err(e)) => e.is_project_closed(),
        LeafOutcome::Parse(Err(e)) => e.is_project_closed(),
        _ => false,
    }
}

/// Store a finished unit's result on its leaf task, resolve the leaf's
/// future, and mark it complete.
fn apply_leaf_outcome(
    shared: &ProjectShared,
    core: &mut ProjectCore,
    task: TaskId,
    outcome: LeafOutcome,
    pending: &mut PendingCompletions,
) {
    match (core.tree.node_mut(task).map(|n| &mut n.kind), outcome) {
        (Some(TaskKind::DownloadBody(state)), LeafOutcome::Body(result)) => {
            state.result = Some(result.clone());
            state.promise.set(result);
        }
        (Some(TaskKind::ParseLinks(state)), LeafOutcome::Parse(result)) => {
            state.result = Some(result);
        }
        _ => {}
    }
    finish_task(shared, core, task, pending);
}

/// The completion pump: deliver queued child-complete notifications to
/// parent handlers until the queue drains. Handler failures are captured
/// as the parent's crash reason; the pump (and scheduler) live on.
pub(crate) async fn process_completions(
    shared: &ProjectShared,
    core: &mut ProjectCore,
    pending: &mut PendingCompletions,
) -> Result<Vec<PostAction>> {
    let mut actions = Vec::new();
    while let Some((parent, child)) = pending.pop_front() {
        let result = dispatch(shared, core, parent, child, pending, &mut actions).await;
        if let Err(e) = result {
            if e.is_project_closed() {
                return Err(e);
            }
            core.tree.record_crash(parent, "bulkhead", e.to_string());
        }
    }
    Ok(actions)
}

async fn dispatch(
    shared: &ProjectShared,
    core: &mut ProjectCore,
    parent: TaskId,
    child: TaskId,
    pending: &mut PendingCompletions,
    actions: &mut Vec<PostAction>,
) -> Result<()> {
    enum Handler {
        DownloadResource,
        UpdateGroupMembers,
        DownloadGroupMembers,
        DownloadGroup,
        None,
    }
    let handler = match core.tree.node(parent).map(|n| &n.kind) {
        Some(TaskKind::DownloadResource(_)) => Handler::DownloadResource,
        Some(TaskKind::UpdateGroupMembers(_)) => Handler::UpdateGroupMembers,
        Some(TaskKind::DownloadGroupMembers(_)) => Handler::DownloadGroupMembers,
        Some(TaskKind::DownloadGroup(_)) => Handler::DownloadGroup,
        _ => Handler::None,
    };
    match handler {
        Handler::DownloadResource => {
            download::on_child_complete(shared, core, parent, child, pending, actions).await
        }
        Handler::UpdateGroupMembers => {
            group::on_update_child_complete(shared, core, parent, child, pending);
            Ok(())
        }
        Handler::DownloadGroupMembers => {
            group::on_members_child_complete(shared, core, parent, child, pending);
            Ok(())
        }
        Handler::DownloadGroup => {
            group::on_group_child_complete(shared, core, parent, child, pending, actions);
            Ok(())
        }
        Handler::None => Ok(()),
    }
}

/// Drain a completion queue immediately, finishing any delay-requesting
/// tasks without sleeping. Used outside the scheduler (API enqueue paths),
/// where no network pacing is needed.
pub(crate) async fn pump_now(
    shared: &ProjectShared,
    core: &mut ProjectCore,
    pending: &mut PendingCompletions,
) -> Result<()> {
    loop {
        let actions = process_completions(shared, core, pending).await?;
        if actions.is_empty() {
            return Ok(());
        }
        for PostAction::DelayThenFinish { task } in actions {
            finish_task(shared, core, task, pending);
        }
    }
}
