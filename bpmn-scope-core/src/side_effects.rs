//! Side effects bound to a scope that run when it is terminated or suspended.
//!
//! The handler lists are explicit and ordered: jobs and user tasks are
//! canceled before subscriptions are deleted, and incidents are resolved
//! last, before the scope itself is marked TERMINATED.

use crate::events::{Intent, RecordValue};
use crate::subscriptions;
use crate::types::Key;
use crate::writer::Batch;

pub(crate) trait ScopeSideEffect: Sync {
    fn name(&self) -> &'static str;

    fn run(&self, batch: &mut Batch<'_>, scope_key: Key);
}

pub(crate) struct CancelJobs;
pub(crate) struct CancelUserTasks;
pub(crate) struct DeleteSubscriptions;
pub(crate) struct ResolveIncidents;

impl ScopeSideEffect for CancelJobs {
    fn name(&self) -> &'static str {
        "cancel-jobs"
    }

    fn run(&self, batch: &mut Batch<'_>, scope_key: Key) {
        for job_key in batch.state.jobs_of(scope_key) {
            if let Some(job) = batch.state.jobs.get(&job_key).cloned() {
                batch.event(job_key, Intent::JobCanceled, RecordValue::Job(job));
            }
        }
    }
}

impl ScopeSideEffect for CancelUserTasks {
    fn name(&self) -> &'static str {
        "cancel-user-tasks"
    }

    fn run(&self, batch: &mut Batch<'_>, scope_key: Key) {
        for task_key in batch.state.user_tasks_of(scope_key) {
            if let Some(task) = batch.state.user_tasks.get(&task_key).cloned() {
                batch.event(task_key, Intent::UserTaskCanceled, RecordValue::UserTask(task));
            }
        }
    }
}

impl ScopeSideEffect for DeleteSubscriptions {
    fn name(&self) -> &'static str {
        "delete-subscriptions"
    }

    fn run(&self, batch: &mut Batch<'_>, scope_key: Key) {
        subscriptions::close_for_scope(batch, scope_key);
    }
}

impl ScopeSideEffect for ResolveIncidents {
    fn name(&self) -> &'static str {
        "resolve-incidents"
    }

    fn run(&self, batch: &mut Batch<'_>, scope_key: Key) {
        for incident_key in batch.state.incidents_of(scope_key) {
            if let Some(incident) = batch.state.incidents.get(&incident_key).cloned() {
                batch.event(
                    incident_key,
                    Intent::IncidentResolved,
                    RecordValue::Incident(incident),
                );
            }
        }
    }
}

pub(crate) static TERMINATION_HANDLERS: &[&dyn ScopeSideEffect] = &[
    &CancelJobs,
    &CancelUserTasks,
    &DeleteSubscriptions,
    &ResolveIncidents,
];

pub(crate) static SUSPENSION_HANDLERS: &[&dyn ScopeSideEffect] =
    &[&CancelJobs, &CancelUserTasks, &DeleteSubscriptions];

pub(crate) fn run_all(handlers: &[&dyn ScopeSideEffect], batch: &mut Batch<'_>, scope_key: Key) {
    for handler in handlers {
        tracing::trace!(handler = handler.name(), scope_key, "running scope side effect");
        handler.run(batch, scope_key);
    }
}
