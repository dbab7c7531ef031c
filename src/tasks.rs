//! Exec-task submission (part of C5): work orders flagged `is_exec_task`
//! carry a list of external task identifiers that get submitted once the
//! triggering transition has committed. Grounded on the original service's
//! `if workOrderValue.IsExecTask { go ExecTask(taskList, string(params)) }` —
//! a detached, fire-and-forget call whose failure never rolls back the
//! transition it followed.

use async_trait::async_trait;
use serde_json::Value;

/// What gets handed to the external task system for one submission.
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub work_order_id: i64,
    pub title: String,
    pub priority: i64,
    pub form_data: Value,
}

#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn submit(&self, task_ids: &[String], submission: TaskSubmission);
}

/// Default when no external task system is wired up; logs and drops.
pub struct NoopTaskRunner;

#[async_trait]
impl TaskRunner for NoopTaskRunner {
    async fn submit(&self, task_ids: &[String], submission: TaskSubmission) {
        tracing::debug!(
            work_order_id = submission.work_order_id,
            task_ids = ?task_ids,
            "no task runner configured, dropping exec-task submission"
        );
    }
}
