//! Lifecycle operations (C8): transfer, urge, active-claim, manual end,
//! reopen, delete. Grounded directly on the `original_source` handlers of
//! the same name; see DESIGN.md for the two Open Question resolutions this
//! module implements (transfer's rollback boundary, and `cost_duration`).

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::graph::Process;
use crate::state::{cost_duration_since_last_foreign_source, ActiveState, CirculationHistory, WorkOrder};
use crate::store::ProcessStore;

pub struct LifecycleOps<S: ProcessStore> {
    store: Arc<S>,
    urge_cooldown_secs: i64,
}

impl<S: ProcessStore> LifecycleOps<S> {
    pub fn new(store: Arc<S>, urge_cooldown_secs: i64) -> Self {
        LifecycleOps { store, urge_cooldown_secs }
    }

    /// Reassigns the processor on one active position to `new_assignee`,
    /// writing the state mutation and the circulation-history row as one
    /// transactional unit. Unlike the original handler's buggy path, the
    /// state update here can never land without its accompanying history
    /// row (DESIGN.md Open Question (b)).
    pub async fn transfer(
        &self,
        work_order_id: i64,
        node_id: &str,
        new_assignee: i64,
        operator: i64,
    ) -> EngineResult<WorkOrder> {
        let mut work_order = self.store.lock_work_order(work_order_id).await?;
        if work_order.is_end {
            return Err(EngineError::AlreadyClosed(work_order.id));
        }
        let position = work_order
            .state
            .iter_mut()
            .find(|s| s.node_id == node_id)
            .ok_or(EngineError::StateNotActive(work_order.id))?;
        position.processor = vec![Value::from(new_assignee)];
        position.process_method = Some("person".into());

        let history_rows = self.store.list_history(work_order.id).await?;
        let now = Utc::now();
        let cost_duration = cost_duration_since_last_foreign_source(&history_rows, node_id, now);

        let history = CirculationHistory {
            id: 0,
            work_order_id: work_order.id,
            source: Some(node_id.to_string()),
            target: Some(node_id.to_string()),
            state_label: work_order.active_state(node_id).map(|s| s.label.clone()).unwrap_or_default(),
            circulation: "转交工单".into(),
            status: 2,
            remarks: String::new(),
            cost_duration,
            operator,
            create_time: now,
        };

        self.store.commit_transition(work_order.clone(), history).await?;
        Ok(work_order)
    }

    /// Notifies the current assignees again, enforcing a cooldown between
    /// successive urges. A negative or overflowing elapsed time — clock
    /// skew, or no prior urge — is treated as "cooldown already expired"
    /// rather than propagating an error (DESIGN.md Open Question (a)).
    pub async fn urge(&self, work_order_id: i64, now_unix: i64) -> EngineResult<WorkOrder> {
        let work_order = self.store.get_work_order(work_order_id).await?;
        if let Some(last) = work_order.urge_last_time {
            let elapsed = now_unix.checked_sub(last).unwrap_or(i64::MAX);
            if elapsed >= 0 && elapsed < self.urge_cooldown_secs {
                return Err(EngineError::RateLimited {
                    retry_after_secs: self.urge_cooldown_secs - elapsed,
                });
            }
        }
        self.store
            .set_urge(work_order_id, work_order.urge_count + 1, now_unix)
            .await?;
        self.store.get_work_order(work_order_id).await
    }

    /// Replaces the state column outright with no validation and no
    /// history row, matching the original `ActiveOrder` handler.
    pub async fn active_claim(&self, work_order_id: i64, state: Vec<ActiveState>) -> EngineResult<()> {
        self.store.overwrite_state(work_order_id, state).await
    }

    /// Manually ends a work order; fails if it is already closed.
    pub async fn manual_end(&self, work_order_id: i64, operator: i64) -> EngineResult<()> {
        let work_order = self.store.get_work_order(work_order_id).await?;
        if work_order.is_end {
            return Err(EngineError::AlreadyClosed(work_order_id));
        }
        let history = CirculationHistory {
            id: 0,
            work_order_id,
            source: None,
            target: None,
            state_label: "ended".into(),
            circulation: "工单结束".into(),
            status: 2,
            remarks: "ended outside the normal graph flow".into(),
            cost_duration: None,
            operator,
            create_time: Utc::now(),
        };
        let mut ended = work_order;
        ended.is_end = true;
        self.store.commit_transition(ended, history).await
    }

    pub async fn delete(&self, work_order_id: i64) -> EngineResult<()> {
        self.store.delete_work_order(work_order_id).await
    }

    /// Creates a fresh work order against the same process, starting back
    /// at the process graph's start node, with the acting user as sole
    /// assignee, and copies over every template-data row from the old
    /// work order (new ids, same form structure/data).
    pub async fn reopen(&self, work_order_id: i64, acting_user: i64) -> EngineResult<WorkOrder> {
        let old = self.store.get_work_order(work_order_id).await?;
        let process: Process = self.store.load_process(old.process_id).await?;
        let start = process.graph.start_node()?;

        let new_state = vec![ActiveState {
            node_id: start.id.clone(),
            label: start.label.clone(),
            processor: vec![Value::from(acting_user)],
            process_method: Some("person".into()),
        }];

        let old_templates = self.store.list_template_data(work_order_id).await?;
        let template_data = old_templates
            .into_iter()
            .map(|t| crate::state::TemplateData { id: 0, work_order_id: 0, ..t })
            .collect();

        let history = CirculationHistory {
            id: 0,
            work_order_id: 0,
            source: None,
            target: Some(start.id.clone()),
            state_label: start.label.clone(),
            circulation: "reopened".into(),
            status: 2,
            remarks: format!("reopened from work order {work_order_id}"),
            cost_duration: None,
            operator: acting_user,
            create_time: Utc::now(),
        };

        let new_work_order = WorkOrder {
            id: 0,
            process_id: old.process_id,
            title: old.title.clone(),
            priority: old.priority,
            creator: acting_user,
            related_person: vec![acting_user],
            state: new_state,
            is_end: false,
            classify: old.classify,
            urge_count: 0,
            urge_last_time: None,
            create_time: Utc::now(),
        };

        self.store.create_work_order(new_work_order, template_data, history).await
    }
}
