//! Persistent data model: a work order's active positions, its submitted
//! form data, and the append-only circulation history (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One record of "where the work order currently is". A simple linear or
/// exclusive-gateway path has exactly one; a forked parallel path has one
/// per outstanding branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveState {
    pub node_id: String,
    pub label: String,
    #[serde(default)]
    pub processor: Vec<Value>,
    #[serde(default)]
    pub process_method: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrder {
    pub id: i64,
    pub process_id: i64,
    pub title: String,
    pub priority: i64,
    pub creator: i64,
    #[serde(default)]
    pub related_person: Vec<i64>,
    pub state: Vec<ActiveState>,
    pub is_end: bool,
    pub classify: i64,
    pub urge_count: i64,
    pub urge_last_time: Option<i64>,
    pub create_time: DateTime<Utc>,
}

impl WorkOrder {
    pub fn active_state(&self, node_id: &str) -> Option<&ActiveState> {
        self.state.iter().find(|s| s.node_id == node_id)
    }

    /// A work order is terminal once every active position has drained, or
    /// it was manually ended.
    pub fn is_terminal(&self) -> bool {
        self.is_end || self.state.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateData {
    pub id: i64,
    pub work_order_id: i64,
    pub form_structure: Value,
    pub form_data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CirculationHistory {
    pub id: i64,
    pub work_order_id: i64,
    /// Node id the record was emitted from; `None` for the initial "created"
    /// row, which has no predecessor node.
    pub source: Option<String>,
    pub target: Option<String>,
    pub state_label: String,
    pub circulation: String,
    /// 1 = pending/in-progress, 2 = actioned. Mirrors the original schema's
    /// two-valued status column rather than inventing a richer enum nothing
    /// downstream reads.
    pub status: i64,
    pub remarks: String,
    pub cost_duration: Option<i64>,
    pub operator: i64,
    pub create_time: DateTime<Utc>,
}

/// The duration between `now` and the `create_time` of the first row
/// (scanning most-recent-first) whose `source` differs from
/// `current_node_id`. Preserved exactly from the original service's
/// transfer-duration computation: because it compares against the *current*
/// node rather than the node being transferred away from, a re-entered node
/// can make this walk several rows further back than "time since last
/// event" would suggest. See DESIGN.md Open Question (c).
pub fn cost_duration_since_last_foreign_source(
    history_most_recent_first: &[CirculationHistory],
    current_node_id: &str,
    now: DateTime<Utc>,
) -> Option<i64> {
    history_most_recent_first
        .iter()
        .find(|row| row.source.as_deref() != Some(current_node_id))
        .map(|row| (now - row.create_time).num_seconds())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state(node_id: &str) -> ActiveState {
        ActiveState {
            node_id: node_id.to_string(),
            label: node_id.to_string(),
            processor: vec![],
            process_method: None,
        }
    }

    #[test]
    fn terminal_when_state_drained() {
        let wo = WorkOrder {
            id: 1,
            process_id: 1,
            title: "t".into(),
            priority: 1,
            creator: 1,
            related_person: vec![],
            state: vec![],
            is_end: false,
            classify: 1,
            urge_count: 0,
            urge_last_time: None,
            create_time: Utc::now(),
        };
        assert!(wo.is_terminal());
    }

    #[test]
    fn not_terminal_with_active_state() {
        let wo = WorkOrder {
            id: 1,
            process_id: 1,
            title: "t".into(),
            priority: 1,
            creator: 1,
            related_person: vec![],
            state: vec![sample_state("n2")],
            is_end: false,
            classify: 1,
            urge_count: 0,
            urge_last_time: None,
            create_time: Utc::now(),
        };
        assert!(!wo.is_terminal());
        assert!(wo.active_state("n2").is_some());
    }

    fn history_row(id: i64, source: Option<&str>, minutes_ago: i64) -> CirculationHistory {
        CirculationHistory {
            id,
            work_order_id: 1,
            source: source.map(str::to_string),
            target: None,
            state_label: "x".into(),
            circulation: "handled".into(),
            status: 2,
            remarks: String::new(),
            cost_duration: None,
            operator: 1,
            create_time: Utc::now() - chrono::Duration::minutes(minutes_ago),
        }
    }

    #[test]
    fn cost_duration_skips_rows_with_matching_source() {
        let now = Utc::now();
        let rows = vec![
            history_row(3, Some("n2"), 1),
            history_row(2, Some("n2"), 5),
            history_row(1, Some("n1"), 20),
        ];
        let duration = cost_duration_since_last_foreign_source(&rows, "n2", now).unwrap();
        // Skips both rows sourced from n2, lands on the n1 row ~20 minutes back.
        assert!(duration >= 19 * 60 && duration <= 20 * 60 + 5);
    }

    #[test]
    fn cost_duration_none_when_all_rows_match_current_source() {
        let now = Utc::now();
        let rows = vec![history_row(1, Some("n2"), 1)];
        assert!(cost_duration_since_last_foreign_source(&rows, "n2", now).is_none());
    }
}
