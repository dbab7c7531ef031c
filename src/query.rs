//! Query facade (C9): paginated work-order listing with filters, grounded
//! on the original `GetprojectList` handler's filter set and
//! `pkg/pagination`'s request-params shape.

use crate::state::WorkOrder;

#[derive(Debug, Clone, Default)]
pub struct WorkOrderFilter {
    pub page: i64,
    pub per_page: i64,
    pub creator: Option<i64>,
    pub is_end: Option<bool>,
    pub title_contains: Option<String>,
    pub processor: Option<i64>,
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    /// Matched against the work order's own `priority` column. Simpler than
    /// the form-field JSON-path match the listing endpoint documents,
    /// because the filter has no access to a work order's form data — see
    /// DESIGN.md.
    pub priority: Option<i64>,
}

impl WorkOrderFilter {
    pub fn new(page: i64, per_page: i64) -> Self {
        WorkOrderFilter {
            page: page.max(1),
            per_page: per_page.clamp(1, 200),
            ..Default::default()
        }
    }

    pub fn matches(&self, wo: &WorkOrder) -> bool {
        if let Some(creator) = self.creator {
            if wo.creator != creator {
                return false;
            }
        }
        if let Some(is_end) = self.is_end {
            if wo.is_end != is_end {
                return false;
            }
        }
        if let Some(title) = &self.title_contains {
            if !wo.title.to_lowercase().contains(&title.to_lowercase()) {
                return false;
            }
        }
        if let Some(processor) = self.processor {
            let assigned = wo
                .state
                .iter()
                .any(|s| s.processor.iter().any(|p| p.as_i64() == Some(processor)));
            if !assigned {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if wo.create_time < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if wo.create_time > end {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if wo.priority != priority {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkOrderPage {
    pub items: Vec<WorkOrder>,
    pub total: i64,
}
