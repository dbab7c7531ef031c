//! Clause/condition evaluation over merged form-data JSON (C3).
//!
//! Clauses within one edge's `condition_expression` are AND-combined.
//! Exclusive gateways evaluate their outgoing edges in declaration order
//! and take the first one whose clauses all match; a missing field is
//! always a non-match rather than an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clause {
    pub field_key: String,
    pub operator: Operator,
    pub operand: Value,
}

impl Clause {
    pub fn matches(&self, form_data: &Value) -> bool {
        let Some(actual) = form_data.get(&self.field_key) else {
            return false;
        };
        match self.operator {
            Operator::Eq => values_equal(actual, &self.operand),
            Operator::Ne => !values_equal(actual, &self.operand),
            Operator::Lt => compare_numeric(actual, &self.operand).map(|o| o.is_lt()).unwrap_or(false),
            Operator::Le => compare_numeric(actual, &self.operand).map(|o| o.is_le()).unwrap_or(false),
            Operator::Gt => compare_numeric(actual, &self.operand).map(|o| o.is_gt()).unwrap_or(false),
            Operator::Ge => compare_numeric(actual, &self.operand).map(|o| o.is_ge()).unwrap_or(false),
            Operator::Contains => match (actual, &self.operand) {
                (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
                (Value::Array(items), needle) => items.iter().any(|v| values_equal(v, needle)),
                _ => false,
            },
        }
    }
}

/// All clauses on an edge must match (AND). An edge with no clauses always
/// matches.
pub fn edge_matches(clauses: &[Clause], form_data: &Value) -> bool {
    clauses.iter().all(|c| c.matches(form_data))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return x == y;
    }
    a == b
}

fn compare_numeric(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    let x = as_f64(a)?;
    let y = as_f64(b)?;
    x.partial_cmp(&y)
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}
