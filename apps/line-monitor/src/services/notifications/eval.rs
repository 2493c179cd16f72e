use serde::{Deserialize, Serialize};

use super::types::{ConditionType, NotificationEvent, TagValueChange};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Lt,
    Eq,
    Gte,
    Lte,
    Neq,
}

impl CompareOp {
    pub fn parse(symbol: &str) -> Option<Self> {
        match symbol.trim() {
            ">" => Some(Self::Gt),
            "<" => Some(Self::Lt),
            "=" => Some(Self::Eq),
            ">=" => Some(Self::Gte),
            "<=" => Some(Self::Lte),
            "!=" => Some(Self::Neq),
            _ => None,
        }
    }
}

pub fn compare(value: f64, op: CompareOp, threshold: f64) -> bool {
    match op {
        CompareOp::Lt => value < threshold,
        CompareOp::Lte => value <= threshold,
        CompareOp::Gt => value > threshold,
        CompareOp::Gte => value >= threshold,
        CompareOp::Eq => (value - threshold).abs() <= f64::EPSILON,
        CompareOp::Neq => (value - threshold).abs() > f64::EPSILON,
    }
}

/// Missing values compare as the empty string.
pub fn normalize(value: Option<&str>) -> &str {
    value.map(str::trim).unwrap_or("")
}

pub fn parse_numeric(value: Option<&str>) -> Option<f64> {
    normalize(value)
        .parse::<f64>()
        .ok()
        .filter(|parsed| parsed.is_finite())
}

/// Immediate evaluation of a rule against one change. Duration-gated
/// state rules are not decided here.
pub fn evaluate(rule: &NotificationEvent, change: &TagValueChange) -> bool {
    let new_value = normalize(change.new_value.as_deref());
    let old_value = normalize(change.old_value.as_deref());

    match rule.condition_type {
        ConditionType::ValueChange => new_value != old_value,
        ConditionType::Threshold => {
            let (Some(threshold), Some(symbol)) =
                (rule.threshold_value, rule.comparison_operator.as_deref())
            else {
                tracing::warn!(event_id = rule.id, "threshold rule missing value or operator");
                return false;
            };
            let Some(op) = CompareOp::parse(symbol) else {
                tracing::warn!(event_id = rule.id, operator = symbol, "unknown comparison operator");
                return false;
            };
            let Some(value) = parse_numeric(change.new_value.as_deref()) else {
                tracing::debug!(
                    event_id = rule.id,
                    tag_id = change.tag_id,
                    value = new_value,
                    "non-numeric value for threshold rule"
                );
                return false;
            };
            compare(value, op, threshold)
        }
        ConditionType::StateChange => {
            let Some(target) = rule.target_state.as_deref() else {
                tracing::warn!(event_id = rule.id, "state rule has no target state");
                return false;
            };
            new_value != old_value && new_value == normalize(Some(target))
        }
    }
}
