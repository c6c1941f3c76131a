//! Row filter predicates for field pickers
//!
//! A table group carries a list of [`FilterCondition`]s. They compile into a
//! [`FilterPredicate`] evaluated against the projected row of a derived
//! change event:
//!
//! - every `and` condition must hold
//! - if any `or` conditions exist, at least one must hold
//! - an empty list accepts everything
//!
//! # Example
//!
//! ```rust
//! use ripple_cdc::common::{FilterCondition, FilterOperator, FilterPredicate};
//! use serde_json::json;
//!
//! let predicate = FilterPredicate::compile(&[
//!     FilterCondition::and("status", FilterOperator::Eq, "paid"),
//!     FilterCondition::and("amount", FilterOperator::Gt, "100"),
//! ])
//! .unwrap();
//!
//! let row = json!({"status": "paid", "amount": 250}).as_object().unwrap().clone();
//! assert!(predicate.evaluate(&row));
//! ```

use crate::common::{CdcError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Comparison applied by one condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    /// SQL-style pattern where `%` matches any run of characters
    Like,
}

/// How a condition combines with the others.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conjunction {
    #[default]
    And,
    Or,
}

/// One configured filter condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub column: String,
    pub operator: FilterOperator,
    pub value: String,
    #[serde(default)]
    pub conjunction: Conjunction,
}

impl FilterCondition {
    pub fn and(column: impl Into<String>, operator: FilterOperator, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            operator,
            value: value.into(),
            conjunction: Conjunction::And,
        }
    }

    pub fn or(column: impl Into<String>, operator: FilterOperator, value: impl Into<String>) -> Self {
        Self {
            conjunction: Conjunction::Or,
            ..Self::and(column, operator, value)
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledCondition {
    column: String,
    operator: FilterOperator,
    value: String,
    pattern: Option<Regex>,
}

impl CompiledCondition {
    fn compile(condition: &FilterCondition) -> Result<Self> {
        let pattern = match condition.operator {
            FilterOperator::Like => Some(like_to_regex(&condition.value).map_err(|e| {
                CdcError::config(format!(
                    "Invalid like pattern '{}' on column '{}': {}",
                    condition.value, condition.column, e
                ))
            })?),
            _ => None,
        };
        Ok(Self {
            column: condition.column.clone(),
            operator: condition.operator,
            value: condition.value.clone(),
            pattern,
        })
    }

    fn matches(&self, row: &Map<String, Value>) -> bool {
        let actual = match row.get(&self.column).and_then(value_as_text) {
            Some(v) => v,
            // Missing and NULL columns only satisfy `ne`
            None => return self.operator == FilterOperator::Ne,
        };

        if let Some(pattern) = &self.pattern {
            return pattern.is_match(&actual);
        }

        let ordering = compare(&actual, &self.value);
        match self.operator {
            FilterOperator::Eq => ordering == Ordering::Equal,
            FilterOperator::Ne => ordering != Ordering::Equal,
            FilterOperator::Gt => ordering == Ordering::Greater,
            FilterOperator::Lt => ordering == Ordering::Less,
            FilterOperator::Ge => ordering != Ordering::Less,
            FilterOperator::Le => ordering != Ordering::Greater,
            FilterOperator::Like => false,
        }
    }
}

/// Compiled boolean predicate over a projected row.
#[derive(Debug, Clone, Default)]
pub struct FilterPredicate {
    and: Vec<CompiledCondition>,
    or: Vec<CompiledCondition>,
}

impl FilterPredicate {
    /// Predicate that accepts every row.
    pub fn accept_all() -> Self {
        Self::default()
    }

    pub fn compile(conditions: &[FilterCondition]) -> Result<Self> {
        let mut predicate = Self::default();
        for condition in conditions {
            let compiled = CompiledCondition::compile(condition)?;
            match condition.conjunction {
                Conjunction::And => predicate.and.push(compiled),
                Conjunction::Or => predicate.or.push(compiled),
            }
        }
        Ok(predicate)
    }

    pub fn is_empty(&self) -> bool {
        self.and.is_empty() && self.or.is_empty()
    }

    pub fn evaluate(&self, row: &Map<String, Value>) -> bool {
        self.and.iter().all(|c| c.matches(row))
            && (self.or.is_empty() || self.or.iter().any(|c| c.matches(row)))
    }
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Numeric comparison when both sides parse as numbers, text otherwise.
fn compare(actual: &str, expected: &str) -> Ordering {
    match (actual.trim().parse::<f64>(), expected.trim().parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => actual.cmp(expected),
    }
}

fn like_to_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let escaped = regex::escape(pattern);
    let regex_pattern = escaped.replace('%', ".*").replace('_', ".");
    Regex::new(&format!("^{}$", regex_pattern))
}
