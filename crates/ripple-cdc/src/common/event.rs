//! Change event representation
//!
//! - [`RowChangeEvent`]: one decoded row version pair, positional values
//! - [`DerivedChangeEvent`]: what a field picker forwards downstream,
//!   with named and projected columns
//! - [`DeltaRow`]: one change returned by a polling delta read

use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// CDC operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CdcOp {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl CdcOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for CdcOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Int(i64),
    Float(f32),
    Double(f64),
    /// Exact decimal rendered as text
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    Date {
        year: u16,
        month: u8,
        day: u8,
    },
    Time {
        negative: bool,
        hours: u16,
        minutes: u8,
        seconds: u8,
        microseconds: u32,
    },
    DateTime {
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        microsecond: u32,
    },
    /// UTC epoch seconds
    Timestamp {
        seconds: u32,
        microseconds: u32,
    },
    Year(u16),
    Json(Value),
    /// 1-based index into the column's enum members
    Enum(u16),
    /// Bitmask over the column's set members
    Set(u64),
    Bit(Vec<u8>),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// JSON form used for projected rows.
    ///
    /// Binary values are base64 encoded; temporal values are ISO-8601 text.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Int(v) => Value::from(*v),
            Self::Float(v) => Value::from(*v as f64),
            Self::Double(v) => Value::from(*v),
            Self::Decimal(v) | Self::String(v) => Value::String(v.clone()),
            Self::Bytes(v) | Self::Bit(v) => {
                use base64::Engine;
                Value::String(base64::engine::general_purpose::STANDARD.encode(v))
            }
            Self::Date { year, month, day } => {
                Value::String(format!("{:04}-{:02}-{:02}", year, month, day))
            }
            Self::Time {
                negative,
                hours,
                minutes,
                seconds,
                microseconds,
            } => {
                let sign = if *negative { "-" } else { "" };
                let text = if *microseconds > 0 {
                    format!(
                        "{}{:02}:{:02}:{:02}.{:06}",
                        sign, hours, minutes, seconds, microseconds
                    )
                } else {
                    format!("{}{:02}:{:02}:{:02}", sign, hours, minutes, seconds)
                };
                Value::String(text)
            }
            Self::DateTime {
                year,
                month,
                day,
                hour,
                minute,
                second,
                microsecond,
            } => {
                let text = if *microsecond > 0 {
                    format!(
                        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}",
                        year, month, day, hour, minute, second, microsecond
                    )
                } else {
                    format!(
                        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
                        year, month, day, hour, minute, second
                    )
                };
                Value::String(text)
            }
            Self::Timestamp {
                seconds,
                microseconds,
            } => DateTime::from_timestamp(i64::from(*seconds), microseconds * 1_000)
                .map(|ts| Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
                .unwrap_or_else(|| Value::from(*seconds)),
            Self::Year(v) => Value::from(*v),
            Self::Json(v) => v.clone(),
            Self::Enum(v) => Value::from(*v),
            Self::Set(v) => Value::from(*v),
        }
    }
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for ColumnValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// One row mutation decoded from the binlog.
///
/// `before` is empty for inserts and `after` is empty for deletes. Values
/// follow the table's column order, restricted to the columns present in
/// the event's column bitmap.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChangeEvent {
    pub schema: String,
    pub table: String,
    pub operation: CdcOp,
    pub before: Vec<ColumnValue>,
    pub after: Vec<ColumnValue>,
}

impl RowChangeEvent {
    pub fn insert(table: impl Into<String>, after: Vec<ColumnValue>) -> Self {
        Self {
            schema: String::new(),
            table: table.into(),
            operation: CdcOp::Insert,
            before: Vec::new(),
            after,
        }
    }

    pub fn update(
        table: impl Into<String>,
        before: Vec<ColumnValue>,
        after: Vec<ColumnValue>,
    ) -> Self {
        Self {
            schema: String::new(),
            table: table.into(),
            operation: CdcOp::Update,
            before,
            after,
        }
    }

    pub fn delete(table: impl Into<String>, before: Vec<ColumnValue>) -> Self {
        Self {
            schema: String::new(),
            table: table.into(),
            operation: CdcOp::Delete,
            before,
            after: Vec::new(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }
}

/// A change with named columns, as returned by a polling delta read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaRow {
    pub before: Map<String, Value>,
    pub after: Map<String, Value>,
    pub operation: Option<CdcOp>,
}

impl DeltaRow {
    pub fn insert(after: Map<String, Value>) -> Self {
        Self {
            after,
            operation: Some(CdcOp::Insert),
            ..Default::default()
        }
    }

    pub fn update(before: Map<String, Value>, after: Map<String, Value>) -> Self {
        Self {
            before,
            after,
            operation: Some(CdcOp::Update),
        }
    }

    pub fn delete(before: Map<String, Value>) -> Self {
        Self {
            before,
            operation: Some(CdcOp::Delete),
            ..Default::default()
        }
    }

    /// Explicit operation, or inferred from which images are present.
    pub fn op(&self) -> CdcOp {
        self.operation.unwrap_or(match (self.before.is_empty(), self.after.is_empty()) {
            (true, _) => CdcOp::Insert,
            (false, true) => CdcOp::Delete,
            (false, false) => CdcOp::Update,
        })
    }
}

/// Event handed to the downstream transform for one passing field picker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedChangeEvent {
    pub source_table: String,
    pub destination_table: String,
    pub operation: CdcOp,
    pub before: Map<String, Value>,
    pub after: Map<String, Value>,
}

impl DerivedChangeEvent {
    /// The image filters evaluate: after for insert/update, before for delete.
    pub fn filter_image(&self) -> &Map<String, Value> {
        match self.operation {
            CdcOp::Delete => &self.before,
            CdcOp::Insert | CdcOp::Update => &self.after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_column_value_to_json() {
        assert_eq!(ColumnValue::Null.to_json(), Value::Null);
        assert_eq!(ColumnValue::Int(-7).to_json(), json!(-7));
        assert_eq!(ColumnValue::from("a").to_json(), json!("a"));
        assert_eq!(ColumnValue::Decimal("12.50".into()).to_json(), json!("12.50"));
        assert_eq!(ColumnValue::Bytes(vec![1, 2, 3]).to_json(), json!("AQID"));
        assert_eq!(
            ColumnValue::Date {
                year: 2024,
                month: 2,
                day: 29
            }
            .to_json(),
            json!("2024-02-29")
        );
    }

    #[test]
    fn test_temporal_to_json() {
        let time = ColumnValue::Time {
            negative: true,
            hours: 100,
            minutes: 5,
            seconds: 6,
            microseconds: 0,
        };
        assert_eq!(time.to_json(), json!("-100:05:06"));

        let dt = ColumnValue::DateTime {
            year: 2024,
            month: 1,
            day: 15,
            hour: 10,
            minute: 30,
            second: 0,
            microsecond: 250_000,
        };
        assert_eq!(dt.to_json(), json!("2024-01-15T10:30:00.250000"));

        let ts = ColumnValue::Timestamp {
            seconds: 1_700_000_000,
            microseconds: 0,
        };
        assert_eq!(ts.to_json(), json!("2023-11-14T22:13:20Z"));
    }

    #[test]
    fn test_row_change_constructors() {
        let insert = RowChangeEvent::insert("orders", vec![1i64.into(), "a".into()]);
        assert_eq!(insert.operation, CdcOp::Insert);
        assert!(insert.before.is_empty());

        let delete = RowChangeEvent::delete("orders", vec![1i64.into()]);
        assert!(delete.after.is_empty());
    }

    #[test]
    fn test_delta_row_inferred_op() {
        let after = json!({"id": 1}).as_object().unwrap().clone();
        let mut row = DeltaRow {
            after: after.clone(),
            ..Default::default()
        };
        assert_eq!(row.op(), CdcOp::Insert);
        row.before = after;
        assert_eq!(row.op(), CdcOp::Update);
        row.after.clear();
        assert_eq!(row.op(), CdcOp::Delete);
    }

    #[test]
    fn test_filter_image() {
        let before = json!({"id": 1}).as_object().unwrap().clone();
        let event = DerivedChangeEvent {
            source_table: "orders".into(),
            destination_table: "orders_copy".into(),
            operation: CdcOp::Delete,
            before: before.clone(),
            after: Map::new(),
        };
        assert_eq!(event.filter_image(), &before);
    }
}
