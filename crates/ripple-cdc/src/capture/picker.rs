//! Field pickers
//!
//! A [`FieldPicker`] binds one table group to a dispatch rule: it names the
//! positional row values after the source table's columns, keeps only the
//! projected columns, and evaluates the group's filter on the result.

use crate::common::{
    CdcOp, ColumnValue, DeltaRow, DerivedChangeEvent, FilterPredicate, Mapping, Result,
    RowChangeEvent, TableGroupConfig,
};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Per-destination rule: projection plus filter.
#[derive(Debug, Clone)]
pub struct FieldPicker {
    mapping: Arc<Mapping>,
    group: TableGroupConfig,
    predicate: FilterPredicate,
    projection: Option<HashSet<String>>,
}

impl FieldPicker {
    /// Build a picker. Fails if a filter condition does not compile.
    pub fn new(mapping: Arc<Mapping>, group: TableGroupConfig) -> Result<Self> {
        let predicate = FilterPredicate::compile(&group.filter)?;

        let projection = if !group.column_projection.is_empty() {
            Some(group.column_projection.iter().cloned().collect())
        } else if !group.field_mapping.is_empty() {
            Some(group.field_mapping.iter().map(|f| f.source.clone()).collect())
        } else {
            None
        };

        Ok(Self {
            mapping,
            group,
            predicate,
            projection,
        })
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn group(&self) -> &TableGroupConfig {
        &self.group
    }

    pub fn source_table(&self) -> &str {
        &self.group.source_table.name
    }

    pub fn destination_table(&self) -> &str {
        &self.group.destination_table.name
    }

    /// Whether the picker is bound to `table` (bare or `schema.table`).
    pub fn matches_table(&self, schema: &str, table: &str) -> bool {
        let name = self.source_table();
        name == table
            || name
                .split_once('.')
                .is_some_and(|(s, t)| s == schema && t == table)
    }

    /// Derive the event for a decoded row, `None` if the filter rejects it.
    pub fn pick_row(&self, change: &RowChangeEvent) -> Option<DerivedChangeEvent> {
        let before = self.project(self.name_values(&change.before));
        let after = self.project(self.name_values(&change.after));
        self.derive(change.operation, before, after)
    }

    /// Derive the event for a polled delta row, `None` if the filter rejects it.
    pub fn pick_delta(&self, row: &DeltaRow) -> Option<DerivedChangeEvent> {
        let before = self.project(row.before.clone());
        let after = self.project(row.after.clone());
        self.derive(row.op(), before, after)
    }

    fn derive(
        &self,
        operation: CdcOp,
        before: Map<String, Value>,
        after: Map<String, Value>,
    ) -> Option<DerivedChangeEvent> {
        let event = DerivedChangeEvent {
            source_table: self.group.source_table.name.clone(),
            destination_table: self.group.destination_table.name.clone(),
            operation,
            before,
            after,
        };
        self.predicate
            .evaluate(event.filter_image())
            .then_some(event)
    }

    /// Zip positional values with the configured column names. Columns
    /// beyond the configured list are named by their position.
    fn name_values(&self, values: &[ColumnValue]) -> Map<String, Value> {
        let columns = &self.group.source_table.columns;
        values
            .iter()
            .enumerate()
            .map(|(idx, value)| {
                let name = columns
                    .get(idx)
                    .cloned()
                    .unwrap_or_else(|| idx.to_string());
                (name, value.to_json())
            })
            .collect()
    }

    fn project(&self, mut row: Map<String, Value>) -> Map<String, Value> {
        if let Some(keep) = &self.projection {
            row.retain(|key, _| keep.contains(key));
        }
        row
    }
}
