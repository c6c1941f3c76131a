//! Downstream dispatch
//!
//! Two delivery modes:
//!
//! - [`LogDispatcher`]: one decoded row fans out to every picker bound to its
//!   table. Applies for one row run concurrently (bounded), so completion
//!   order across destinations is unspecified. Rows are dispatched one at a
//!   time, so two rows of one stream never overlap.
//! - [`PollingDispatcher`]: delta rows are applied one by one, pickers in
//!   configured order.
//!
//! Every `apply` is bounded by a timeout; an elapsed timeout counts as a
//! downstream failure.

use crate::capture::picker::FieldPicker;
use crate::common::{
    CdcError, DeltaRow, DerivedChangeEvent, Result, RowChangeEvent, Transform,
};
use futures::stream::{self, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

async fn apply_bounded(
    transform: &dyn Transform,
    picker: &FieldPicker,
    event: &DerivedChangeEvent,
    limit: Duration,
) -> Result<()> {
    match tokio::time::timeout(limit, transform.apply(picker.mapping(), picker.group(), event))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(CdcError::timeout(format!(
            "apply to {} exceeded {}ms",
            picker.destination_table(),
            limit.as_millis()
        ))),
    }
}

/// Concurrent fan-out for log-derived capture.
pub struct LogDispatcher {
    pickers: Vec<Arc<FieldPicker>>,
    transform: Arc<dyn Transform>,
    concurrency: usize,
    apply_timeout: Duration,
}

impl std::fmt::Debug for LogDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogDispatcher")
            .field("pickers", &self.pickers.len())
            .field("concurrency", &self.concurrency)
            .field("apply_timeout", &self.apply_timeout)
            .finish()
    }
}

impl LogDispatcher {
    pub fn new(
        pickers: Vec<FieldPicker>,
        transform: Arc<dyn Transform>,
        concurrency: usize,
        apply_timeout: Duration,
    ) -> Self {
        Self {
            pickers: pickers.into_iter().map(Arc::new).collect(),
            transform,
            concurrency: concurrency.max(1),
            apply_timeout,
        }
    }

    pub fn picker_count(&self) -> usize {
        self.pickers.len()
    }

    /// Whether any picker is bound to the table.
    pub fn has_table(&self, schema: &str, table: &str) -> bool {
        self.pickers.iter().any(|p| p.matches_table(schema, table))
    }

    /// Fan one row out to its pickers.
    ///
    /// Returns the number of `apply` calls made. The first downstream error
    /// stops the remaining applies for this row; applies that already
    /// completed stay applied.
    pub async fn dispatch(&self, change: &RowChangeEvent) -> Result<usize> {
        let derived: Vec<_> = self
            .pickers
            .iter()
            .filter(|p| p.matches_table(&change.schema, &change.table))
            .filter_map(|p| p.pick_row(change).map(|event| (p, event)))
            .collect();
        let count = derived.len();
        trace!(table = %change.table, op = %change.operation, count, "Dispatching row");

        stream::iter(derived.into_iter().map(Ok::<_, CdcError>))
            .try_for_each_concurrent(self.concurrency, |(picker, event)| async move {
                apply_bounded(
                    self.transform.as_ref(),
                    picker,
                    &event,
                    self.apply_timeout,
                )
                .await
            })
            .await?;
        Ok(count)
    }
}

/// Sequential dispatch for polling capture.
pub struct PollingDispatcher {
    pickers: Vec<Arc<FieldPicker>>,
    transform: Arc<dyn Transform>,
    apply_timeout: Duration,
}

impl std::fmt::Debug for PollingDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingDispatcher")
            .field("pickers", &self.pickers.len())
            .field("apply_timeout", &self.apply_timeout)
            .finish()
    }
}

impl PollingDispatcher {
    pub fn new(
        pickers: Vec<FieldPicker>,
        transform: Arc<dyn Transform>,
        apply_timeout: Duration,
    ) -> Self {
        Self {
            pickers: pickers.into_iter().map(Arc::new).collect(),
            transform,
            apply_timeout,
        }
    }

    /// Pickers in dispatch order.
    pub fn pickers(&self) -> &[Arc<FieldPicker>] {
        &self.pickers
    }

    /// Apply the rows of one delta read through `picker`, in row order.
    pub async fn dispatch(&self, picker: &FieldPicker, rows: &[DeltaRow]) -> Result<usize> {
        let mut applied = 0;
        for event in rows.iter().filter_map(|row| picker.pick_delta(row)) {
            apply_bounded(self.transform.as_ref(), picker, &event, self.apply_timeout).await?;
            applied += 1;
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{
        FilterCondition, FilterOperator, Mapping, TableDef, TableGroupConfig,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<(String, DerivedChangeEvent)>>,
        fail_on: Option<String>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Transform for Recording {
        async fn apply(
            &self,
            _mapping: &Mapping,
            group: &TableGroupConfig,
            event: &DerivedChangeEvent,
        ) -> Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let dest = group.destination_table.name.clone();
            if self.fail_on.as_deref() == Some(dest.as_str()) {
                return Err(CdcError::downstream(format!("{} rejected", dest)));
            }
            self.calls.lock().unwrap().push((dest, event.clone()));
            Ok(())
        }
    }

    fn picker(dest: &str, filter: Option<FilterCondition>) -> FieldPicker {
        let mut group = TableGroupConfig::new(
            TableDef::new("orders", ["id", "amount"]),
            TableDef::new(dest, ["id", "amount"]),
        );
        if let Some(filter) = filter {
            group = group.with_filter(filter);
        }
        FieldPicker::new(Arc::new(Mapping::new("m1", "src")), group).unwrap()
    }

    fn row(amount: i64) -> RowChangeEvent {
        RowChangeEvent::insert("orders", vec![1i64.into(), amount.into()])
    }

    #[tokio::test]
    async fn test_fan_out_to_every_passing_picker() {
        let transform = Arc::new(Recording::default());
        let dispatcher = LogDispatcher::new(
            vec![
                picker("a", None),
                picker("b", None),
                picker(
                    "big",
                    Some(FilterCondition::and("amount", FilterOperator::Gt, "100")),
                ),
            ],
            transform.clone(),
            4,
            Duration::from_secs(1),
        );

        assert_eq!(dispatcher.dispatch(&row(10)).await.unwrap(), 2);
        assert_eq!(dispatcher.dispatch(&row(500)).await.unwrap(), 3);

        let mut dests: Vec<_> = transform
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(d, _)| d.clone())
            .collect();
        dests.sort();
        assert_eq!(dests, vec!["a", "a", "b", "b", "big"]);
    }

    #[tokio::test]
    async fn test_other_tables_ignored() {
        let transform = Arc::new(Recording::default());
        let dispatcher = LogDispatcher::new(
            vec![picker("a", None)],
            transform.clone(),
            2,
            Duration::from_secs(1),
        );
        assert!(dispatcher.has_table("", "orders"));
        assert!(!dispatcher.has_table("", "customers"));

        let other = RowChangeEvent::insert("customers", vec![1i64.into()]);
        assert_eq!(dispatcher.dispatch(&other).await.unwrap(), 0);
        assert!(transform.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_downstream_error_propagates() {
        let transform = Arc::new(Recording {
            fail_on: Some("b".into()),
            ..Default::default()
        });
        let dispatcher = LogDispatcher::new(
            vec![picker("a", None), picker("b", None)],
            transform,
            1,
            Duration::from_secs(1),
        );
        let err = dispatcher.dispatch(&row(1)).await.unwrap_err();
        assert!(matches!(err, CdcError::Downstream(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_timeout() {
        let transform = Arc::new(Recording {
            delay: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let dispatcher = LogDispatcher::new(
            vec![picker("slow", None)],
            transform,
            1,
            Duration::from_secs(5),
        );
        let err = dispatcher.dispatch(&row(1)).await.unwrap_err();
        assert!(matches!(err, CdcError::Timeout(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_polling_dispatch_in_row_order() {
        let transform = Arc::new(Recording::default());
        let dispatcher = PollingDispatcher::new(
            vec![picker("b", None), picker("c", None)],
            transform.clone(),
            Duration::from_secs(1),
        );
        let rows: Vec<_> = (1..=3)
            .map(|id| {
                DeltaRow::insert(
                    serde_json::json!({"id": id}).as_object().unwrap().clone(),
                )
            })
            .collect();

        for picker in dispatcher.pickers() {
            assert_eq!(dispatcher.dispatch(picker, &rows).await.unwrap(), 3);
        }

        let calls = transform.calls.lock().unwrap();
        let order: Vec<_> = calls
            .iter()
            .map(|(d, e)| format!("{}:{}", d, e.after["id"]))
            .collect();
        assert_eq!(order, vec!["b:1", "b:2", "b:3", "c:1", "c:2", "c:3"]);
    }
}
