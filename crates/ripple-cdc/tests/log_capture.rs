//! Log-derived capture, end to end over an in-memory binlog connection.
//!
//! Run with: cargo test -p ripple-cdc --test log_capture

mod common;

use common::*;
use pretty_assertions::assert_eq;
use ripple_cdc::capture::{LogExtractor, TaskContext, TaskState};
use ripple_cdc::common::{
    CdcOp, ColumnValue, Extractor, FilterCondition, FilterOperator, MetadataStore,
    RowChangeEvent, StreamPosition, TaskMeta,
};
use ripple_cdc::mysql::{BinlogDecoder, BinlogEvent, EventBuilder};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    extractor: LogExtractor,
    store: Arc<FlakyStore>,
    transform: Arc<RecordingTransform>,
    audit: Arc<RecordingAuditSink>,
    connector: Arc<ScriptedConnector>,
}

async fn harness(groups: Vec<ripple_cdc::common::TableGroupConfig>) -> Harness {
    init_test_logging();
    let store = Arc::new(FlakyStore::new(seeded_store(log_mapping(), groups).await));
    let transform = Arc::new(RecordingTransform::new());
    let audit = Arc::new(RecordingAuditSink::new());
    let connector = Arc::new(ScriptedConnector::new());
    let ctx = TaskContext::new(store.clone(), transform.clone())
        .with_audit(audit.clone())
        .with_connector(connector.clone());
    Harness {
        extractor: LogExtractor::new(TASK_ID, ctx),
        store,
        transform,
        audit,
        connector,
    }
}

#[test]
fn test_decoder_orders_scenario() {
    let b = EventBuilder::new();
    let cols = orders_columns();
    let mut stream = b.table_map(5, "shop", "orders", &cols);
    stream.extend(b.write_rows(5, &cols, &[vec![1i64.into(), "a".into()]]));
    stream.extend(b.rotate("log.000002", 500));

    let mut decoder = BinlogDecoder::new();
    let events = decoder.decode_stream(&stream).unwrap();
    assert_eq!(events.len(), 3);

    let BinlogEvent::Rows(rows) = &events[1].event else {
        panic!("expected rows, got {:?}", events[1].event);
    };
    assert_eq!(rows.rows.len(), 1);
    let row: &RowChangeEvent = &rows.rows[0];
    assert_eq!((row.schema.as_str(), row.table.as_str()), ("shop", "orders"));
    assert_eq!(row.operation, CdcOp::Insert);
    assert_eq!(row.after, vec![ColumnValue::Int(1), ColumnValue::from("a")]);

    let BinlogEvent::Control(control) = &events[2].event else {
        panic!("expected control event");
    };
    let mut position = StreamPosition::new("log.000001", 4);
    assert!(position.advance(control.next_file(), control.next_offset()));
    assert_eq!(position, StreamPosition::new("log.000002", 500));
}

#[tokio::test]
async fn test_end_to_end_orders_scenario() {
    let h = harness(vec![orders_group("orders_copy")]).await;
    let feed = h.connector.connection();
    h.extractor.start().await.unwrap();
    assert_eq!(h.extractor.state(), TaskState::Running);
    assert!(!h.extractor.is_dirty());

    let b = EventBuilder::new();
    let cols = orders_columns();
    feed.send(Ok(b.table_map(5, "shop", "orders", &cols))).unwrap();
    feed.send(Ok(b.write_rows(5, &cols, &[vec![1i64.into(), "a".into()]])))
        .unwrap();
    feed.send(Ok(b.rotate("log.000002", 500))).unwrap();

    wait_until("bookmark advance", || h.extractor.is_dirty()).await;
    assert_eq!(
        h.extractor.position(),
        Some(StreamPosition::new("log.000002", 500))
    );

    let calls = h.transform.calls();
    assert_eq!(calls.len(), 1);
    let (destination, event) = &calls[0];
    assert_eq!(destination, "orders_copy");
    assert_eq!(event.source_table, "orders");
    assert_eq!(event.operation, CdcOp::Insert);
    assert!(event.before.is_empty());
    assert_eq!(
        serde_json::Value::Object(event.after.clone()),
        json!({"id": 1, "name": "a"})
    );

    h.extractor.close().await;
    assert_eq!(h.extractor.state(), TaskState::Stopped);
}

#[tokio::test]
async fn test_flush_is_idempotent() {
    let h = harness(vec![orders_group("orders_copy")]).await;
    let feed = h.connector.connection();
    h.extractor.start().await.unwrap();

    assert!(!h.extractor.flush().await.unwrap());

    feed.send(Ok(EventBuilder::new().rotate("log.000003", 4))).unwrap();
    wait_until("rotate", || h.extractor.is_dirty()).await;

    assert!(h.extractor.flush().await.unwrap());
    assert!(!h.extractor.flush().await.unwrap());
    assert_eq!(h.store.inner.save_count(), 1);

    let meta = h.store.get_task_meta(TASK_ID).await.unwrap().unwrap();
    assert_eq!(meta.bookmark, StreamPosition::new("log.000003", 4));
    assert!(meta.begin_time.is_some());
    assert!(meta.end_time >= meta.begin_time);

    h.extractor.close().await;
}

#[tokio::test]
async fn test_failed_save_is_retried() {
    let h = harness(vec![orders_group("orders_copy")]).await;
    let feed = h.connector.connection();
    h.extractor.start().await.unwrap();

    feed.send(Ok(EventBuilder::new().rotate("log.000004", 120))).unwrap();
    wait_until("rotate", || h.extractor.is_dirty()).await;

    h.store.set_failing(true);
    assert!(h.extractor.flush().await.is_err());
    assert!(h.extractor.is_dirty());

    h.store.set_failing(false);
    assert!(h.extractor.flush().await.unwrap());
    assert!(!h.extractor.is_dirty());
    assert_eq!(h.store.inner.save_count(), 1);

    h.extractor.close().await;
}

#[tokio::test]
async fn test_fan_out_respects_each_picker() {
    let h = harness(vec![
        orders_group("all_orders"),
        orders_group("order_ids").with_projection(["id"]),
        orders_group("named_b").with_filter(FilterCondition::and("name", FilterOperator::Eq, "b")),
    ])
    .await;
    let feed = h.connector.connection();
    h.extractor.start().await.unwrap();

    let b = EventBuilder::new();
    let cols = orders_columns();
    feed.send(Ok(b.table_map(5, "shop", "orders", &cols))).unwrap();
    feed.send(Ok(b.write_rows(5, &cols, &[vec![1i64.into(), "a".into()]])))
        .unwrap();
    feed.send(Ok(b.clone().with_next_position(900).xid(1))).unwrap();

    wait_until("commit", || h.extractor.is_dirty()).await;
    let mut destinations = h.transform.destinations();
    destinations.sort();
    assert_eq!(destinations, vec!["all_orders", "order_ids"]);

    let ids_only = h
        .transform
        .calls()
        .into_iter()
        .find(|(d, _)| d == "order_ids")
        .unwrap()
        .1;
    assert_eq!(serde_json::Value::Object(ids_only.after), json!({"id": 1}));
    assert_eq!(h.extractor.stats().applies, 2);

    h.extractor.close().await;
}

#[tokio::test]
async fn test_unmapped_tables_are_skipped() {
    let h = harness(vec![orders_group("orders_copy")]).await;
    let feed = h.connector.connection();
    h.extractor.start().await.unwrap();

    let b = EventBuilder::new();
    let cols = orders_columns();
    feed.send(Ok(b.table_map(9, "shop", "customers", &cols))).unwrap();
    feed.send(Ok(b.write_rows(9, &cols, &[vec![1i64.into(), "x".into()]])))
        .unwrap();
    feed.send(Ok(b.rotate("log.000002", 4))).unwrap();

    wait_until("rotate", || h.extractor.is_dirty()).await;
    assert_eq!(h.transform.count(), 0);
    assert_eq!(h.extractor.stats().rows, 0);
    assert_eq!(h.extractor.state(), TaskState::Running);

    h.extractor.close().await;
}

#[tokio::test]
async fn test_downstream_error_is_contained() {
    let h = harness(vec![orders_group("orders_copy"), orders_group("audit_log")]).await;
    h.transform.reject("audit_log");
    let feed = h.connector.connection();
    h.extractor.start().await.unwrap();

    let b = EventBuilder::new();
    let cols = orders_columns();
    feed.send(Ok(b.table_map(5, "shop", "orders", &cols))).unwrap();
    feed.send(Ok(b.write_rows(5, &cols, &[vec![1i64.into(), "a".into()]])))
        .unwrap();
    feed.send(Ok(b.rotate("log.000002", 4))).unwrap();

    wait_until("rotate", || h.extractor.is_dirty()).await;
    assert_eq!(h.extractor.state(), TaskState::Running);
    assert_eq!(h.extractor.stats().downstream_errors, 1);
    assert_eq!(
        h.audit.categories(),
        vec![ripple_cdc::ErrorCategory::Downstream]
    );

    h.extractor.close().await;
}

#[tokio::test]
async fn test_unknown_table_fails_task() {
    let h = harness(vec![orders_group("orders_copy")]).await;
    let feed = h.connector.connection();
    h.extractor.start().await.unwrap();

    let b = EventBuilder::new();
    feed.send(Ok(b.write_rows(42, &orders_columns(), &[vec![1i64.into(), "a".into()]])))
        .unwrap();

    wait_until("failure", || h.extractor.state() == TaskState::Failed).await;
    assert_eq!(h.audit.categories(), vec![ripple_cdc::ErrorCategory::Decode]);
    assert_eq!(h.transform.count(), 0);

    h.extractor.close().await;
    assert_eq!(h.extractor.state(), TaskState::Failed);
}

#[tokio::test]
async fn test_resumes_from_persisted_bookmark() {
    let h = harness(vec![orders_group("orders_copy")]).await;
    h.store
        .inner
        .put_task_meta(
            TaskMeta::new(TASK_ID).with_bookmark(StreamPosition::new("log.000007", 1234)),
        )
        .await;
    let _feed = h.connector.connection();
    h.extractor.start().await.unwrap();

    let opened = h.connector.opened();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].0.host, "db-1");
    assert_eq!(opened[0].1, StreamPosition::new("log.000007", 1234));

    h.extractor.close().await;
}

#[tokio::test]
async fn test_close_before_start_and_twice() {
    let h = harness(vec![orders_group("orders_copy")]).await;
    h.extractor.close().await;
    assert_eq!(h.extractor.state(), TaskState::Stopped);
    h.extractor.close().await;
    assert!(h.extractor.start().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_close_abandons_event_in_dispatch() {
    let h = harness(vec![orders_group("orders_copy")]).await;
    h.transform.set_delay(Duration::from_secs(2));
    let feed = h.connector.connection();
    h.extractor.start().await.unwrap();

    let b = EventBuilder::new();
    let cols = orders_columns();
    let rows: Vec<_> = (0..50i64).map(|i| vec![i.into(), "x".into()]).collect();
    feed.send(Ok(b.table_map(5, "shop", "orders", &cols))).unwrap();
    feed.send(Ok(b.write_rows(5, &cols, &rows))).unwrap();
    wait_until("first apply", || h.transform.started() == 1).await;

    let begun = tokio::time::Instant::now();
    h.extractor.close().await;
    assert!(begun.elapsed() < Duration::from_secs(1));
    assert_eq!(h.extractor.state(), TaskState::Stopped);

    // Nothing from the abandoned event reaches the transform afterwards.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.transform.started(), 1);
    assert_eq!(h.transform.count(), 0);
}
