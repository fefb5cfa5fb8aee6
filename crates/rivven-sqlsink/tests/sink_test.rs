//! Tests for the batch dispatcher

use futures::StreamExt;
use rivven_sqlsink::prelude::*;
use rivven_sqlsink::testing::MockConnectionFactory;
use std::sync::Arc;
use std::time::Duration;

fn records(range: std::ops::RangeInclusive<i64>) -> Vec<Record> {
    range.map(|id| Record::new().with_field("id", id)).collect()
}

fn config(flush_size: usize, max_flush_exceptions: i64) -> SqlSinkConfig {
    SqlSinkConfig {
        connection_string: "mock://db".into(),
        statement: vec!["INSERT INTO t (id) VALUES (?)".into(), "id".into()],
        flush_size,
        max_flush_exceptions,
        retry_initial_interval_seconds: 1.0,
        retry_max_interval_seconds: 4.0,
        ..Default::default()
    }
}

fn sink(factory: &MockConnectionFactory, config: &SqlSinkConfig) -> SqlSink {
    SqlSink::connect(config, Arc::new(factory.clone())).unwrap()
}

/// Mixed outcomes keyed on `id % 4`
fn mixed() -> MockConnectionFactory {
    MockConnectionFactory::new().with_script(|stmt| match stmt.params.first() {
        Some(Param::Integer(n)) if n % 4 == 1 => Err(Error::store("23505", "duplicate key")),
        Some(Param::Integer(n)) if n % 4 == 2 => Err(Error::store("22003", "out of range")),
        Some(Param::Integer(n)) if n % 4 == 3 => Err(Error::store("08006", "connection failure")),
        _ => Ok(1),
    })
}

// ==================== write_batch Tests ====================

#[tokio::test(start_paused = true)]
async fn test_write_batch_slices_by_flush_size() {
    let factory = MockConnectionFactory::new();
    let sink = sink(&factory, &config(2, 10));

    let outcome = sink.write_batch(records(1..=5)).await;

    assert_eq!(outcome.records, 5);
    assert_eq!(outcome.written, 5);
    assert_eq!(outcome.rounds, 3);
    assert_eq!(sink.stats().batches, 3);
    assert_eq!(factory.execution_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_every_record_lands_in_exactly_one_category() {
    let factory = mixed();
    let sink = sink(&factory, &config(3, 2));

    let outcome = sink.write_batch(records(1..=20)).await;

    assert_eq!(outcome.records, 20);
    assert_eq!(outcome.written, 5);
    assert_eq!(outcome.ignored, 5);
    assert_eq!(outcome.fatal, 5);
    assert_eq!(outcome.exhausted, 5);
    assert_eq!(outcome.accounted(), outcome.records);

    let stats = sink.stats();
    assert_eq!(stats.records_written + stats.records_dropped(), 20);
    assert_eq!(stats.batches, 7);
}

#[tokio::test]
async fn test_write_batch_after_shutdown_abandons_everything() {
    let factory = MockConnectionFactory::new();
    let sink = sink(&factory, &config(2, 10));
    sink.shutdown();

    let outcome = sink.write_batch(records(1..=5)).await;

    assert_eq!(outcome.abandoned, 5);
    assert_eq!(factory.execution_count(), 0);
    assert_eq!(sink.stats().records_abandoned, 5);
    assert_eq!(sink.stats().batches, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_backoff_stops_remaining_batches() {
    let factory = MockConnectionFactory::new()
        .with_script(|_| Err(Error::store("57P01", "terminating connection")));
    let sink = sink(&factory, &config(2, 0));
    let stop = sink.shutdown_token();

    let (outcome, _) = tokio::join!(sink.write_batch(records(1..=4)), async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        stop.cancel();
    });

    assert_eq!(outcome.abandoned, 4);
    assert_eq!(outcome.rounds, 1);
    assert_eq!(factory.execution_count(), 2);
}

// ==================== run Tests ====================

#[tokio::test(start_paused = true)]
async fn test_run_drains_stream() {
    let factory = mixed();
    let sink = sink(&factory, &config(4, 1));

    let stats = sink.run(futures::stream::iter(records(1..=12))).await;

    assert_eq!(stats.batches, 3);
    assert_eq!(stats.records_written, 3);
    assert_eq!(stats.records_ignored, 3);
    assert_eq!(stats.records_fatal, 3);
    assert_eq!(stats.records_exhausted, 3);
    assert_eq!(stats.rounds, 6);
}

#[tokio::test]
async fn test_run_does_not_wait_for_a_full_slice() {
    let factory = MockConnectionFactory::new();
    let sink = sink(&factory, &config(100, 10));

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let input = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|record| (record, rx))
    });

    for record in records(1..=3) {
        tx.send(record).unwrap();
    }
    let producer = async move {
        tokio::task::yield_now().await;
        for record in records(4..=5) {
            tx.send(record).unwrap();
        }
    };

    let (stats, _) = tokio::join!(sink.run(input.boxed()), producer);

    assert_eq!(stats.records_written, 5);
    assert!(stats.batches >= 1);
    assert_eq!(factory.committed().len(), 5);
}

#[tokio::test]
async fn test_run_after_shutdown_pulls_nothing() {
    let factory = MockConnectionFactory::new();
    let sink = sink(&factory, &config(2, 10));
    sink.shutdown();

    let stats = sink.run(futures::stream::iter(records(1..=4))).await;

    assert_eq!(stats.batches, 0);
    assert_eq!(factory.execution_count(), 0);
    assert!(sink.is_shutting_down());
}

// ==================== Lifecycle Tests ====================

#[tokio::test]
async fn test_close_releases_pool() {
    let factory = MockConnectionFactory::new();
    let sink = sink(&factory, &config(10, 10));

    sink.write_batch(records(1..=3)).await;
    assert_eq!(sink.pool_stats().connections_created, 1);

    sink.close().await.unwrap();
    assert_eq!(sink.pool_stats().connections_closed, 1);
}

#[test]
fn test_rejects_zero_flush_size() {
    let factory = MockConnectionFactory::new();
    assert!(SqlSink::connect(&config(0, 10), Arc::new(factory)).is_err());
}
