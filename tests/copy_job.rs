use std::sync::Arc;

use copysql::drivers::{MemoryStore, RecordedOperation};
use copysql::error::{CopyPhase, CopySqlError};
use copysql::{Copier, CopyJob, CopyOptions, Endpoint, Parameters, Record, Registry};

fn record(fields: &[Option<&str>]) -> Record {
    fields.iter().map(|f| f.map(str::to_string)).collect()
}

/// Registry with two independent memory backends standing in for two servers.
fn registry(source: &MemoryStore, destination: &MemoryStore) -> Arc<Registry> {
    let registry = Registry::builder()
        .register("source", source.factory())
        .unwrap()
        .register("destination", destination.factory())
        .unwrap()
        .build();
    Arc::new(registry)
}

fn job(query: &str, table: &str) -> CopyJob {
    CopyJob::new(
        Endpoint::new("source", Parameters::new()),
        query,
        Endpoint::new("destination", Parameters::new()),
        table,
    )
}

#[tokio::test]
async fn test_round_trip_preserves_values_and_nulls() {
    let source = MemoryStore::new()
        .with_table("users", 3)
        .with_row("users", &[Some("1"), Some("Alice"), Some("a,b")])
        .with_row("users", &[Some("2"), None, Some("say \"hi\"")])
        .with_row("users", &[Some("3"), Some("line\nbreak"), None]);
    let destination = MemoryStore::new().with_table("users_copy", 3);

    let copier = Copier::new(registry(&source, &destination));
    let report = copier
        .run(&job("SELECT * FROM users", "users_copy"))
        .await
        .unwrap();

    assert_eq!(report.rows, 3);
    assert_eq!(
        destination.rows("users_copy").unwrap(),
        source.rows("users").unwrap()
    );
    assert_eq!(destination.rows("users_copy").unwrap()[1][1], None);
}

#[tokio::test]
async fn test_zero_rows_succeeds() {
    let source = MemoryStore::new().with_table("empty", 2);
    let destination = MemoryStore::new().with_table("target", 2);

    let report = Copier::new(registry(&source, &destination))
        .run(&job("empty", "target"))
        .await
        .unwrap();

    assert_eq!(report.rows, 0);
    assert!(destination.rows("target").unwrap().is_empty());
    assert!(destination.operations().contains(&RecordedOperation::CopyFrom {
        table: "target".to_string(),
        rows: 0
    }));
}

#[tokio::test]
async fn test_unknown_backend_fails_before_any_io() {
    let source = MemoryStore::new().with_table("t", 1);
    let destination = MemoryStore::new().with_table("t", 1);
    let mut bad = job("t", "t");
    bad.destination = Endpoint::new("unregistered-name", Parameters::new());

    let err = Copier::new(registry(&source, &destination))
        .run(&bad)
        .await
        .unwrap_err();

    assert!(matches!(err, CopySqlError::UnknownBackend(ref name) if name == "unregistered-name"));
    assert!(source.operations().is_empty());
}

#[tokio::test]
async fn test_unreachable_destination_attempts_no_copy() {
    let source = MemoryStore::new()
        .with_table("t", 1)
        .with_row("t", &[Some("x")]);
    let destination = MemoryStore::new().with_table("t", 1);
    destination.set_reachable(false);

    let err = Copier::new(registry(&source, &destination))
        .run(&job("t", "t"))
        .await
        .unwrap_err();

    assert!(matches!(err, CopySqlError::Connection { .. }));
    // The source was opened and then closed, but never queried.
    assert_eq!(
        source.operations(),
        vec![RecordedOperation::Open, RecordedOperation::Close]
    );
    assert!(destination.operations().is_empty());
}

#[tokio::test]
async fn test_malformed_row_aborts_with_zero_rows_loaded() {
    // Source rows are three wide, the destination expects two.
    let source = MemoryStore::new()
        .with_table("wide", 3)
        .with_row("wide", &[Some("1"), Some("a"), Some("x")])
        .with_row("wide", &[Some("2"), Some("b"), Some("y")]);
    let destination = MemoryStore::new().with_table("narrow", 2);

    let err = Copier::new(registry(&source, &destination))
        .run(&job("wide", "narrow"))
        .await
        .unwrap_err();

    match err {
        CopySqlError::Copy { backend, phase, .. } => {
            assert_eq!(backend, "memory");
            assert_eq!(phase, CopyPhase::ExecuteLoad);
        }
        other => panic!("Expected Copy error, got {:?}", other),
    }
    assert!(destination.rows("narrow").unwrap().is_empty());
}

#[tokio::test]
async fn test_source_failure_leaves_destination_empty() {
    let source = MemoryStore::new().with_table("t", 1);
    for i in 0..100 {
        source.insert_row("t", &[Some(i.to_string().as_str())]);
    }
    source.fail_scan_after(50);
    let destination = MemoryStore::new().with_table("t", 1);

    let err = Copier::new(registry(&source, &destination))
        .with_options(CopyOptions { pipe_capacity: 16 })
        .run(&job("t", "t"))
        .await
        .unwrap_err();

    assert!(matches!(err, CopySqlError::Scan { row: 51, .. }));
    assert!(destination.rows("t").unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_destination_table_fails() {
    let source = MemoryStore::new()
        .with_table("t", 1)
        .with_row("t", &[Some("x")]);
    let destination = MemoryStore::new();

    let err = Copier::new(registry(&source, &destination))
        .run(&job("t", "missing"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CopySqlError::Copy {
            phase: CopyPhase::ExecuteLoad,
            ..
        }
    ));
    assert!(err.to_string().contains("missing"));
}

#[tokio::test]
async fn test_both_drivers_closed_on_success_and_failure() {
    let source = MemoryStore::new()
        .with_table("t", 1)
        .with_row("t", &[Some("x")]);
    let destination = MemoryStore::new().with_table("t", 1);
    let copier = Copier::new(registry(&source, &destination));

    copier.run(&job("t", "t")).await.unwrap();
    assert_eq!(source.operations().last(), Some(&RecordedOperation::Close));
    assert_eq!(destination.operations().last(), Some(&RecordedOperation::Close));

    source.clear_operations();
    destination.clear_operations();
    copier.run(&job("t", "missing")).await.unwrap_err();
    assert_eq!(source.operations().last(), Some(&RecordedOperation::Close));
    assert_eq!(destination.operations().last(), Some(&RecordedOperation::Close));
}

#[tokio::test]
async fn test_close_error_after_copy_error_keeps_copy_error() {
    let source = MemoryStore::new()
        .with_table("t", 1)
        .with_row("t", &[Some("x")]);
    let destination = MemoryStore::new();
    source.fail_close(true);
    let copier = Copier::new(registry(&source, &destination));

    let err = copier.run(&job("t", "missing")).await.unwrap_err();
    assert!(matches!(err, CopySqlError::Copy { .. }));

    // With a successful copy the close error is the result.
    let destination_table = MemoryStore::new().with_table("t", 1);
    let copier = Copier::new(registry(&source, &destination_table));
    let err = copier.run(&job("t", "t")).await.unwrap_err();
    assert!(matches!(err, CopySqlError::Close { .. }));
}

#[tokio::test]
async fn test_concurrent_jobs_share_no_stream_state() {
    let source = MemoryStore::new().with_table("a", 1).with_table("b", 1);
    for i in 0..200 {
        source.insert_row("a", &[Some(format!("a{}", i).as_str())]);
        source.insert_row("b", &[Some(format!("b{}", i).as_str())]);
    }
    let destination = MemoryStore::new().with_table("a", 1).with_table("b", 1);
    let copier = Copier::new(registry(&source, &destination))
        .with_options(CopyOptions { pipe_capacity: 32 });

    let first = tokio::spawn({
        let copier = copier.clone();
        async move { copier.run(&job("a", "a")).await }
    });
    let second = tokio::spawn({
        let copier = copier.clone();
        async move { copier.run(&job("b", "b")).await }
    });

    assert_eq!(first.await.unwrap().unwrap().rows, 200);
    assert_eq!(second.await.unwrap().unwrap().rows, 200);
    assert_eq!(destination.rows("a").unwrap(), source.rows("a").unwrap());
    assert_eq!(destination.rows("b").unwrap(), source.rows("b").unwrap());
    assert_eq!(destination.rows("a").unwrap()[0], record(&[Some("a0")]));
}

#[tokio::test]
async fn test_parameters_are_validated_at_create() {
    let source = MemoryStore::new().with_table("t", 1);
    let destination = MemoryStore::new().with_table("t", 1);
    let mut bad = job("t", "t");
    bad.source = bad.source.with("bogus", 1);

    let err = Copier::new(registry(&source, &destination))
        .run(&bad)
        .await
        .unwrap_err();
    assert!(matches!(err, CopySqlError::Configuration { .. }));
}
