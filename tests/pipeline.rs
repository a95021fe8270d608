//! Integration tests for the query pipeline against a live server.
//!
//! Set `DATABASE_URL` (e.g. `postgres://postgres@localhost/postgres`) to run
//! them; without it every test returns immediately.
//!
//! ## Test Matrix
//!
//! - `pipeline_results_in_order` - batched SELECTs come back to the right ids
//! - `pipeline_runtime_error` - a failing statement poisons everything after it
//! - `pipeline_syntax_error_replayed` - replay pins a rejected batch on the culprit
//! - `pipeline_retain_batches` - the retain threshold holds queries back
//! - `pipeline_flush_recovers` - flush clears a failure
//! - `pipeline_drop_leaves_conn_usable` - dropping mid-batch cancels cleanly
//! - `pipeline_drop_right_after_issue` - a cancel racing the backend still lands
//! - `conn_exec_and_query` - plain execution outside a pipeline

use std::env;
use std::time::{Duration, Instant};

use pgpipe::error::Error;
use pgpipe::sync::Conn;

fn get_conn() -> Option<Conn> {
    let db_url = env::var("DATABASE_URL").ok()?;
    Some(Conn::new(db_url.as_str()).expect("Failed to connect"))
}

#[test]
fn pipeline_results_in_order() {
    let Some(mut conn) = get_conn() else { return };
    let mut pipeline = conn.pipeline().unwrap();
    pipeline.retain(10).unwrap();

    let ids: Vec<_> = (1..=5)
        .map(|i| pipeline.insert(&format!("SELECT {}", i)).unwrap())
        .collect();
    pipeline.complete().unwrap();

    for (i, id) in ids.into_iter().enumerate().rev() {
        let n: i32 = pipeline.retrieve_id(id).unwrap().one_field().unwrap();
        assert_eq!(n, i as i32 + 1);
    }
    assert!(pipeline.is_empty());
}

#[test]
fn pipeline_runtime_error() {
    let Some(mut conn) = get_conn() else { return };
    let mut pipeline = conn.pipeline().unwrap();
    pipeline.retain(10).unwrap();

    let a = pipeline.insert("SELECT 1").unwrap();
    let b = pipeline.insert("SELECT * FROM pg_nonexistent").unwrap();
    let c = pipeline.insert("SELECT 2").unwrap();
    pipeline.complete().unwrap();

    assert!(pipeline.is_poisoned());
    assert_eq!(
        pipeline.retrieve_id(a).unwrap().one_field::<i32>().unwrap(),
        1
    );
    let err = pipeline.retrieve_id(b).unwrap_err();
    assert_eq!(err.sqlstate(), Some("42P01"));
    assert!(matches!(pipeline.retrieve_id(c), Err(Error::PipelineAborted)));
    assert!(pipeline.is_finished(c).unwrap());
}

#[test]
fn pipeline_syntax_error_replayed() {
    let Some(mut conn) = get_conn() else { return };
    let mut pipeline = conn.pipeline().unwrap();
    pipeline.retain(10).unwrap();

    let a = pipeline.insert("SELECT 1").unwrap();
    let b = pipeline.insert("SELECT 2").unwrap();
    let c = pipeline.insert("SELCT 3").unwrap();
    let d = pipeline.insert("SELECT 4").unwrap();
    pipeline.complete().unwrap();

    assert_eq!(
        pipeline.retrieve_id(a).unwrap().one_field::<i32>().unwrap(),
        1
    );
    assert_eq!(
        pipeline.retrieve_id(b).unwrap().one_field::<i32>().unwrap(),
        2
    );
    assert_eq!(pipeline.retrieve_id(c).unwrap_err().sqlstate(), Some("42601"));
    assert!(matches!(pipeline.retrieve_id(d), Err(Error::PipelineAborted)));
}

#[test]
fn pipeline_retain_batches() {
    let Some(mut conn) = get_conn() else { return };
    let mut pipeline = conn.pipeline().unwrap();
    pipeline.retain(3).unwrap();

    let a = pipeline.insert("SELECT 1").unwrap();
    let b = pipeline.insert("SELECT 2").unwrap();
    assert!(!pipeline.is_running(a).unwrap());
    assert!(!pipeline.is_running(b).unwrap());

    // Retrieving an unsent query sends the batch
    let (id, result) = pipeline.retrieve().unwrap();
    assert_eq!(id, a);
    assert_eq!(result.one_field::<i32>().unwrap(), 1);

    pipeline.complete().unwrap();
    assert!(pipeline.is_finished(b).unwrap());
}

#[test]
fn pipeline_flush_recovers() {
    let Some(mut conn) = get_conn() else { return };
    let mut pipeline = conn.pipeline().unwrap();
    pipeline.retain(10).unwrap();

    pipeline.insert("SELECT * FROM pg_nonexistent").unwrap();
    pipeline.insert("SELECT 1").unwrap();
    pipeline.complete().unwrap();
    assert!(pipeline.is_poisoned());

    pipeline.flush().unwrap();
    assert!(pipeline.is_empty());
    assert!(!pipeline.is_poisoned());

    let id = pipeline.insert("SELECT 7").unwrap();
    assert_eq!(
        pipeline.retrieve_id(id).unwrap().one_field::<i32>().unwrap(),
        7
    );
}

#[test]
fn pipeline_drop_leaves_conn_usable() {
    let Some(mut conn) = get_conn() else { return };
    {
        let mut pipeline = conn.pipeline().unwrap();
        pipeline.insert("SELECT pg_sleep(0.5)").unwrap();
        pipeline.insert("SELECT 1").unwrap();
        pipeline.resume().unwrap();
    }

    assert!(!conn.is_broken());
    let n: i32 = conn.query("SELECT 42").unwrap().one_field().unwrap();
    assert_eq!(n, 42);
}

#[test]
fn pipeline_drop_right_after_issue() {
    let Some(mut conn) = get_conn() else { return };
    for _ in 0..5 {
        let started = Instant::now();
        {
            let mut pipeline = conn.pipeline().unwrap();
            pipeline.insert("SELECT pg_sleep(10)").unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!conn.is_broken());
    }
    let n: i32 = conn.query("SELECT 42").unwrap().one_field().unwrap();
    assert_eq!(n, 42);
}

#[test]
fn conn_exec_and_query() {
    let Some(mut conn) = get_conn() else { return };

    let result = conn.exec("SELECT 1; SELECT 2").unwrap();
    assert_eq!(result.one_field::<i32>().unwrap(), 2);

    let failed = conn.exec("SELECT 1; SELECT * FROM pg_nonexistent").unwrap();
    assert!(!failed.is_ok());
    assert!(conn.query("SELECT * FROM pg_nonexistent").is_err());

    conn.query_drop("CREATE TEMP TABLE pgpipe_t (n int)").unwrap();
    let affected = conn
        .query_drop("INSERT INTO pgpipe_t VALUES (1), (2), (3)")
        .unwrap();
    assert_eq!(affected, Some(3));

    let result = conn.query("SELECT n, NULL::text FROM pgpipe_t ORDER BY n").unwrap();
    assert_eq!(result.len(), 3);
    let row = result.row(2).unwrap();
    assert_eq!(row.get::<i64>(0).unwrap(), 3);
    assert_eq!(row.get::<Option<&str>>(1).unwrap(), None);

    conn.close().unwrap();
}
