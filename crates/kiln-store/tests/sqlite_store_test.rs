//! Lifecycle and concurrency behavior of the embedded run store.

use kiln_store::{RunFilter, RunStatus, RunStore, SqliteRunStore, StoreError, StoreOptions, open_store};
use kiln_training::Signature;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn sig(byte: u8) -> Signature {
    Signature::from_bytes([byte; 32])
}

fn metrics(rmse: f64) -> BTreeMap<String, f64> {
    BTreeMap::from([("rmse".to_string(), rmse)])
}

#[tokio::test]
async fn test_find_completed_returns_most_recent() {
    let store = SqliteRunStore::open_in_memory().unwrap();
    assert!(store.find_completed_run(&sig(1)).await.unwrap().is_none());

    let first = store.begin_run("xgb", &sig(1)).await.unwrap();
    store.complete_run(&first.run_id, &metrics(0.5), &[]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = store.begin_run("xgb", &sig(1)).await.unwrap();
    store.complete_run(&second.run_id, &metrics(0.4), &[]).await.unwrap();

    let found = store.find_completed_run(&sig(1)).await.unwrap().unwrap();
    assert_eq!(found.run_id, second.run_id);
    assert_eq!(found.metric("rmse"), Some(0.4));
}

#[tokio::test]
async fn test_failed_runs_are_not_reused() {
    let store = SqliteRunStore::open_in_memory().unwrap();
    let run = store.begin_run("xgb", &sig(2)).await.unwrap();
    let failed = store.fail_run(&run.run_id, "trainer exploded").await.unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("trainer exploded"));

    assert!(store.find_completed_run(&sig(2)).await.unwrap().is_none());
    // a failed run does not block a new attempt
    store.begin_run("xgb", &sig(2)).await.unwrap();
}

#[tokio::test]
async fn test_duplicate_active_run_rejected() {
    let store = SqliteRunStore::open_in_memory().unwrap();
    let run = store.begin_run("xgb", &sig(3)).await.unwrap();

    let err = store.begin_run("xgb-copy", &sig(3)).await.unwrap_err();
    match err {
        StoreError::DuplicateActiveRun { signature, run_id } => {
            assert_eq!(signature, sig(3));
            assert_eq!(run_id, run.run_id.to_string());
        }
        other => panic!("unexpected error: {other}"),
    }

    store.begin_run("rf", &sig(4)).await.unwrap();
}

#[tokio::test]
async fn test_list_runs_filters_and_orders() {
    let store = SqliteRunStore::open_in_memory().unwrap();
    for (i, model) in ["a", "b", "a"].iter().enumerate() {
        let run = store.begin_run(model, &sig(10 + i as u8)).await.unwrap();
        store.complete_run(&run.run_id, &metrics(0.1), &[]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    store.begin_run("a", &sig(20)).await.unwrap();

    let all = store.list_runs(&RunFilter::default()).await.unwrap();
    assert_eq!(all.len(), 4);
    assert!(all.windows(2).all(|w| w[0].started_at >= w[1].started_at));

    let a_done = store
        .list_runs(&RunFilter::default().model("a").status(RunStatus::Completed))
        .await
        .unwrap();
    assert_eq!(a_done.len(), 2);
    assert!(a_done.iter().all(|r| r.model_id == "a" && r.status == RunStatus::Completed));

    let limited = store.list_runs(&RunFilter::default().limit(1)).await.unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].status, RunStatus::Running);
}

#[tokio::test]
async fn test_reap_marks_stale_runs_failed() {
    let store = SqliteRunStore::open_in_memory().unwrap();
    let stale = store.begin_run("xgb", &sig(5)).await.unwrap();
    let done = store.begin_run("rf", &sig(6)).await.unwrap();
    store.complete_run(&done.run_id, &metrics(0.2), &[]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(store.reap_stale_runs(Duration::from_secs(3600)).await.unwrap().is_empty());

    let reaped = store.reap_stale_runs(Duration::from_millis(10)).await.unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].run_id, stale.run_id);
    assert_eq!(reaped[0].status, RunStatus::Failed);
    assert!(reaped[0].error.as_deref().unwrap().starts_with("reaped"));

    let running = store.list_runs(&RunFilter::default().status(RunStatus::Running)).await.unwrap();
    assert!(running.is_empty());
}

#[tokio::test]
async fn test_concurrent_writers_lose_nothing() {
    let store = Arc::new(SqliteRunStore::open_in_memory().unwrap());
    let mut handles = Vec::new();
    for i in 0..10u8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let run = store.begin_run(&format!("model-{i}"), &sig(100 + i)).await?;
            store.log_artifact(&run.run_id, "model.json", &[i; 64]).await?;
            let record = store.complete_run(&run.run_id, &metrics(f64::from(i)), &[]).await?;
            Ok::<_, StoreError>(record)
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let completed = store.list_runs(&RunFilter::default().status(RunStatus::Completed)).await.unwrap();
    assert_eq!(completed.len(), 10);
}

#[tokio::test]
async fn test_file_store_persists_across_reopen() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("nested/runs.db");
    let endpoint = format!("sqlite://{}", path.display());

    let run_id = {
        let store = open_store(&endpoint, &StoreOptions::default()).unwrap();
        let run = store.begin_run("xgb", &sig(7)).await.unwrap();
        store.log_artifact(&run.run_id, "weights.bin", b"\x00\x01\x02").await.unwrap();
        store.complete_run(&run.run_id, &metrics(0.3), &[]).await.unwrap();
        run.run_id
    };

    let store = open_store(path.to_str().unwrap(), &StoreOptions::default()).unwrap();
    let found = store.find_completed_run(&sig(7)).await.unwrap().unwrap();
    assert_eq!(found.run_id, run_id);
    assert_eq!(store.read_artifact(&run_id, "weights.bin").await.unwrap(), b"\x00\x01\x02");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_stores_on_one_file_report_duplicate_active_run() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("runs.db");
    let first = Arc::new(SqliteRunStore::open(&path).unwrap());
    let second = Arc::new(SqliteRunStore::open(&path).unwrap());

    let mut handles = Vec::new();
    for i in 0..100u8 {
        for store in [Arc::clone(&first), Arc::clone(&second)] {
            handles.push(tokio::spawn(async move { store.begin_run("xgb", &sig(i)).await }));
        }
    }

    let (mut started, mut duplicates) = (0, 0);
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => started += 1,
            Err(StoreError::DuplicateActiveRun { run_id, .. }) => {
                assert!(!run_id.is_empty());
                duplicates += 1;
            }
            Err(e) => panic!("begin_run lost the race with {e}"),
        }
    }
    assert_eq!(started, 100);
    assert_eq!(duplicates, 100);
}

#[tokio::test]
async fn test_reap_with_huge_age_finds_nothing() {
    let store = SqliteRunStore::open_in_memory().unwrap();
    store.begin_run("xgb", &sig(8)).await.unwrap();

    let reaped = store.reap_stale_runs(Duration::from_secs(100_000_000_000_000)).await.unwrap();
    assert!(reaped.is_empty());
    let running = store.list_runs(&RunFilter::default().status(RunStatus::Running)).await.unwrap();
    assert_eq!(running.len(), 1);
}

#[tokio::test]
async fn test_read_only_open_never_creates_the_database() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("nested/runs.db");

    let store = SqliteRunStore::open_read_only(&path).unwrap();
    assert!(store.find_completed_run(&sig(9)).await.unwrap().is_none());
    assert!(!temp.path().join("nested").exists());
}

#[tokio::test]
async fn test_read_only_open_sees_runs_and_rejects_writes() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("runs.db");
    let run_id = {
        let store = SqliteRunStore::open(&path).unwrap();
        let run = store.begin_run("xgb", &sig(10)).await.unwrap();
        store.complete_run(&run.run_id, &metrics(0.5), &[]).await.unwrap();
        run.run_id
    };

    let store = SqliteRunStore::open_read_only(&path).unwrap();
    let found = store.find_completed_run(&sig(10)).await.unwrap().unwrap();
    assert_eq!(found.run_id, run_id);
    assert!(store.begin_run("xgb", &sig(11)).await.is_err());
}
