//! Integration tests for the shared daily quota record.
//!
//! These exercise the record the way separate processes do: independent
//! store and guard handles over the same file.

use chrono::Utc;
use conveyor::quota::{QuotaError, QuotaGuard, QuotaStore};

#[test]
fn test_workers_and_orchestrator_share_one_budget() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quota.json");

    // Three "worker" guards, as separate stage processes would open them.
    let workers: Vec<_> = (0..3)
        .map(|_| QuotaGuard::open(QuotaStore::new(&path), 1500, vec![1000, 1500]).unwrap())
        .collect();

    for worker in &workers {
        worker.record_call("generateImage").unwrap();
        worker.record_call("removeBackground").unwrap();
    }

    // The orchestrator's view includes every worker's calls.
    let orchestrator = QuotaGuard::open(QuotaStore::new(&path), 1500, vec![1000, 1500]).unwrap();
    let state = orchestrator.snapshot().unwrap();
    assert_eq!(state.call_count, 6);
    assert_eq!(state.per_function_counts["generateImage"], 3);
    assert_eq!(state.per_function_counts["removeBackground"], 3);
    assert_eq!(orchestrator.remaining_calls().unwrap(), 1494);
}

#[test]
fn test_threshold_warning_fires_once_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quota.json");
    let store = QuotaStore::new(&path);
    let today = Utc::now().date_naive();

    // Earlier workers already spent 999 calls today.
    store
        .update(1500, today, |state| {
            state.call_count = 999;
        })
        .unwrap();

    let guard = QuotaGuard::open(QuotaStore::new(&path), 1500, vec![1000]).unwrap();
    let receipt = guard.record_call("generateImage").unwrap();
    assert_eq!(receipt.call_count, 1000);
    assert_eq!(receipt.crossed_thresholds, vec![1000]);

    // A fresh guard (a restarted orchestrator) sees the threshold as
    // already notified and stays quiet.
    let restarted = QuotaGuard::open(QuotaStore::new(&path), 1500, vec![1000]).unwrap();
    let receipt = restarted.record_call("generateImage").unwrap();
    assert_eq!(receipt.call_count, 1001);
    assert!(receipt.crossed_thresholds.is_empty());
}

#[test]
fn test_concurrent_processes_lose_no_increment() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quota.json");

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            std::thread::spawn(move || {
                let guard = QuotaGuard::open(QuotaStore::new(&path), 10_000, vec![]).unwrap();
                for _ in 0..25 {
                    guard.record_call("generateImage").unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let state = QuotaStore::new(&path)
        .load(10_000, Utc::now().date_naive())
        .unwrap();
    assert_eq!(state.call_count, 100);
}

#[test]
fn test_failed_save_keeps_increment_until_next_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quota.json");
    let guard = QuotaGuard::open(QuotaStore::new(&path), 1500, vec![]).unwrap();
    guard.record_call("generateImage").unwrap();

    // Park the record and put a directory in its place so the store can
    // neither read nor replace it. (Permission tricks are unreliable here:
    // a privileged test runner ignores them.)
    let parked = dir.path().join("quota.parked");
    std::fs::rename(&path, &parked).unwrap();
    std::fs::create_dir(&path).unwrap();

    let err = guard.record_call("generateImage").unwrap_err();
    assert!(matches!(
        err,
        QuotaError::Read { .. } | QuotaError::Persistence { .. }
    ));

    // The failed call is not forgotten: once the record is usable again,
    // the next write lands the retained increment together with its own.
    std::fs::remove_dir(&path).unwrap();
    std::fs::rename(&parked, &path).unwrap();

    let receipt = guard.record_call("generateImage").unwrap();
    assert_eq!(receipt.call_count, 3);
    assert_eq!(receipt.remaining, 1497);

    let state = guard.snapshot().unwrap();
    assert_eq!(state.call_count, 3);
    assert_eq!(state.per_function_counts["generateImage"], 3);
    assert_eq!(state.history.len(), 3);
}

#[test]
fn test_budget_exhaustion_blocks_further_calls() {
    let dir = tempfile::tempdir().unwrap();
    let guard = QuotaGuard::open(QuotaStore::new(dir.path().join("quota.json")), 3, vec![3])
        .unwrap();

    for _ in 0..2 {
        guard.record_call("generateImage").unwrap();
        assert!(guard.can_proceed());
    }
    let receipt = guard.record_call("generateImage").unwrap();
    assert_eq!(receipt.remaining, 0);
    assert_eq!(receipt.crossed_thresholds, vec![3]);
    assert!(!guard.can_proceed());
}
