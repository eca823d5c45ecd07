use super::*;
use serial_test::serial;
use std::time::Instant;
use tempfile::TempDir;

const POLL: Duration = Duration::from_millis(20);

fn test_broker(root: &TempDir, budget: Option<u64>) -> Arc<DiskBroker> {
    Arc::new(DiskBroker::new(root.path(), budget, POLL))
}

#[tokio::test]
async fn test_grant_creates_directory_and_tracks_size() {
    let root = TempDir::new().unwrap();
    let broker = test_broker(&root, Some(100));

    let resource = broker
        .acquire("job", 40, Duration::from_secs(1), None)
        .await
        .unwrap();

    assert!(resource.path().is_dir());
    assert_eq!(resource.path(), root.path().join("job"));
    assert_eq!(resource.size(), 40);
    assert_eq!(broker.in_use(), 40);
    assert_eq!(broker.available(), Some(60));

    broker.release(resource);
    assert_eq!(broker.in_use(), 0);
}

#[tokio::test]
async fn test_subdir_hint_overrides_requester_name() {
    let root = TempDir::new().unwrap();
    let broker = test_broker(&root, None);

    let resource = broker
        .acquire("job", 10, Duration::from_secs(1), Some("top.amp_3".to_string()))
        .await
        .unwrap();

    assert_eq!(resource.path(), root.path().join("top.amp_3"));
    broker.release(resource);
}

#[tokio::test]
async fn test_unbudgeted_broker_admits_everything() {
    let root = TempDir::new().unwrap();
    let broker = test_broker(&root, None);
    assert_eq!(broker.available(), None);

    let a = broker
        .acquire("a", u64::MAX / 4, Duration::from_secs(1), None)
        .await
        .unwrap();
    let b = broker
        .acquire("b", u64::MAX / 4, Duration::from_secs(1), None)
        .await
        .unwrap();
    broker.release(a);
    broker.release(b);
}

#[tokio::test]
#[serial]
async fn test_insufficient_budget_times_out() {
    let root = TempDir::new().unwrap();
    let broker = test_broker(&root, Some(100));

    let held = broker
        .acquire("holder", 100, Duration::from_secs(1), None)
        .await
        .unwrap();

    let err = broker
        .acquire("waiter", 50, Duration::from_millis(100), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Timeout { demand: 50, .. }));

    broker.release(held);
}

#[tokio::test]
#[serial]
async fn test_concurrent_holders_never_exceed_budget() {
    let root = TempDir::new().unwrap();
    let broker = test_broker(&root, Some(100));

    let monitor = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            let mut max_seen = 0u64;
            for _ in 0..200 {
                max_seen = max_seen.max(broker.in_use());
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            max_seen
        })
    };

    let mut workers = Vec::new();
    for i in 0..4 {
        let broker = Arc::clone(&broker);
        workers.push(tokio::spawn(async move {
            let resource = broker
                .acquire(&format!("w{}", i), 40, Duration::from_secs(5), None)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(40)).await;
            broker.release(resource);
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    let max_seen = monitor.await.unwrap();
    assert!(
        max_seen <= 100,
        "live resources peaked at {} bytes, above the 100-byte budget",
        max_seen
    );
}

#[tokio::test]
#[serial]
async fn test_release_unblocks_within_one_polling_cycle() {
    let root = TempDir::new().unwrap();
    let broker = test_broker(&root, Some(100));

    let held = broker
        .acquire("holder", 100, Duration::from_secs(1), None)
        .await
        .unwrap();

    let waiter = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            broker
                .acquire("waiter", 100, Duration::from_secs(5), None)
                .await
        })
    };

    // Let the waiter reach the head of the queue and start polling.
    tokio::time::sleep(POLL * 3).await;
    let released_at = Instant::now();
    broker.release(held);

    let resource = waiter.await.unwrap().unwrap();
    let waited = released_at.elapsed();
    broker.release(resource);

    // Bounded by one polling cycle plus scheduling slack.
    assert!(
        waited < POLL * 5,
        "acquire took {:?} after release, expected about one {:?} cycle",
        waited,
        POLL
    );
}

#[tokio::test]
#[serial]
async fn test_fifo_head_blocks_smaller_requests_behind_it() {
    let root = TempDir::new().unwrap();
    let broker = test_broker(&root, Some(100));

    let held = broker
        .acquire("holder", 60, Duration::from_secs(1), None)
        .await
        .unwrap();

    // Head request cannot fit; the small one behind it would, but FIFO
    // admission must not overtake.
    let big = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            broker
                .acquire("big", 80, Duration::from_millis(500), None)
                .await
        })
    };
    tokio::time::sleep(POLL * 2).await;

    let small = broker
        .acquire("small", 10, Duration::from_millis(200), None)
        .await;
    assert!(matches!(small, Err(BrokerError::Timeout { .. })));

    assert!(matches!(
        big.await.unwrap(),
        Err(BrokerError::Timeout { .. })
    ));
    broker.release(held);
}

#[tokio::test]
#[serial]
async fn test_abandoned_request_never_leaks_budget() {
    let root = TempDir::new().unwrap();
    let broker = test_broker(&root, Some(100));

    let held = broker
        .acquire("holder", 100, Duration::from_secs(1), None)
        .await
        .unwrap();

    // Times out but stays queued.
    let err = broker
        .acquire("orphan", 50, Duration::from_millis(50), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Timeout { .. }));

    // Freeing the budget brings the abandoned request back under
    // consideration; it must be dropped (or its late grant reclaimed),
    // never left holding budget or a directory.
    broker.release(held);
    tokio::time::sleep(POLL * 5).await;

    assert_eq!(broker.in_use(), 0);
    assert!(!root.path().join("orphan").exists());
}

#[tokio::test]
#[serial]
async fn test_dead_unsatisfiable_request_does_not_wedge_the_queue() {
    let root = TempDir::new().unwrap();
    let broker = test_broker(&root, Some(100));

    let held = broker
        .acquire("holder", 100, Duration::from_secs(1), None)
        .await
        .unwrap();

    // Larger than the whole budget: can never be satisfied. The caller
    // gives up quickly, leaving a dead request at the head of the queue.
    let err = broker
        .acquire("too_big", 1_000, Duration::from_millis(50), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Timeout { .. }));

    broker.release(held);

    // A live request behind the dead one must still be served.
    let next = broker
        .acquire("after", 50, Duration::from_secs(2), None)
        .await
        .unwrap();
    assert_eq!(next.size(), 50);
    broker.release(next);
}

#[tokio::test]
async fn test_stopped_broker_rejects_acquires() {
    let root = TempDir::new().unwrap();
    let broker = test_broker(&root, Some(100));

    broker.stop();
    let err = broker
        .acquire("job", 10, Duration::from_secs(1), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Stopped));
}
