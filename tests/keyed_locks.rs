// End-to-end scenarios for the per-key lock registries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use syncpoint::{LockMap, RwLockMap, WaitError};
use tokio_util::sync::CancellationToken;

fn token() -> CancellationToken {
    CancellationToken::new()
}

/// Tracks how many tasks hold a lock at once, and the observed maximum.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_key_admits_one_holder_under_load() {
    const TASKS: usize = 10_000;

    let map = Arc::new(LockMap::new());
    let counter = Arc::new(AtomicUsize::new(0));
    let gauge = Arc::new(Gauge::default());

    let mut handles = Vec::with_capacity(TASKS);
    for _ in 0..TASKS {
        let map = map.clone();
        let counter = counter.clone();
        let gauge = gauge.clone();
        handles.push(tokio::spawn(async move {
            let guard = map.lock("A".to_string(), token()).await.unwrap();
            gauge.enter();
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            gauge.exit();
            drop(guard);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(gauge.max(), 1);
    assert_eq!(counter.load(Ordering::SeqCst), TASKS);
    assert!(map.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keys_are_mutually_independent() {
    const KEYS: usize = 10;
    const TASKS_PER_KEY: usize = 1_000;

    let map = Arc::new(LockMap::new());
    let counter = Arc::new(AtomicUsize::new(0));
    let gauges: Arc<Vec<Gauge>> = Arc::new((0..KEYS).map(|_| Gauge::default()).collect());

    let mut handles = Vec::with_capacity(KEYS * TASKS_PER_KEY);
    for key in 0..KEYS {
        for _ in 0..TASKS_PER_KEY {
            let map = map.clone();
            let counter = counter.clone();
            let gauges = gauges.clone();
            handles.push(tokio::spawn(async move {
                let guard = map.lock(format!("key-{key}"), token()).await.unwrap();
                gauges[key].enter();
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                gauges[key].exit();
                drop(guard);
            }));
        }
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for gauge in gauges.iter() {
        assert_eq!(gauge.max(), 1);
    }
    assert_eq!(counter.load(Ordering::SeqCst), KEYS * TASKS_PER_KEY);
    assert!(map.is_empty());
}

#[tokio::test]
async fn lock_then_release_leaves_the_map_empty() {
    let map = LockMap::new();

    let guard = map.lock("k", token()).await.unwrap();
    assert_eq!(map.len(), 1);
    guard.release();
    assert!(map.is_empty());
}

#[tokio::test]
async fn entry_exists_exactly_while_handles_are_outstanding() {
    let map = Arc::new(LockMap::new());

    let first = map.lock("k".to_string(), token()).await.unwrap();
    assert_eq!(map.len(), 1);

    // A waiter keeps the same entry alive rather than creating another.
    let waiter = {
        let map = map.clone();
        tokio::spawn(async move {
            let guard = map.lock("k".to_string(), token()).await.unwrap();
            drop(guard);
        })
    };
    tokio::task::yield_now().await;
    assert_eq!(map.len(), 1);

    drop(first);
    waiter.await.unwrap();
    assert!(map.is_empty());
}

#[tokio::test]
async fn cancelled_acquisition_restores_the_refcount() {
    let map = LockMap::new();

    let holder = map.lock("k", token()).await.unwrap();

    let cancel = token();
    let pending = map.lock("k", cancel.clone());
    tokio::pin!(pending);
    assert!(futures::future::poll_immediate(pending.as_mut())
        .await
        .is_none());

    cancel.cancel();
    assert_eq!(pending.await.err(), Some(WaitError::Cancelled));

    holder.release();
    assert!(map.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_locks_are_exclusive_under_load() {
    const TASKS: usize = 1_000;

    let map = Arc::new(RwLockMap::new());
    let gauge = Arc::new(Gauge::default());

    let mut handles = Vec::with_capacity(TASKS);
    for _ in 0..TASKS {
        let map = map.clone();
        let gauge = gauge.clone();
        handles.push(tokio::spawn(async move {
            let guard = map.write("W".to_string(), token()).await.unwrap();
            gauge.enter();
            tokio::task::yield_now().await;
            gauge.exit();
            drop(guard);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(gauge.max(), 1);
    assert!(map.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upgrade_cycles_under_reader_traffic() {
    const ROUNDS: usize = 100;

    let map = Arc::new(RwLockMap::new());
    let writes = Arc::new(AtomicUsize::new(0));

    let upgrader = {
        let map = map.clone();
        let writes = writes.clone();
        tokio::spawn(async move {
            for _ in 0..ROUNDS {
                let mut guard = map.upgradable_read("k".to_string(), token()).await.unwrap();
                let upgraded = guard.upgrade(token()).await.unwrap();
                writes.fetch_add(1, Ordering::SeqCst);
                upgraded.downgrade();
                guard.release();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let map = map.clone();
            tokio::spawn(async move {
                for _ in 0..ROUNDS {
                    let guard = map.read("k".to_string(), token()).await.unwrap();
                    tokio::task::yield_now().await;
                    drop(guard);
                }
            })
        })
        .collect();

    upgrader.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }

    assert_eq!(writes.load(Ordering::SeqCst), ROUNDS);
    assert!(map.is_empty());
}
