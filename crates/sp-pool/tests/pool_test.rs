use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sp_core::config::PoolConfig;
use sp_core::secret::Secret;
use sp_pool::{PoolError, SessionPool};
use sp_session::fake::FakeDevice;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn config(capacity: usize) -> PoolConfig {
    PoolConfig {
        capacity,
        idle_timeout_ms: 5_000,
        acquire_timeout_ms: 1_000,
        reap_interval_ms: 0,
    }
}

fn pool_with(device: &FakeDevice, config: PoolConfig) -> SessionPool {
    SessionPool::new(config, Arc::new(device.opener()))
}

fn pool(device: &FakeDevice, capacity: usize) -> SessionPool {
    pool_with(device, config(capacity))
}

// ===========================================================================
// Acquire / release
// ===========================================================================

#[tokio::test]
async fn acquire_creates_then_reuses() {
    let device = FakeDevice::builder().build();
    let pool = pool(&device, 2);
    let cancel = CancellationToken::new();

    let lease = pool.acquire(&cancel).await.unwrap();
    let id = lease.id();
    assert_eq!(lease.use_count(), 1);
    pool.release(lease).await;

    let lease = pool.acquire(&cancel).await.unwrap();
    assert_eq!(lease.id(), id);
    assert_eq!(lease.use_count(), 2);
    assert_eq!(device.opened(), 1);

    let stats = pool.stats();
    assert_eq!(stats.in_use, 1);
    assert_eq!(stats.available, 0);
    assert_eq!(stats.total_created, 1);
    assert_eq!(stats.total_acquisitions, 2);
    pool.release(lease).await;
}

#[tokio::test]
async fn most_recently_released_is_reused_first() {
    let device = FakeDevice::builder().build();
    let pool = pool(&device, 2);
    let cancel = CancellationToken::new();

    let a = pool.acquire(&cancel).await.unwrap();
    let b = pool.acquire(&cancel).await.unwrap();
    let b_id = b.id();
    pool.release(a).await;
    pool.release(b).await;

    let next = pool.acquire(&cancel).await.unwrap();
    assert_eq!(next.id(), b_id);
    pool.release(next).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capacity_is_never_exceeded() {
    let device = FakeDevice::builder().build();
    let pool = pool(&device, 3);
    let live = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let pool = pool.clone();
        let live = Arc::clone(&live);
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            for _ in 0..10 {
                let lease = pool.acquire(&cancel).await.unwrap();
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);

                let stats = pool.stats();
                assert!(stats.available + stats.in_use <= stats.capacity);

                tokio::task::yield_now().await;
                live.fetch_sub(1, Ordering::SeqCst);
                pool.release(lease).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(device.opened() <= 3);
    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.total_acquisitions, 160);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sessions_are_held_exclusively() {
    let device = FakeDevice::builder().build();
    let pool = pool(&device, 2);
    let holders: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        let holders = Arc::clone(&holders);
        tasks.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            for _ in 0..25 {
                let lease = pool.acquire(&cancel).await.unwrap();
                let id = lease.id();
                assert!(
                    holders.lock().unwrap().insert(id),
                    "session {id} handed to two holders"
                );
                tokio::task::yield_now().await;
                holders.lock().unwrap().remove(&id);
                pool.release(lease).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn elevated_state_survives_release() {
    let device = FakeDevice::builder().admin_secret("s3cret").build();
    let pool = pool(&device, 1);
    let cancel = CancellationToken::new();

    let mut lease = pool.acquire(&cancel).await.unwrap();
    lease
        .elevate(&Secret::new("s3cret"), Instant::now() + Duration::from_secs(5))
        .await
        .unwrap();
    let id = lease.id();
    pool.release(lease).await;

    let lease = pool.acquire(&cancel).await.unwrap();
    assert_eq!(lease.id(), id);
    assert!(lease.is_elevated());
    pool.release(lease).await;
}

// ===========================================================================
// Discard / abandon
// ===========================================================================

#[tokio::test]
async fn discarded_session_is_closed_and_never_returned() {
    let device = FakeDevice::builder().build();
    let pool = pool(&device, 1);
    let cancel = CancellationToken::new();

    let lease = pool.acquire(&cancel).await.unwrap();
    let discarded = lease.id();
    pool.discard(lease).await;
    assert_eq!(device.closed(), 1);

    for _ in 0..3 {
        let lease = pool.acquire(&cancel).await.unwrap();
        assert_ne!(lease.id(), discarded);
        pool.release(lease).await;
    }
    let stats = pool.stats();
    assert_eq!(stats.total_discarded, 1);
    assert_eq!(stats.total_created, 2);
}

#[tokio::test]
async fn releasing_an_unusable_session_discards_it() {
    let device = FakeDevice::builder().build();
    let pool = pool(&device, 1);
    let cancel = CancellationToken::new();

    let mut lease = pool.acquire(&cancel).await.unwrap();
    lease.poison();
    pool.release(lease).await;

    let stats = pool.stats();
    assert_eq!(stats.available, 0);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.total_discarded, 1);
    assert_eq!(device.closed(), 1);
}

#[tokio::test]
async fn dropped_lease_frees_capacity() {
    let device = FakeDevice::builder().build();
    let pool = pool(&device, 1);
    let cancel = CancellationToken::new();

    let lease = pool.acquire(&cancel).await.unwrap();
    let abandoned = lease.id();
    drop(lease);

    let lease = pool.acquire(&cancel).await.unwrap();
    assert_ne!(lease.id(), abandoned);
    pool.release(lease).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(device.closed(), 1);
    assert_eq!(pool.stats().total_discarded, 1);
}

// ===========================================================================
// Waiting, timeouts and cancellation
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn acquire_times_out_when_pool_is_held() {
    let device = FakeDevice::builder().build();
    let pool = pool_with(
        &device,
        PoolConfig {
            acquire_timeout_ms: 10,
            ..config(1)
        },
    );
    let cancel = CancellationToken::new();
    let held = pool.acquire(&cancel).await.unwrap();

    let started = Instant::now();
    let err = pool.acquire(&cancel).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, PoolError::AcquireTimeout { .. }), "got {err:?}");
    assert!(elapsed >= Duration::from_millis(10));
    assert!(elapsed < Duration::from_millis(50), "took {elapsed:?}");
    assert_eq!(pool.stats().wait_count, 1);
    pool.release(held).await;
}

#[tokio::test]
async fn waiter_receives_released_session() {
    let device = FakeDevice::builder().build();
    let pool = pool(&device, 1);
    let cancel = CancellationToken::new();
    let held = pool.acquire(&cancel).await.unwrap();
    let id = held.id();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(&CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.release(held).await;

    let lease = waiter.await.unwrap().unwrap();
    assert_eq!(lease.id(), id);
    assert_eq!(device.opened(), 1);
    pool.release(lease).await;
}

#[tokio::test]
async fn waiter_is_woken_by_discard() {
    let device = FakeDevice::builder().build();
    let pool = pool(&device, 1);
    let held = pool.acquire(&CancellationToken::new()).await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(&CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.discard(held).await;

    let lease = waiter.await.unwrap().unwrap();
    assert_eq!(device.opened(), 2);
    pool.release(lease).await;
}

#[tokio::test(start_paused = true)]
async fn each_release_unblocks_one_waiter() {
    let device = FakeDevice::builder().build();
    let pool = pool(&device, 1);
    let held = pool.acquire(&CancellationToken::new()).await.unwrap();
    let served = Arc::new(AtomicUsize::new(0));

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let pool = pool.clone();
            let served = Arc::clone(&served);
            tokio::spawn(async move {
                let lease = pool.acquire(&CancellationToken::new()).await.unwrap();
                served.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                pool.release(lease).await;
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(served.load(Ordering::SeqCst), 0);

    pool.release(held).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(served.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().in_use, 1);

    for waiter in waiters {
        waiter.await.unwrap();
    }
    assert_eq!(served.load(Ordering::SeqCst), 3);
    assert_eq!(device.opened(), 1);
}

#[tokio::test]
async fn wakeup_passes_on_when_the_woken_waiter_gives_up() {
    let device = FakeDevice::builder().build();
    let pool = pool(&device, 1);
    let held = pool.acquire(&CancellationToken::new()).await.unwrap();

    let first_cancel = CancellationToken::new();
    let first = {
        let pool = pool.clone();
        let cancel = first_cancel.clone();
        tokio::spawn(async move { pool.acquire(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(&CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Both happen before either waiter runs again.
    pool.release(held).await;
    first_cancel.cancel();

    let first = first.await.unwrap();
    let second = second.await.unwrap();
    match (first, second) {
        (Err(PoolError::Cancelled), Ok(lease)) => pool.release(lease).await,
        (Ok(lease), _) => panic!("cancelled waiter took session {}", lease.id()),
        (Err(e), Ok(_)) => panic!("first waiter failed: {e}"),
        (_, Err(e)) => panic!("second waiter failed: {e}"),
    }
    assert_eq!(device.opened(), 1);
}

#[tokio::test]
async fn cancelled_waiter_returns_cancelled() {
    let device = FakeDevice::builder().build();
    let pool = pool(&device, 1);
    let held = pool.acquire(&CancellationToken::new()).await.unwrap();

    let cancel = CancellationToken::new();
    let waiter = {
        let pool = pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.acquire(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(PoolError::Cancelled)));
    pool.release(held).await;
}

#[tokio::test]
async fn already_cancelled_token_fails_fast() {
    let device = FakeDevice::builder().build();
    let pool = pool(&device, 1);
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert!(matches!(pool.acquire(&cancel).await, Err(PoolError::Cancelled)));
    assert_eq!(device.open_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelling_creation_frees_the_slot() {
    let device = FakeDevice::builder()
        .open_delay(Duration::from_secs(1))
        .build();
    let pool = pool(&device, 1);

    let cancel = CancellationToken::new();
    let creating = {
        let pool = pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.acquire(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pool.stats().pending, 1);
    cancel.cancel();

    assert!(matches!(creating.await.unwrap(), Err(PoolError::Cancelled)));
    assert_eq!(pool.stats().pending, 0);

    let lease = pool.acquire(&CancellationToken::new()).await.unwrap();
    pool.release(lease).await;
}

#[tokio::test]
async fn creation_failure_does_not_consume_capacity() {
    let device = FakeDevice::builder().build();
    device.fail_next_opens(1);
    let pool = pool(&device, 1);
    let cancel = CancellationToken::new();

    let err = pool.acquire(&cancel).await.unwrap_err();
    assert!(matches!(err, PoolError::Creation(_)), "got {err:?}");

    let lease = pool.acquire(&cancel).await.unwrap();
    let stats = pool.stats();
    assert_eq!(stats.creation_failures, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.in_use, 1);
    pool.release(lease).await;
}

// ===========================================================================
// Idle reaping
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn reap_idle_closes_only_expired_sessions() {
    let device = FakeDevice::builder().build();
    let pool = pool(&device, 2);
    let cancel = CancellationToken::new();

    let old = pool.acquire(&cancel).await.unwrap();
    let fresh = pool.acquire(&cancel).await.unwrap();
    let fresh_id = fresh.id();
    pool.release(old).await;
    tokio::time::advance(Duration::from_secs(3)).await;
    pool.release(fresh).await;
    tokio::time::advance(Duration::from_secs(3)).await;

    assert_eq!(pool.reap_idle().await, 1);
    assert_eq!(device.closed(), 1);

    let stats = pool.stats();
    assert_eq!(stats.available, 1);
    assert_eq!(stats.total_reaped, 1);

    let lease = pool.acquire(&cancel).await.unwrap();
    assert_eq!(lease.id(), fresh_id);
    pool.release(lease).await;
}

#[tokio::test(start_paused = true)]
async fn in_use_sessions_are_not_reaped() {
    let device = FakeDevice::builder().build();
    let pool = pool(&device, 1);
    let lease = pool.acquire(&CancellationToken::new()).await.unwrap();

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(pool.reap_idle().await, 0);
    assert_eq!(device.closed(), 0);
    pool.release(lease).await;
}

#[tokio::test(start_paused = true)]
async fn background_reaper_closes_idle_sessions() {
    let device = FakeDevice::builder().build();
    let pool = pool_with(
        &device,
        PoolConfig {
            reap_interval_ms: 1_000,
            ..config(1)
        },
    );
    let lease = pool.acquire(&CancellationToken::new()).await.unwrap();
    pool.release(lease).await;

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(device.closed(), 0);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(device.closed(), 1);
    assert_eq!(pool.stats().available, 0);
    assert_eq!(pool.stats().total_reaped, 1);
    pool.close().await;
}

// ===========================================================================
// Close
// ===========================================================================

#[tokio::test]
async fn close_shuts_idle_sessions_and_rejects_acquire() {
    let device = FakeDevice::builder().build();
    let pool = pool(&device, 2);
    let cancel = CancellationToken::new();

    let idle = pool.acquire(&cancel).await.unwrap();
    let busy = pool.acquire(&cancel).await.unwrap();
    pool.release(idle).await;

    pool.close().await;
    assert!(pool.is_closed());
    assert_eq!(device.closed(), 1);
    assert!(matches!(pool.acquire(&cancel).await, Err(PoolError::Closed)));

    pool.release(busy).await;
    assert_eq!(device.closed(), 2);
    assert_eq!(pool.stats().available, 0);

    pool.close().await;
    assert_eq!(device.closed(), 2);
}

#[tokio::test]
async fn close_wakes_waiters() {
    let device = FakeDevice::builder().build();
    let pool = pool(&device, 1);
    let held = pool.acquire(&CancellationToken::new()).await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(&CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.close().await;

    assert!(matches!(waiter.await.unwrap(), Err(PoolError::Closed)));
    pool.release(held).await;
}
