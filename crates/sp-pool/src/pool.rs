use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use sp_core::config::PoolConfig;
use sp_session::{Session, SessionOpener};
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PoolError;

// ---------------------------------------------------------------------------
// PoolStats
// ---------------------------------------------------------------------------

/// Point-in-time snapshot of pool bookkeeping and lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub in_use: usize,
    /// Sessions being opened.
    pub pending: usize,
    /// Sessions removed from the pool whose channel is still being closed.
    pub closing: usize,
    pub total_created: u64,
    pub total_acquisitions: u64,
    /// Acquisitions that had to wait for capacity.
    pub wait_count: u64,
    pub total_discarded: u64,
    pub total_reaped: u64,
    pub creation_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total_created: u64,
    total_acquisitions: u64,
    wait_count: u64,
    total_discarded: u64,
    total_reaped: u64,
    creation_failures: u64,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct PoolState {
    /// Idle sessions, most recently released last.
    available: Vec<Session>,
    in_use: usize,
    pending: usize,
    closing: usize,
    closed: bool,
    counters: Counters,
}

impl PoolState {
    fn occupied(&self) -> usize {
        self.available.len() + self.in_use + self.pending + self.closing
    }
}

enum Take {
    Ready(Session),
    Create(u64),
    Full,
}

struct PoolInner {
    config: PoolConfig,
    opener: Arc<dyn SessionOpener>,
    state: Mutex<PoolState>,
    /// Woken on every change that may let a waiter proceed.
    changed: Notify,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| {
            warn!("session pool lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// One unit of capacity came back: unblock one waiter.
    ///
    /// A waiter that is woken but drops out (timeout, cancellation, or it
    /// took a session without waiting) hands the notification on.
    fn wake(&self) {
        self.changed.notify_one();
    }

    fn wake_all(&self) {
        self.changed.notify_waiters();
    }

    fn try_take(&self) -> Result<Take, PoolError> {
        let mut state = self.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        if let Some(mut session) = state.available.pop() {
            session.mark_in_use();
            state.in_use += 1;
            state.counters.total_acquisitions += 1;
            return Ok(Take::Ready(session));
        }
        if state.occupied() < self.config.capacity {
            state.pending += 1;
            return Ok(Take::Create(self.next_id.fetch_add(1, Ordering::Relaxed)));
        }
        Ok(Take::Full)
    }

    async fn release(&self, mut session: Session) {
        if !session.is_usable() {
            debug!(
                session_id = session.id(),
                "released session is unusable, discarding"
            );
            self.discard(session).await;
            return;
        }
        let leftover = {
            let mut state = self.lock();
            state.in_use = state.in_use.saturating_sub(1);
            if state.closed {
                state.closing += 1;
                Some(session)
            } else {
                session.mark_available(Instant::now());
                debug!(
                    session_id = session.id(),
                    use_count = session.use_count(),
                    elevated = session.is_elevated(),
                    "session released"
                );
                state.available.push(session);
                None
            }
        };
        self.wake();

        if let Some(mut session) = leftover {
            session.close().await;
            self.finish_closing(1);
        }
    }

    async fn discard(&self, mut session: Session) {
        let id = session.id();
        session.close().await;
        {
            let mut state = self.lock();
            state.in_use = state.in_use.saturating_sub(1);
            state.counters.total_discarded += 1;
        }
        debug!(session_id = id, "session discarded");
        self.wake();
    }

    /// A lease went out of scope while still holding its session.
    fn abandon(self: &Arc<Self>, mut session: Session) {
        warn!(
            session_id = session.id(),
            "session lease dropped without release, discarding"
        );
        session.poison();
        {
            let mut state = self.lock();
            state.in_use = state.in_use.saturating_sub(1);
            state.counters.total_discarded += 1;
            state.closing += 1;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                handle.spawn(async move {
                    session.close().await;
                    inner.finish_closing(1);
                });
            }
            Err(_) => {
                drop(session);
                self.finish_closing(1);
            }
        }
    }

    fn finish_closing(&self, count: usize) {
        {
            let mut state = self.lock();
            state.closing = state.closing.saturating_sub(count);
        }
        for _ in 0..count {
            self.wake();
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Frees a reserved creation slot unless the new session was handed out.
struct PendingSlot<'a> {
    inner: &'a PoolInner,
    armed: bool,
}

impl PendingSlot<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            {
                let mut state = self.inner.lock();
                state.pending = state.pending.saturating_sub(1);
            }
            self.inner.wake();
        }
    }
}

// ---------------------------------------------------------------------------
// SessionPool
// ---------------------------------------------------------------------------

/// A bounded pool of stateful sessions to one device.
///
/// Sessions are created lazily up to `capacity`, handed out exclusively as
/// [`PooledSession`] leases, and kept (including their elevated state)
/// across uses. Callers that find the pool full wait until a session is
/// released or discarded, the acquire timeout passes, or they are cancelled.
///
/// Cloning is cheap; every clone refers to the same pool.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    /// Create an empty pool. When `reap_interval_ms` is non-zero and a
    /// tokio runtime is running, an idle reaper is started.
    pub fn new(config: PoolConfig, opener: Arc<dyn SessionOpener>) -> Self {
        let reap_interval = config.reap_interval();
        let inner = Arc::new(PoolInner {
            config,
            opener,
            state: Mutex::new(PoolState {
                available: Vec::new(),
                in_use: 0,
                pending: 0,
                closing: 0,
                closed: false,
                counters: Counters::default(),
            }),
            changed: Notify::new(),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        if let Some(interval) = reap_interval {
            spawn_reaper(&inner, interval);
        }

        info!(
            capacity = inner.config.capacity,
            idle_timeout_ms = inner.config.idle_timeout_ms,
            acquire_timeout_ms = inner.config.acquire_timeout_ms,
            "session pool created"
        );
        Self { inner }
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get exclusive use of a session.
    ///
    /// Prefers the most recently released idle session, opens a new one while
    /// below capacity, and otherwise waits. Creation failures surface as
    /// [`PoolError::Creation`] and give the reserved capacity back.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PooledSession, PoolError> {
        if cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        let started = Instant::now();
        let deadline = started + self.inner.config.acquire_timeout();
        let mut waiting = false;

        loop {
            // Register interest before looking at the state so a release
            // between the check and the wait is not missed.
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match self.inner.try_take()? {
                Take::Ready(session) => {
                    debug!(
                        session_id = session.id(),
                        use_count = session.use_count(),
                        elevated = session.is_elevated(),
                        "reusing pooled session"
                    );
                    return Ok(self.lease(session));
                }
                Take::Create(id) => return self.create(id, cancel).await,
                Take::Full => {}
            }

            if !waiting {
                waiting = true;
                self.inner.lock().counters.wait_count += 1;
                debug!(
                    capacity = self.inner.config.capacity,
                    "pool exhausted, waiting for a session"
                );
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                _ = &mut changed => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let waited = started.elapsed();
                    warn!(waited_ms = waited.as_millis() as u64, "timed out waiting for a session");
                    return Err(PoolError::AcquireTimeout { waited });
                }
            }
        }
    }

    /// Return a healthy session for reuse. Its elevated state is kept.
    ///
    /// Unusable sessions are discarded instead, and after [`SessionPool::close`]
    /// the session is closed.
    pub async fn release(&self, mut lease: PooledSession) {
        if let Some(session) = lease.session.take() {
            lease.pool.release(session).await;
        }
    }

    /// Close the session and free its capacity. It is never handed out again.
    pub async fn discard(&self, mut lease: PooledSession) {
        if let Some(session) = lease.session.take() {
            lease.pool.discard(session).await;
        }
    }

    /// Close every available session idle for longer than the idle timeout.
    /// Returns how many were closed.
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout();
        let now = Instant::now();
        let expired: Vec<Session> = {
            let mut state = self.inner.lock();
            if state.closed {
                return 0;
            }
            let (expired, keep): (Vec<Session>, Vec<Session>) = std::mem::take(&mut state.available)
                .into_iter()
                .partition(|session| session.idle_for(now) > idle_timeout);
            state.available = keep;
            state.closing += expired.len();
            state.counters.total_reaped += expired.len() as u64;
            expired
        };

        let count = expired.len();
        if count == 0 {
            return 0;
        }
        for mut session in expired {
            debug!(
                session_id = session.id(),
                idle_ms = session.idle_for(now).as_millis() as u64,
                "reaping idle session"
            );
            session.close().await;
        }
        self.inner.finish_closing(count);
        info!(count, "reaped idle sessions");
        count
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            capacity: self.inner.config.capacity,
            available: state.available.len(),
            in_use: state.in_use,
            pending: state.pending,
            closing: state.closing,
            total_created: state.counters.total_created,
            total_acquisitions: state.counters.total_acquisitions,
            wait_count: state.counters.wait_count,
            total_discarded: state.counters.total_discarded,
            total_reaped: state.counters.total_reaped,
            creation_failures: state.counters.creation_failures,
        }
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            capacity = stats.capacity,
            available = stats.available,
            in_use = stats.in_use,
            pending = stats.pending,
            total_created = stats.total_created,
            total_acquisitions = stats.total_acquisitions,
            wait_count = stats.wait_count,
            total_discarded = stats.total_discarded,
            total_reaped = stats.total_reaped,
            creation_failures = stats.creation_failures,
            "session pool stats"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Stop the reaper, fail pending and future acquires, and close every
    /// idle session. Sessions still leased are closed when they come back.
    pub async fn close(&self) {
        let idle = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle = std::mem::take(&mut state.available);
            state.closing += idle.len();
            idle
        };
        self.inner.shutdown.cancel();
        self.inner.wake_all();

        let count = idle.len();
        for mut session in idle {
            session.close().await;
        }
        self.inner.finish_closing(count);
        info!(closed = count, "session pool closed");
    }

    // ----- helpers -----

    fn lease(&self, session: Session) -> PooledSession {
        PooledSession {
            session: Some(session),
            pool: Arc::clone(&self.inner),
        }
    }

    async fn create(&self, id: u64, cancel: &CancellationToken) -> Result<PooledSession, PoolError> {
        let mut slot = PendingSlot {
            inner: &self.inner,
            armed: true,
        };
        debug!(session_id = id, "opening new session");

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            opened = self.inner.opener.open(id) => opened,
        };

        let mut session = match opened {
            Ok(session) => session,
            Err(e) => {
                self.inner.lock().counters.creation_failures += 1;
                warn!(session_id = id, error = %e, "failed to open session");
                return Err(PoolError::Creation(e));
            }
        };

        let closed = {
            let mut state = self.inner.lock();
            slot.disarm();
            state.pending = state.pending.saturating_sub(1);
            if state.closed {
                state.closing += 1;
                true
            } else {
                session.mark_in_use();
                state.in_use += 1;
                state.counters.total_created += 1;
                state.counters.total_acquisitions += 1;
                false
            }
        };
        if closed {
            self.inner.wake();
            session.close().await;
            self.inner.finish_closing(1);
            return Err(PoolError::Closed);
        }

        info!(session_id = id, "session created");
        Ok(self.lease(session))
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("stats", &self.stats())
            .finish()
    }
}

fn spawn_reaper(inner: &Arc<PoolInner>, interval: Duration) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!("no tokio runtime, idle reaper disabled");
        return;
    };
    let pool: Weak<PoolInner> = Arc::downgrade(inner);
    let shutdown = inner.shutdown.clone();

    handle.spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(inner) = pool.upgrade() else { break };
            SessionPool { inner }.reap_idle().await;
        }
        debug!("idle reaper stopped");
    });
}

// ---------------------------------------------------------------------------
// PooledSession
// ---------------------------------------------------------------------------

/// Exclusive lease on a pooled session.
///
/// Hand it back with [`SessionPool::release`] or [`SessionPool::discard`].
/// A lease that is simply dropped counts as abandoned: the session is closed
/// in the background and its capacity freed.
pub struct PooledSession {
    session: Option<Session>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
            .as_ref()
            .expect("lease holds its session until returned")
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
            .as_mut()
            .expect("lease holds its session until returned")
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.abandon(session);
        }
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("session", &self.session)
            .finish()
    }
}
