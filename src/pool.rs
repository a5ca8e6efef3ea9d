use std::cmp::min;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Notify, Semaphore};

use crate::bag::{ConcurrentBag, WantsMoreListener};
use crate::config::{Builder, PoolConfig, VALIDATION_INTERVAL};
use crate::entry::{Entry, IN_USE, NOT_IN_USE};
use crate::error::{report_accounting_violation, EventSink, PoolError};
use crate::housekeeper;
use crate::manager::ConnectionManager;
use crate::scheduler;

const RUNNING: u8 = 0;
const SHUTDOWN: u8 = 1;

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);

/// Point-in-time counters describing a pool's current state.
#[derive(Debug, Clone, Copy)]
pub struct State {
    /// Entries currently tracked by the pool, in any reachable state.
    pub total_connections: u32,
    /// Entries currently `NOT_IN_USE`.
    pub idle_connections: u32,
    /// Entries currently `IN_USE`.
    pub active_connections: u32,
    /// Borrowers currently blocked in `Pool::get`.
    pub threads_awaiting_connection: u32,
}

/// The guts of a `Pool`, reference-counted and shared between every
/// clone of the handle plus the background tasks it spawns.
pub(crate) struct SharedPoolInner<M: ConnectionManager> {
    manager: M,
    pub(crate) config: PoolConfig,
    pub(crate) bag: ConcurrentBag<M::Connection>,
    total_connections: AtomicI64,
    pending_connections: AtomicU32,
    state: AtomicU8,
    add_worker_running: std::sync::atomic::AtomicBool,
    add_worker_notify: Notify,
    close_permits: Semaphore,
    event_sink: Box<dyn EventSink<M::Error>>,
    housekeeper_handle: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
    self_weak: OnceLock<Weak<SharedPoolInner<M>>>,
}

impl<M: ConnectionManager> WantsMoreListener for SharedPoolInner<M> {
    fn wants_more(&self) {
        self.trigger_add_worker();
    }
}

impl<M: ConnectionManager> SharedPoolInner<M> {
    /// Recovers a strong reference to this inner from the weak handle it
    /// stashed during construction. Used wherever a method needs to move
    /// a reference to itself into a spawned task.
    fn strong(&self) -> Arc<Self> {
        self.self_weak
            .get()
            .expect("self_weak initialized during construction")
            .upgrade()
            .expect("pool dropped while one of its own tasks was still running")
    }

    fn sink_error(&self, error: M::Error) {
        tracing::warn!(error = %error, "connection manager reported an error");
        self.event_sink.sink(error);
    }

    fn decrement_total(&self, reason: &str) {
        let previous = self.total_connections.fetch_sub(1, Ordering::SeqCst);
        if previous - 1 < 0 {
            report_accounting_violation(&format!(
                "total_connections went negative after {reason}"
            ));
        }
    }

    pub(crate) async fn close_entry(&self, entry: &Arc<Entry<M::Connection>>) {
        entry.max_life_cancel.cancel();
        if self.bag.remove(entry) {
            self.decrement_total("close_entry");
            self.dispatch_close(entry.take_connection());
        }
    }

    fn dispatch_close(&self, conn: M::Connection) {
        let pool = self.strong();
        tokio::spawn(async move {
            let _permit = pool.close_permits.acquire().await;
            pool.manager.close(conn).await;
        });
    }

    pub(crate) fn request_more_connections(&self) {
        self.trigger_add_worker();
    }

    fn trigger_add_worker(&self) {
        if self.add_worker_running.swap(true, Ordering::SeqCst) {
            // Already running: coalesce by waking it so it re-checks
            // its exit conditions once more before it would otherwise
            // have parked.
            self.add_worker_notify.notify_one();
            return;
        }
        let pool = self.strong();
        tokio::spawn(async move { run_add_worker(pool).await });
    }

    async fn open_one_connection(&self) -> Result<(), M::Error> {
        self.pending_connections.fetch_add(1, Ordering::SeqCst);
        let result = self.manager.connect().await;
        self.pending_connections.fetch_sub(1, Ordering::SeqCst);

        let conn = result?;
        let id = self.bag.next_entry_id();
        let entry = Arc::new(Entry::new(id, conn));
        self.total_connections.fetch_add(1, Ordering::SeqCst);

        if let Some(max_lifetime) = self.config.max_lifetime {
            scheduler::schedule(&entry, max_lifetime);
        }

        self.bag.add(entry);
        tracing::debug!(entry = id, "opened new connection");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }
}

async fn run_add_worker<M: ConnectionManager>(pool: Arc<SharedPoolInner<M>>) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if !pool.is_running() {
            break;
        }

        let total = pool.total_connections.load(Ordering::SeqCst).max(0) as u32
            + pool.pending_connections.load(Ordering::SeqCst);
        if total >= pool.config.maximum_pool_size {
            break;
        }

        let min_idle = pool.config.minimum_idle;
        if min_idle > 0 {
            if pool.bag.idle_count() as u32 >= min_idle {
                break;
            }
        } else if pool.bag.waiters() == 0 {
            // Lazy pool: only ever open on behalf of a borrower that is
            // actually stuck waiting, never speculatively.
            break;
        }

        match pool.open_one_connection().await {
            Ok(()) => {
                backoff = INITIAL_BACKOFF;
                if min_idle == 0 {
                    // One connection satisfies (at most) one waiter;
                    // re-evaluate from the top rather than assume more
                    // are still needed.
                    continue;
                }
            }
            Err(e) => {
                pool.sink_error(e);
                let wait = backoff;
                backoff = min(pool.config.connection_timeout / 2, backoff.mul_f32(1.5));
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = pool.add_worker_notify.notified() => {}
                }
            }
        }
    }
    pool.add_worker_running.store(false, Ordering::SeqCst);
}

/// A generic, cloneable handle to a connection pool.
pub struct Pool<M: ConnectionManager> {
    pub(crate) inner: Arc<SharedPoolInner<M>>,
}

impl<M: ConnectionManager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Pool { inner: Arc::clone(&self.inner) }
    }
}

impl<M: ConnectionManager> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pool({:p})", Arc::as_ptr(&self.inner))
    }
}

impl<M: ConnectionManager> Pool<M> {
    pub(crate) async fn new(
        config: PoolConfig,
        event_sink: Box<dyn EventSink<M::Error>>,
        manager: M,
    ) -> Result<Pool<M>, M::Error> {
        let inner = Self::new_inner(config, event_sink, manager);
        run_add_worker(Arc::clone(&inner)).await;
        Ok(Pool { inner })
    }

    pub(crate) fn new_unchecked(
        config: PoolConfig,
        event_sink: Box<dyn EventSink<M::Error>>,
        manager: M,
    ) -> Pool<M> {
        let inner = Self::new_inner(config, event_sink, manager);
        inner.trigger_add_worker();
        Pool { inner }
    }

    fn new_inner(
        config: PoolConfig,
        event_sink: Box<dyn EventSink<M::Error>>,
        manager: M,
    ) -> Arc<SharedPoolInner<M>> {
        let close_capacity = config.maximum_pool_size.max(1) as usize;
        let housekeeper_period = config.housekeeper_period;
        let inner = Arc::new(SharedPoolInner {
            manager,
            config,
            bag: ConcurrentBag::new(),
            total_connections: AtomicI64::new(0),
            pending_connections: AtomicU32::new(0),
            state: AtomicU8::new(RUNNING),
            add_worker_running: std::sync::atomic::AtomicBool::new(false),
            add_worker_notify: Notify::new(),
            close_permits: Semaphore::new(close_capacity),
            event_sink,
            housekeeper_handle: SyncMutex::new(None),
            self_weak: OnceLock::new(),
        });

        let _ = inner.self_weak.set(Arc::downgrade(&inner));
        let listener: Weak<dyn WantsMoreListener> = Arc::downgrade(&inner) as Weak<dyn WantsMoreListener>;
        inner.bag.set_listener(listener);

        let handle = housekeeper::spawn(Arc::downgrade(&inner), housekeeper_period);
        *inner.housekeeper_handle.lock() = Some(handle);

        inner
    }

    /// Returns a `Builder` instance to configure a new pool.
    pub fn builder() -> Builder<M> {
        Builder::new()
    }

    /// Retrieves a connection, waiting up to the pool's configured
    /// `connection_timeout`.
    pub async fn get(&self) -> Result<PooledConnection<'_, M>, PoolError<M::Error>> {
        self.get_timeout(self.inner.config.connection_timeout).await
    }

    /// Retrieves a connection, waiting up to `timeout` instead of the
    /// pool's configured connection timeout.
    pub async fn get_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection<'_, M>, PoolError<M::Error>> {
        if !self.inner.is_running() {
            return Err(PoolError::Closed);
        }

        let deadline = Instant::now().checked_add(timeout);
        loop {
            let remaining = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()),
                None => timeout,
            };

            let entry = self
                .inner
                .bag
                .borrow(remaining)
                .await
                .map_err(|_| PoolError::Timeout)?;

            if entry.is_expired(self.inner.config.max_lifetime) {
                self.inner.close_entry(&entry).await;
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(PoolError::Timeout);
                }
                continue;
            }

            if entry.idle_for() > VALIDATION_INTERVAL && !self.validate(&entry).await {
                self.inner.close_entry(&entry).await;
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(PoolError::Timeout);
                }
                continue;
            }

            let conn = entry.take_connection();
            return Ok(PooledConnection { pool: self, entry: Some(entry), conn: Some(conn) });
        }
    }

    async fn validate(&self, entry: &Arc<Entry<M::Connection>>) -> bool {
        let mut conn = entry.take_connection();
        let outcome = tokio::time::timeout(
            self.inner.config.validation_timeout,
            self.inner.manager.is_valid(&mut conn),
        )
        .await;
        entry.put_connection(conn);

        match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                self.inner.sink_error(e);
                false
            }
            Err(_) => {
                tracing::warn!(entry = entry.id, "validation timed out");
                false
            }
        }
    }

    /// Returns information about the current state of the pool.
    pub fn state(&self) -> State {
        State {
            total_connections: self.inner.total_connections.load(Ordering::SeqCst).max(0) as u32,
            idle_connections: self.inner.bag.idle_count() as u32,
            active_connections: self.inner.bag.active_count() as u32,
            threads_awaiting_connection: self.inner.bag.waiters() as u32,
        }
    }

    /// Marks every `IN_USE` entry evicted (they close on their next
    /// release) and immediately reserves and closes every `NOT_IN_USE`
    /// entry, without interrupting in-flight work.
    pub async fn soft_evict(&self) {
        tracing::info!("soft eviction requested");
        for entry in self.inner.bag.values(IN_USE) {
            entry.mark_evicted();
        }
        for entry in self.inner.bag.values(NOT_IN_USE) {
            if self.inner.bag.reserve(&entry) {
                self.inner.close_entry(&entry).await;
            }
        }
    }

    /// Forcibly detaches every `IN_USE` entry from the bag, marking it
    /// aborted and evicted.
    ///
    /// Because the connection value itself is owned by whichever task
    /// currently holds the `PooledConnection` facade, the pool cannot
    /// reach in and sever it the way a driver-level `abort()` call can
    /// in a shared-reference runtime. Detaching from the bag guarantees
    /// the connection can never be returned to service: the facade's
    /// `Drop` sees `aborted`/`evicted` set and closes the connection
    /// directly instead of requiting it. Well-behaved callers can also
    /// poll [`PooledConnection::is_aborted`] to stop using the
    /// connection early.
    pub async fn abort_active_connections(&self) {
        tracing::warn!("aborting active connections");
        for entry in self.inner.bag.values(IN_USE) {
            entry.mark_aborted();
            entry.mark_evicted();
            if self.inner.bag.remove(&entry) {
                self.inner.decrement_total("abort_active_connections");
            }
        }
    }

    /// Stops the pool: no further connections are issued, the
    /// housekeeper is stopped, and every idle entry is closed.
    pub async fn shutdown(&self) {
        self.inner.state.store(SHUTDOWN, Ordering::SeqCst);
        self.inner.bag.close();

        if let Some(handle) = self.inner.housekeeper_handle.lock().take() {
            handle.abort();
        }

        for entry in self.inner.bag.values(NOT_IN_USE) {
            if self.inner.bag.reserve(&entry) {
                self.inner.close_entry(&entry).await;
            }
        }

        tracing::info!("pool shutdown complete");
    }
}

/// A smart pointer wrapping a borrowed connection. Returns the
/// connection to the pool (or closes it, if evicted or aborted) when
/// dropped.
pub struct PooledConnection<'a, M: ConnectionManager> {
    pool: &'a Pool<M>,
    entry: Option<Arc<Entry<M::Connection>>>,
    conn: Option<M::Connection>,
}

impl<'a, M: ConnectionManager> PooledConnection<'a, M> {
    /// True once the pool has forcibly detached this connection via
    /// [`Pool::abort_active_connections`]. A cooperative caller should
    /// stop using the connection and let it drop.
    pub fn is_aborted(&self) -> bool {
        self.entry.as_ref().is_some_and(|e| e.is_aborted())
    }
}

impl<'a, M: ConnectionManager> Deref for PooledConnection<'a, M> {
    type Target = M::Connection;

    fn deref(&self) -> &M::Connection {
        self.conn.as_ref().expect("connection taken before drop")
    }
}

impl<'a, M: ConnectionManager> DerefMut for PooledConnection<'a, M> {
    fn deref_mut(&mut self) -> &mut M::Connection {
        self.conn.as_mut().expect("connection taken before drop")
    }
}

impl<'a, M> fmt::Debug for PooledConnection<'a, M>
where
    M: ConnectionManager,
    M::Connection: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.conn, f)
    }
}

impl<'a, M: ConnectionManager> Drop for PooledConnection<'a, M> {
    fn drop(&mut self) {
        let (Some(entry), Some(conn)) = (self.entry.take(), self.conn.take()) else {
            return;
        };
        let pool = Arc::clone(&self.pool.inner);
        tokio::spawn(async move { release(pool, entry, conn).await });
    }
}

async fn release<M: ConnectionManager>(
    pool: Arc<SharedPoolInner<M>>,
    entry: Arc<Entry<M::Connection>>,
    mut conn: M::Connection,
) {
    let broken = pool.manager.has_broken(&mut conn);

    if broken || entry.is_evicted() || entry.is_aborted() {
        if pool.bag.remove(&entry) {
            pool.decrement_total("release of evicted/aborted/broken entry");
        }
        pool.dispatch_close(conn);
        return;
    }

    entry.put_connection(conn);
    pool.bag.requite(entry).await;
}
