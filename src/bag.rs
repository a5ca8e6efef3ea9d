use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::cache;
use crate::entry::{Entry, IN_USE, NOT_IN_USE};

/// Callback invoked by the bag when a borrower would otherwise have to
/// block. The pool implements this to kick the add-worker; multiple
/// signals that arrive while it's already running are coalesced.
pub(crate) trait WantsMoreListener: Send + Sync {
    fn wants_more(&self);
}

/// The bag timed out a borrow attempt. Not a public error type — the
/// pool maps this onto [`crate::PoolError::Timeout`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct BorrowTimedOut;

/// The lock-light container shared between borrowers and returners.
///
/// Fast-path operations (`borrow`'s cache probe and shared-list scan,
/// `requite`'s handoff offer and cache push) never hold a lock across an
/// `.await`; the only suspension point in the whole bag is the handoff
/// wait inside `borrow`, bounded by the caller's timeout.
///
/// The handoff itself is a single-slot rendezvous rather than a queue:
/// a returner only ever places an entry in `slot` when `waiters` is
/// nonzero, and never leaves more than one entry waiting there. A
/// connection with nobody to hand it to just stays visible in `shared`
/// for the next scan, the same as one published by `add`.
pub(crate) struct ConcurrentBag<C: Send + 'static> {
    shared: RwLock<Vec<Arc<Entry<C>>>>,
    waiters: AtomicUsize,
    slot: Mutex<Option<Arc<Entry<C>>>>,
    notify: Notify,
    closed: AtomicBool,
    next_id: AtomicU64,
    listener: RwLock<Option<Weak<dyn WantsMoreListener>>>,
}

impl<C: Send + 'static> fmt::Debug for ConcurrentBag<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentBag")
            .field("entries", &self.shared.read().len())
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .finish()
    }
}

impl<C: Send + 'static> ConcurrentBag<C> {
    pub(crate) fn new() -> Self {
        ConcurrentBag {
            shared: RwLock::new(Vec::new()),
            waiters: AtomicUsize::new(0),
            slot: Mutex::new(None),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            listener: RwLock::new(None),
        }
    }

    pub(crate) fn next_entry_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn set_listener(&self, listener: Weak<dyn WantsMoreListener>) {
        *self.listener.write() = Some(listener);
    }

    fn notify_wants_more(&self) {
        if let Some(listener) = self.listener.read().as_ref().and_then(Weak::upgrade) {
            listener.wants_more();
        }
    }

    pub(crate) fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    pub(crate) fn len(&self) -> usize {
        self.shared.read().len()
    }

    fn scan_shared(&self) -> Option<Arc<Entry<C>>> {
        let list = self.shared.read();
        list.iter().find(|e| e.try_acquire()).cloned()
    }

    /// Place `entry` into the rendezvous slot if, and only if, a
    /// borrower is actually parked waiting for one. Never buffers: a
    /// `false` return means the caller's entry was not handed to
    /// anyone and must fall back to the shared list or the thread
    /// cache, exactly as if no handoff had been attempted at all.
    fn try_offer(&self, entry: &Arc<Entry<C>>) -> bool {
        if self.waiters.load(Ordering::SeqCst) == 0 {
            return false;
        }
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(Arc::clone(entry));
        drop(slot);
        self.notify.notify_one();
        true
    }

    /// Borrow an entry, blocking on the handoff rendezvous up to
    /// `timeout`.
    ///
    /// `timeout == Duration::ZERO` attempts exactly one non-blocking
    /// pass: the cache probe plus a single shared-list scan.
    pub(crate) async fn borrow(&self, timeout: Duration) -> Result<Arc<Entry<C>>, BorrowTimedOut> {
        if let Some(entry) = cache::try_borrow::<C>() {
            tracing::trace!(entry = entry.id, "borrow: thread-cache hit");
            return Ok(entry);
        }

        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BorrowTimedOut);
            }

            self.waiters.fetch_add(1, Ordering::SeqCst);
            let scanned = self.scan_shared();
            if let Some(entry) = scanned {
                self.waiters.fetch_sub(1, Ordering::SeqCst);
                tracing::trace!(entry = entry.id, "borrow: shared-list hit");
                return Ok(entry);
            }

            // Signal starvation exactly once per attempt, only now that
            // scanning has failed and we are about to block.
            self.notify_wants_more();

            if timeout.is_zero() {
                self.waiters.fetch_sub(1, Ordering::SeqCst);
                return Err(BorrowTimedOut);
            }

            let remaining = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()),
                None => Duration::from_secs(u32::MAX as u64),
            };
            if remaining.is_zero() {
                self.waiters.fetch_sub(1, Ordering::SeqCst);
                return Err(BorrowTimedOut);
            }

            // Lost-wakeup-safe wait: register interest in a
            // notification, then check the slot, so an offer that
            // races with this registration can never be missed. If an
            // offer already landed before `notified()` was even
            // created, the first `take()` below picks it up directly.
            let notified = self.notify.notified();
            let mut handed = self.slot.lock().take();
            if handed.is_none() {
                match tokio::time::timeout(remaining, notified).await {
                    Ok(()) => handed = self.slot.lock().take(),
                    Err(_) => {} // elapsed
                }
            }
            self.waiters.fetch_sub(1, Ordering::SeqCst);

            if let Some(entry) = handed {
                // A successful handoff still requires the CAS: a
                // competing borrower may have claimed the same entry
                // via a list scan between the offer and our wakeup.
                if entry.try_acquire() {
                    tracing::trace!(entry = entry.id, "borrow: handoff hit");
                    return Ok(entry);
                }
            }

            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(BorrowTimedOut);
                }
            }
        }
    }

    /// Return a borrowed entry: mark it idle, hand it directly to a
    /// waiting borrower if one exists, otherwise cache it on this
    /// thread.
    pub(crate) async fn requite(&self, entry: Arc<Entry<C>>) {
        entry.touch();
        entry.mark_not_in_use();

        if self.waiters.load(Ordering::SeqCst) > 0 {
            const SPIN_YIELDS: u32 = 64;
            for _ in 0..SPIN_YIELDS {
                if self.try_offer(&entry) {
                    return;
                }
                if self.waiters.load(Ordering::SeqCst) == 0 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        }

        cache::push(&entry);
    }

    /// Publish a newly opened entry: visible to scans and offered to
    /// any borrower already parked on the handoff rendezvous.
    pub(crate) fn add(&self, entry: Arc<Entry<C>>) {
        self.shared.write().push(entry.clone());
        self.try_offer(&entry);
    }

    /// CAS the entry to `REMOVED` and unlink it from the shared list.
    /// Returns `false` if a competing transition won the race, or the
    /// entry was already removed.
    pub(crate) fn remove(&self, entry: &Arc<Entry<C>>) -> bool {
        if !entry.try_remove() {
            return false;
        }
        let mut list = self.shared.write();
        if let Some(pos) = list.iter().position(|e| Arc::ptr_eq(e, entry)) {
            list.swap_remove(pos);
        }
        true
    }

    /// CAS `NOT_IN_USE` -> `RESERVED`.
    pub(crate) fn reserve(&self, entry: &Arc<Entry<C>>) -> bool {
        entry.try_reserve()
    }

    /// `RESERVED` -> `NOT_IN_USE`, re-offered to any blocked borrower.
    pub(crate) fn unreserve(&self, entry: &Arc<Entry<C>>) {
        entry.unreserve();
        self.try_offer(entry);
    }

    /// A weakly-consistent, point-in-time snapshot of entries in the
    /// given state.
    pub(crate) fn values(&self, state: u8) -> Vec<Arc<Entry<C>>> {
        self.shared
            .read()
            .iter()
            .filter(|e| e.state() == state)
            .cloned()
            .collect()
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.shared.read().iter().filter(|e| e.state() == NOT_IN_USE).count()
    }

    pub(crate) fn active_count(&self) -> usize {
        self.shared.read().iter().filter(|e| e.state() == IN_USE).count()
    }

    /// Closes the rendezvous so any borrower currently blocked in
    /// `borrow` wakes with a timeout instead of waiting out its budget.
    /// Called once, on shutdown.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;

    fn seeded_bag(n: u64) -> ConcurrentBag<&'static str> {
        let bag = ConcurrentBag::new();
        for id in 0..n {
            bag.add(Arc::new(Entry::new(id, "conn")));
        }
        bag
    }

    #[tokio::test]
    async fn borrow_finds_an_idle_entry_via_the_shared_scan() {
        let bag = seeded_bag(1);
        let entry = bag.borrow(Duration::from_millis(50)).await.unwrap();
        assert_eq!(entry.state(), IN_USE);
    }

    #[tokio::test]
    async fn borrow_zero_timeout_fails_fast_on_an_empty_bag() {
        let bag: ConcurrentBag<&'static str> = ConcurrentBag::new();
        let result = bag.borrow(Duration::ZERO).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn requite_hands_directly_to_a_blocked_borrower() {
        let bag = Arc::new(seeded_bag(1));
        let entry = bag.borrow(Duration::from_millis(50)).await.unwrap();

        let waiter_bag = Arc::clone(&bag);
        let waiter = tokio::spawn(async move {
            waiter_bag.borrow(Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        bag.requite(entry).await;

        let handed_off = waiter.await.unwrap().unwrap();
        assert_eq!(handed_off.state(), IN_USE);
    }

    #[tokio::test]
    async fn remove_unlinks_an_acquired_entry() {
        let bag = seeded_bag(1);
        let entry = bag.borrow(Duration::from_millis(50)).await.unwrap();
        assert!(bag.remove(&entry));
        assert_eq!(bag.len(), 0);
        assert!(!bag.remove(&entry), "removing twice must not succeed");
    }

    #[tokio::test]
    async fn reserve_excludes_an_entry_from_borrow() {
        let bag = seeded_bag(1);
        let entry = bag.values(NOT_IN_USE).into_iter().next().unwrap();
        assert!(bag.reserve(&entry));
        let result = bag.borrow(Duration::ZERO).await;
        assert!(result.is_err(), "a reserved entry is not borrowable");
        bag.unreserve(&entry);
        assert!(bag.borrow(Duration::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn add_does_not_offer_into_the_slot_with_no_waiters() {
        let bag: ConcurrentBag<&'static str> = ConcurrentBag::new();
        bag.add(Arc::new(Entry::new(0, "conn")));
        assert!(bag.slot.lock().is_none(), "nobody was waiting; the slot must stay empty");
        assert_eq!(bag.len(), 1);
    }
}
