use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Idle; eligible for `borrow`.
pub(crate) const NOT_IN_USE: u8 = 0;
/// Checked out by a borrower.
pub(crate) const IN_USE: u8 = 1;
/// Exclusively claimed by a reserver (housekeeper, eviction) for
/// inspection or removal; not eligible for `borrow`.
pub(crate) const RESERVED: u8 = 2;
/// Terminal. No longer reachable from the bag.
pub(crate) const REMOVED: u8 = 3;

/// A pooled entry: a live connection plus the lifecycle metadata the
/// bag and pool need to manage it. Always held behind an `Arc` once
/// published, since the bag, the housekeeper, the max-life timer, and
/// (briefly) a borrower's own facade may each hold a reference.
///
/// The connection value itself lives inside `connection` for as long as
/// the entry is idle, reserved, or mid-validation; it is moved out into
/// the caller-facing facade only once a borrow has fully succeeded, and
/// moved back on return. This keeps every other path (housekeeper,
/// eviction, abort) working with plain atomics on the `Entry` without
/// needing to reach into a value another task may currently own.
pub(crate) struct Entry<C: Send> {
    pub(crate) id: u64,
    connection: Mutex<Option<C>>,
    state: AtomicU8,
    birth: Instant,
    last_access: Mutex<Instant>,
    evicted: AtomicBool,
    aborted: AtomicBool,
    pub(crate) max_life_cancel: CancellationToken,
}

impl<C: Send> Entry<C> {
    pub(crate) fn new(id: u64, connection: C) -> Self {
        let now = Instant::now();
        Entry {
            id,
            connection: Mutex::new(Some(connection)),
            state: AtomicU8::new(NOT_IN_USE),
            birth: now,
            last_access: Mutex::new(now),
            evicted: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            max_life_cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    /// CAS `NOT_IN_USE` -> `IN_USE`. The single synchronization edge a
    /// borrower relies on to observe everything written before the
    /// matching `requite`.
    pub(crate) fn try_acquire(&self) -> bool {
        self.state
            .compare_exchange(NOT_IN_USE, IN_USE, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// CAS `NOT_IN_USE` -> `RESERVED`.
    pub(crate) fn try_reserve(&self) -> bool {
        self.state
            .compare_exchange(NOT_IN_USE, RESERVED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// `RESERVED` -> `NOT_IN_USE`. A plain store is sound here because
    /// exactly one owner ever holds a `RESERVED` entry at a time.
    pub(crate) fn unreserve(&self) {
        self.state.store(NOT_IN_USE, Ordering::Release);
    }

    /// `IN_USE` -> `NOT_IN_USE`. Plain store for the same reason as
    /// `unreserve`: the caller is the sole owner of an `IN_USE` entry.
    pub(crate) fn mark_not_in_use(&self) {
        self.state.store(NOT_IN_USE, Ordering::Release);
    }

    /// CAS `IN_USE` or `RESERVED` -> `REMOVED`.
    pub(crate) fn try_remove(&self) -> bool {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            if current != IN_USE && current != RESERVED {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                REMOVED,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    pub(crate) fn age(&self) -> Duration {
        self.birth.elapsed()
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::Release);
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_aborted(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub(crate) fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        self.is_evicted() || max_lifetime.is_some_and(|limit| self.age() > limit)
    }

    /// Takes the connection out of the entry. Only sound while the
    /// caller is the exclusive owner of the entry (it holds `IN_USE` or
    /// `RESERVED`).
    pub(crate) fn take_connection(&self) -> C {
        self.connection
            .lock()
            .take()
            .expect("entry's connection was already taken by its owner")
    }

    pub(crate) fn put_connection(&self, conn: C) {
        *self.connection.lock() = Some(conn);
    }
}

impl<C: Send> fmt::Debug for Entry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("evicted", &self.is_evicted())
            .field("aborted", &self.is_aborted())
            .field("age", &self.age())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_only_succeeds_once() {
        let entry = Entry::new(1, "conn");
        assert!(entry.try_acquire());
        assert!(!entry.try_acquire());
        assert_eq!(entry.state(), IN_USE);
    }

    #[test]
    fn try_reserve_competes_with_try_acquire() {
        let entry = Entry::new(1, "conn");
        assert!(entry.try_reserve());
        assert!(!entry.try_acquire(), "an already-reserved entry can't also be acquired");
        entry.unreserve();
        assert!(entry.try_acquire());
    }

    #[test]
    fn try_remove_only_fires_from_in_use_or_reserved() {
        let entry = Entry::new(1, "conn");
        assert!(!entry.try_remove(), "an idle entry can't be removed directly");
        entry.try_acquire();
        assert!(entry.try_remove());
        assert_eq!(entry.state(), REMOVED);
        assert!(!entry.try_remove(), "removal is terminal");
    }

    #[test]
    fn take_and_put_round_trip() {
        let entry = Entry::new(1, "conn");
        assert_eq!(entry.take_connection(), "conn");
        entry.put_connection("conn");
        assert_eq!(entry.take_connection(), "conn");
    }

    #[test]
    #[should_panic]
    fn take_connection_twice_panics() {
        let entry = Entry::new(1, "conn");
        entry.take_connection();
        entry.take_connection();
    }

    #[test]
    fn is_expired_checks_both_eviction_and_lifetime() {
        let entry = Entry::new(1, "conn");
        assert!(!entry.is_expired(Some(Duration::from_secs(3600))));
        entry.mark_evicted();
        assert!(entry.is_expired(Some(Duration::from_secs(3600))));
        assert!(entry.is_expired(None));
    }
}
