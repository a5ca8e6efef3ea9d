//! A fake `ConnectionManager` used across the integration tests.
//!
//! `FakeConnection` just wraps a sequence number so a test can tell two
//! connections apart; `TestManager` wraps shared counters so a test can
//! assert on how many connections were opened, validated, or closed, and
//! can be told to fail its next N connects or invalidate everything it's
//! handed.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use conveyor_pool::ConnectionManager;

#[derive(Debug)]
pub struct FakeConnection {
    pub id: u32,
    pub broken: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("fake connection failure")]
pub struct FakeError;

#[derive(Debug, Default)]
pub struct TestManager {
    next_id: AtomicU32,
    connects: AtomicUsize,
    validations: AtomicUsize,
    closes: AtomicUsize,
    fail_connects: AtomicUsize,
    invalid: AtomicBool,
}

impl TestManager {
    pub fn new() -> Arc<TestManager> {
        Arc::new(TestManager::default())
    }

    /// The next `n` calls to `connect` will fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Every connection handed to `is_valid` from now on fails.
    pub fn invalidate_all(&self) {
        self.invalid.store(true, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn validations(&self) -> usize {
        self.validations.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionManager for TestManager {
    type Connection = FakeConnection;
    type Error = FakeError;

    async fn connect(&self) -> Result<FakeConnection, FakeError> {
        if self.fail_connects.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            if n > 0 {
                Some(n - 1)
            } else {
                None
            }
        }).is_ok()
        {
            return Err(FakeError);
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(FakeConnection { id, broken: false })
    }

    async fn is_valid(&self, conn: &mut FakeConnection) -> Result<(), FakeError> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        if self.invalid.load(Ordering::SeqCst) || conn.broken {
            return Err(FakeError);
        }
        Ok(())
    }

    fn has_broken(&self, conn: &mut FakeConnection) -> bool {
        conn.broken
    }

    async fn close(&self, _conn: FakeConnection) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
