//! The contention-free fast path for borrow/requite.
//!
//! The specification models this as a per-thread cache of weakly-held,
//! recently-returned entries. Under `tokio`'s multi-threaded scheduler a
//! task can resume on a different OS thread between polls, so a literal
//! `thread_local!` is not owned by the logical borrower the way it is in
//! a one-thread-per-request server. That doesn't make it unsound, only
//! less effective across a migration: the cached value is a `Weak`
//! reference into data shared across the whole pool, so any thread may
//! freely try to upgrade and CAS it. A cache hit just means "the OS
//! thread currently running this poll recently saw one of its own
//! returns go idle" — still a real, contention-free win for the common
//! case of a task that borrows, uses, and returns without yielding to a
//! different worker thread in between.
//!
//! `Entry<C>` is generic, but a `thread_local!` static cannot itself be
//! generic (it would have to be declared inside a generic function,
//! which puts a nested item definition in terms of that function's type
//! parameter — not legal Rust). Instead there is exactly one
//! `thread_local!`, holding a type-erased map keyed by `TypeId`, with
//! one `Vec<Weak<Entry<C>>>` per connection type actually pooled in the
//! process.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::entry::Entry;

const CACHE_CAPACITY: usize = 8;

type WeakList<C> = Vec<Weak<Entry<C>>>;

thread_local! {
    static CACHE: RefCell<HashMap<TypeId, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

fn with_list<C, R>(f: impl FnOnce(&mut WeakList<C>) -> R) -> R
where
    C: Send + 'static,
{
    CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        let list = cache
            .entry(TypeId::of::<Entry<C>>())
            .or_insert_with(|| Box::new(WeakList::<C>::new()))
            .downcast_mut::<WeakList<C>>()
            .expect("thread-local cache slot type mismatch for this connection type");
        f(list)
    })
}

/// Probe the calling thread's cache, CAS-ing the first hit from
/// `NOT_IN_USE` to `IN_USE`. The winning entry remains cached.
pub(crate) fn try_borrow<C: Send + 'static>() -> Option<Arc<Entry<C>>> {
    with_list::<C, _>(|list| {
        let mut found = None;
        list.retain(|weak| match weak.upgrade() {
            Some(entry) => {
                if found.is_none() && entry.try_acquire() {
                    found = Some(entry);
                }
                true
            }
            None => false,
        });
        found
    })
}

/// Push a just-requited entry into the calling thread's cache as a weak
/// reference, evicting the oldest entry if the cache is full.
pub(crate) fn push<C: Send + 'static>(entry: &Arc<Entry<C>>) {
    with_list::<C, _>(|list| {
        if list.len() >= CACHE_CAPACITY {
            list.remove(0);
        }
        list.push(Arc::downgrade(entry));
    });
}
