//! The periodic sweep that retires idle or evicted entries and nudges
//! the add-worker back toward `minimum_idle`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::entry::NOT_IN_USE;
use crate::manager::ConnectionManager;
use crate::pool::SharedPoolInner;

pub(crate) fn spawn<M: ConnectionManager>(
    pool: Weak<SharedPoolInner<M>>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the sweep itself is cheap
        // on an empty pool, so there's no need to skip it.
        loop {
            ticker.tick().await;
            let Some(pool) = pool.upgrade() else {
                break;
            };
            sweep(&pool).await;
        }
    })
}

async fn sweep<M: ConnectionManager>(pool: &Arc<SharedPoolInner<M>>) {
    let candidates = pool.bag.values(NOT_IN_USE);
    let mut swept = 0usize;
    for entry in candidates {
        if !pool.bag.reserve(&entry) {
            // Someone else (a borrower) claimed it between the snapshot
            // and now; nothing to do.
            continue;
        }

        let idle_expired = match pool.config.idle_timeout {
            Some(limit) if limit > Duration::ZERO => entry.idle_for() > limit,
            _ => false,
        };

        if entry.is_evicted() || idle_expired {
            pool.close_entry(&entry).await;
            swept += 1;
        } else {
            pool.bag.unreserve(&entry);
        }
    }

    if swept > 0 {
        tracing::debug!(swept, "housekeeper retired entries");
    }

    if pool.config.minimum_idle > 0 {
        pool.request_more_connections();
    }
}
