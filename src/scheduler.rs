//! The per-entry one-shot that marks an entry evicted once it reaches
//! its configured maximum lifetime.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::entry::Entry;

/// Schedules `entry` to be marked evicted at `max_lifetime` from now,
/// minus a random 2-3% jitter so that a batch of same-age connections
/// opened together don't all expire in the same instant.
///
/// Cancellation races with firing by construction: the spawned task
/// only has two ways out, the sleep elapsing or `entry.max_life_cancel`
/// being cancelled (done by the close path before it tears the entry
/// down), and `select!` resolves exactly one of them.
pub(crate) fn schedule<C: Send + 'static>(entry: &Arc<Entry<C>>, max_lifetime: Duration) {
    let jittered = jitter(max_lifetime);
    let entry = Arc::clone(entry);
    let cancel = entry.max_life_cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(jittered) => {
                tracing::debug!(entry = entry.id, "max-lifetime reached, marking evicted");
                entry.mark_evicted();
            }
            _ = cancel.cancelled() => {}
        }
    });
}

fn jitter(max_lifetime: Duration) -> Duration {
    let pct: f64 = rand::rng().random_range(0.02..=0.03);
    let shaved = max_lifetime.as_secs_f64() * (1.0 - pct);
    Duration::from_secs_f64(shaved.max(0.0))
}
