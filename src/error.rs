use std::fmt;

/// The pool's public error type.
///
/// Maps onto the kinds a caller can actually observe: validation and
/// open failures along the borrow path are retried internally with the
/// caller's remaining time budget and only surface here once that
/// budget is exhausted (as [`PoolError::Timeout`]), or propagate as
/// [`PoolError::Connection`] once every retry has failed with the same
/// underlying driver error and no budget remains. Accounting bugs are
/// never surfaced to callers — see [`crate::pool`]'s internal
/// `report_accounting_violation`.
#[derive(Debug, thiserror::Error)]
pub enum PoolError<E> {
    /// The caller's timeout elapsed before a valid connection could be
    /// produced.
    #[error("timed out waiting for a connection")]
    Timeout,
    /// The pool has been shut down; no further connections are issued.
    #[error("the pool has been shut down")]
    Closed,
    /// The driver itself failed and no budget remained to retry.
    #[error(transparent)]
    Connection(#[from] E),
}

/// A trait to receive errors generated by connection management that
/// aren't tied to any particular caller — failed opens, failed
/// validations, and close-path errors that are otherwise swallowed.
pub trait EventSink<E>: fmt::Debug + Send + Sync + 'static {
    /// Receive an error.
    fn sink(&self, error: E);

    /// Clone this sink into a boxed trait object.
    fn boxed_clone(&self) -> Box<dyn EventSink<E>>;
}

/// An `EventSink` implementation that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopEventSink;

impl<E> EventSink<E> for NopEventSink {
    fn sink(&self, _: E) {}

    fn boxed_clone(&self) -> Box<dyn EventSink<E>> {
        Box::new(*self)
    }
}

/// Reports an accounting-invariant violation (e.g. `totalConnections`
/// observed negative, or a state CAS that should have been impossible).
///
/// Per the pool's error-handling policy these are logged with a stack
/// capture and never thrown: a caller mid-borrow should never fail
/// because of a bookkeeping bug elsewhere in the pool.
pub(crate) fn report_accounting_violation(message: &str) {
    let backtrace = std::backtrace::Backtrace::capture();
    tracing::error!(%message, %backtrace, "pool accounting invariant violated");
}
