use async_trait::async_trait;

/// A trait which provides connection-specific functionality.
///
/// Implementors supply the driver-level operations the pool cannot
/// provide generically: opening a session, probing whether it is still
/// alive, and a cheap synchronous brokenness check performed on the
/// hot release path.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    /// The connection type this manager deals with.
    type Connection: Send + 'static;
    /// The error type returned by `Connection`s.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Attempts to open a new connection.
    async fn connect(&self) -> Result<Self::Connection, Self::Error>;

    /// Determines whether `conn` is still usable, running whatever
    /// liveness probe the driver supports (a native ping, or a
    /// configured test query run under a statement timeout).
    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error>;

    /// Synchronously determines if the connection is known to be broken,
    /// without performing I/O. Checked on the release fast path.
    fn has_broken(&self, conn: &mut Self::Connection) -> bool;

    /// Closes a connection being retired from the pool.
    ///
    /// The default implementation simply drops it. Override when closing
    /// requires an explicit asynchronous step, such as sending the
    /// driver's own termination message.
    async fn close(&self, _conn: Self::Connection) {}
}
