use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use crate::error::{EventSink, NopEventSink};
use crate::manager::ConnectionManager;
use crate::pool::Pool;

/// The interval below which a just-returned entry is handed back out
/// without re-running the liveness probe. Not exposed as a recognized
/// configuration option — HikariCP hardcodes the equivalent constant
/// rather than making it tunable, and this crate follows suit.
pub(crate) const VALIDATION_INTERVAL: Duration = Duration::from_millis(1000);

/// Pool configuration: the recognized options from the specification's
/// configuration table, each with a corresponding [`Builder`] setter.
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Hard upper bound on the number of entries the pool will hold.
    pub maximum_pool_size: u32,
    /// Target count of `NOT_IN_USE` entries the add-worker maintains.
    /// `0` means lazy: connections are only opened on demand.
    pub minimum_idle: u32,
    /// How long `Pool::get` will wait for a connection before failing
    /// with [`crate::PoolError::Timeout`].
    #[cfg_attr(feature = "serde", serde(with = "duration_millis"))]
    pub connection_timeout: Duration,
    /// Retire `NOT_IN_USE` entries idle longer than this. `None`
    /// disables idle eviction.
    #[cfg_attr(feature = "serde", serde(with = "duration_millis::option"))]
    pub idle_timeout: Option<Duration>,
    /// Evict an entry this long after it was opened. `None` disables
    /// lifetime eviction.
    #[cfg_attr(feature = "serde", serde(with = "duration_millis::option"))]
    pub max_lifetime: Option<Duration>,
    /// Time budget given to a single liveness probe.
    #[cfg_attr(feature = "serde", serde(with = "duration_millis"))]
    pub validation_timeout: Duration,
    /// SQL run by a driver-supplied manager when no native validity
    /// check is available. The core pool never inspects this value; it
    /// is carried through configuration purely for managers to consult.
    pub connection_test_query: Option<String>,
    /// Whether a manager running `connection_test_query` should roll
    /// back afterwards. Carried through for the same reason as
    /// `connection_test_query`.
    pub isolate_internal_queries: bool,
    /// How often the housekeeper sweeps idle entries for eviction.
    #[cfg_attr(feature = "serde", serde(with = "duration_millis"))]
    pub housekeeper_period: Duration,
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("maximum_pool_size", &self.maximum_pool_size)
            .field("minimum_idle", &self.minimum_idle)
            .field("connection_timeout", &self.connection_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_lifetime", &self.max_lifetime)
            .field("validation_timeout", &self.validation_timeout)
            .field("connection_test_query", &self.connection_test_query)
            .field("isolate_internal_queries", &self.isolate_internal_queries)
            .field("housekeeper_period", &self.housekeeper_period)
            .finish()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            maximum_pool_size: 10,
            minimum_idle: 0,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(10 * 60)),
            max_lifetime: Some(Duration::from_secs(30 * 60)),
            validation_timeout: Duration::from_secs(5),
            connection_test_query: None,
            isolate_internal_queries: false,
            housekeeper_period: Duration::from_secs(30),
        }
    }
}

#[cfg(feature = "serde")]
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            d.map(|d| d.as_millis() as u64).serialize(s)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
        }
    }
}

/// A builder for a connection pool.
pub struct Builder<M: ConnectionManager> {
    config: PoolConfig,
    event_sink: Box<dyn EventSink<M::Error>>,
    _p: PhantomData<M>,
}

impl<M: ConnectionManager> fmt::Debug for Builder<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder").field("config", &self.config).finish()
    }
}

impl<M: ConnectionManager> Default for Builder<M> {
    fn default() -> Self {
        Builder {
            config: PoolConfig::default(),
            event_sink: Box::new(NopEventSink),
            _p: PhantomData,
        }
    }
}

impl<M: ConnectionManager> Builder<M> {
    /// Constructs a new `Builder`, initialized with default values.
    pub fn new() -> Builder<M> {
        Default::default()
    }

    /// Sets the maximum number of connections managed by the pool.
    ///
    /// Defaults to 10.
    pub fn maximum_pool_size(mut self, max_size: u32) -> Self {
        assert!(max_size > 0, "maximum_pool_size must be greater than zero!");
        self.config.maximum_pool_size = max_size;
        self
    }

    /// Sets the target idle connection count maintained by the pool.
    ///
    /// `0` means lazy: the pool will not proactively open connections
    /// beyond what borrowers demand. Defaults to 0.
    pub fn minimum_idle(mut self, min_idle: u32) -> Self {
        assert!(
            min_idle <= self.config.maximum_pool_size,
            "minimum_idle must be no larger than maximum_pool_size"
        );
        self.config.minimum_idle = min_idle;
        self
    }

    /// Sets how long `Pool::get` will wait before giving up.
    ///
    /// Defaults to 30 seconds.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        assert!(timeout > Duration::from_secs(0), "connection_timeout must be non-zero");
        self.config.connection_timeout = timeout;
        self
    }

    /// Sets the idle timeout used by the housekeeper.
    ///
    /// Defaults to 10 minutes; `None` disables idle eviction.
    pub fn idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        assert!(
            idle_timeout != Some(Duration::from_secs(0)),
            "idle_timeout must be greater than zero!"
        );
        self.config.idle_timeout = idle_timeout;
        self
    }

    /// Sets the maximum lifetime of connections in the pool.
    ///
    /// Defaults to 30 minutes; `None` disables lifetime eviction.
    pub fn max_lifetime(mut self, max_lifetime: Option<Duration>) -> Self {
        assert!(
            max_lifetime != Some(Duration::from_secs(0)),
            "max_lifetime must be greater than zero!"
        );
        self.config.max_lifetime = max_lifetime;
        self
    }

    /// Sets the time budget given to a single liveness probe.
    ///
    /// Defaults to 5 seconds.
    pub fn validation_timeout(mut self, timeout: Duration) -> Self {
        assert!(timeout > Duration::from_secs(0), "validation_timeout must be non-zero");
        self.config.validation_timeout = timeout;
        self
    }

    /// Sets the SQL a manager should run when no native validity check
    /// is available. Opaque to the core pool.
    pub fn connection_test_query(mut self, query: impl Into<String>) -> Self {
        self.config.connection_test_query = Some(query.into());
        self
    }

    /// Sets whether a manager running `connection_test_query` should
    /// roll back afterwards. Opaque to the core pool.
    pub fn isolate_internal_queries(mut self, isolate: bool) -> Self {
        self.config.isolate_internal_queries = isolate;
        self
    }

    /// Sets the period between housekeeper sweeps.
    ///
    /// Defaults to 30 seconds.
    pub fn housekeeper_period(mut self, period: Duration) -> Self {
        assert!(period > Duration::from_secs(0), "housekeeper_period must be non-zero");
        self.config.housekeeper_period = period;
        self
    }

    /// Sets the sink for errors not associated with any particular
    /// caller. Defaults to [`NopEventSink`].
    pub fn event_sink(mut self, event_sink: Box<dyn EventSink<M::Error>>) -> Self {
        self.event_sink = event_sink;
        self
    }

    /// Builds a `Pool` from an already-assembled `PoolConfig`, keeping
    /// this builder's other settings (currently just the event sink).
    pub fn with_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Consumes the builder, returning a new, initialized `Pool`.
    ///
    /// The pool will not be returned until it has established its
    /// configured minimum idle connections, or opening one fails.
    pub async fn build(self, manager: M) -> Result<Pool<M>, M::Error> {
        Pool::new(self.config, self.event_sink, manager).await
    }

    /// Consumes the builder, returning a new, initialized `Pool`.
    ///
    /// Unlike `build`, this does not wait for any connections to be
    /// established before returning; the add-worker warms the pool in
    /// the background.
    pub fn build_unchecked(self, manager: M) -> Pool<M> {
        Pool::new_unchecked(self.config, self.event_sink, manager)
    }
}
