//! Connection and pool configuration.

use core::{fmt, num::NonZeroUsize};

/// Connection details for the backing Postgres server.
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct DatabaseConnectionInfo {
    /// Database username.
    #[cfg_attr(
        feature = "clap",
        clap(long, default_value = "postgres", env = "TWIN_GRAPH_PG_USER", global = true)
    )]
    user: String,

    /// Database password for authentication.
    #[cfg_attr(
        feature = "clap",
        clap(long, default_value = "postgres", env = "TWIN_GRAPH_PG_PASSWORD", global = true)
    )]
    password: String,

    /// The host to connect to.
    #[cfg_attr(
        feature = "clap",
        clap(long, default_value = "localhost", env = "TWIN_GRAPH_PG_HOST", global = true)
    )]
    host: String,

    /// The port to connect to.
    #[cfg_attr(
        feature = "clap",
        clap(long, default_value = "5432", env = "TWIN_GRAPH_PG_PORT", global = true)
    )]
    port: u16,

    /// The database name to use.
    #[cfg_attr(
        feature = "clap",
        clap(long, default_value = "twins", env = "TWIN_GRAPH_PG_DATABASE", global = true)
    )]
    database: String,
}

impl DatabaseConnectionInfo {
    #[must_use]
    pub const fn new(user: String, password: String, host: String, port: u16, database: String) -> Self {
        Self { user, password, host, port, database }
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }
}

// the password stays out of logs
impl fmt::Debug for DatabaseConnectionInfo {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("DatabaseConnectionInfo")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for DatabaseConnectionInfo {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "postgres://{}:***@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

/// Pool sizing and the model-cache TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct DatabasePoolConfig {
    /// Maximum number of pooled connections.
    #[cfg_attr(
        feature = "clap",
        clap(long, default_value = "10", env = "TWIN_GRAPH_PG_MAX_CONNECTIONS", global = true)
    )]
    pub max_connections: NonZeroUsize,

    /// Model-cache time-to-live in seconds. Zero disables the cache.
    #[cfg_attr(
        feature = "clap",
        clap(long, default_value = "10", env = "TWIN_GRAPH_MODEL_CACHE_TTL", global = true)
    )]
    pub model_cache_ttl_seconds: u64,
}

impl Default for DatabasePoolConfig {
    fn default() -> Self {
        Self {
            max_connections: NonZeroUsize::new(10).unwrap_or(NonZeroUsize::MIN),
            model_cache_ttl_seconds: 10,
        }
    }
}
