use std::time::Duration;

/// Allow specification covering the private ranges, the default for a
/// gateway that fronts a LAN.
pub const DEFAULT_ALLOW: &str = "192.168.0.0/16,10.0.0.0/8,172.16.0.0/12";

/// Size of the pooled buffers used for tunnel and body copies.
pub(crate) const COPY_BUF_SIZE: usize = 32 * 1024;

/// How much to read for a request or response header section before it is
/// considered invalid. 8KB should be plenty.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;

/// Immutable runtime configuration.
///
/// Built once at startup and shared by every component; no field changes
/// after [`crate::Proxy::new`] has consumed it.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Allowed client prefixes/addresses, comma-separated, or `*`.
    pub allow: String,
    /// Bound on upstream dial latency.
    pub connect_timeout: Duration,
    /// Inactivity bound for tunnel relays. Zero disables it.
    pub idle_timeout: Duration,
    /// Deadline for reading one request head off an idle connection.
    pub header_timeout: Duration,
    /// Inactivity bound for request/response bodies and upstream reads.
    pub body_timeout: Duration,
    /// Upstream connection pool bounds.
    pub pool: PoolConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            allow: DEFAULT_ALLOW.to_string(),
            connect_timeout: Duration::from_secs(15),
            idle_timeout: Duration::ZERO,
            header_timeout: Duration::from_secs(30),
            body_timeout: Duration::from_secs(30),
            pool: PoolConfig::default(),
        }
    }
}

/// Bounds for the idle upstream connection cache.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Total idle connections kept across all destinations.
    pub max_idle: usize,
    /// Idle connections kept per destination authority.
    pub max_idle_per_host: usize,
    /// How long a parked connection stays usable before it is discarded.
    pub idle_expiry: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 64,
            max_idle_per_host: 8,
            idle_expiry: Duration::from_secs(90),
        }
    }
}
