//! Queue definitions and connection configuration
//!
//! A queue is described by a single descriptor string:
//!
//! ```text
//! queue://<stream>:<group>/?maxlen=<n>&maxretry=<n>&maxttl=<duration>[&deadletter=<stream>]
//! ```
//!
//! Durations use humantime syntax (`30s`, `5m`, `1h 30m`).

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::error::{QueueError, QueueResult};

pub const DEFAULT_MAX_LEN: usize = 10_000;
pub const DEFAULT_MAX_RETRY: u64 = 3;
pub const DEFAULT_MAX_TTL: Duration = Duration::from_secs(3600);

const SCHEME: &str = "queue://";

/// The unit of configuration a producer and its consumers agree on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub stream: String,
    pub group: String,
    /// Approximate cap on retained entries; `0` disables trimming
    pub max_len: usize,
    /// Delivery count at which a pending entry is evicted instead of reclaimed
    pub max_retry: u64,
    /// Minimum idle time before an exhausted entry is evicted
    pub max_ttl: Duration,
    /// Stream receiving a copy of every evicted entry
    pub dead_letter: Option<String>,
}

impl QueueDefinition {
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            max_len: DEFAULT_MAX_LEN,
            max_retry: DEFAULT_MAX_RETRY,
            max_ttl: DEFAULT_MAX_TTL,
            dead_letter: None,
        }
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn with_max_retry(mut self, max_retry: u64) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_max_ttl(mut self, max_ttl: Duration) -> Self {
        self.max_ttl = max_ttl;
        self
    }

    pub fn with_dead_letter(mut self, stream: impl Into<String>) -> Self {
        self.dead_letter = Some(stream.into());
        self
    }

    /// Trim bound passed to the log on append
    pub fn trim_len(&self) -> Option<usize> {
        (self.max_len > 0).then_some(self.max_len)
    }

    /// Parse a `queue://` descriptor
    pub fn parse(descriptor: &str) -> QueueResult<Self> {
        let invalid = |reason: &str| QueueError::InvalidDescriptor {
            descriptor: descriptor.to_string(),
            reason: reason.to_string(),
        };

        let rest = descriptor
            .strip_prefix(SCHEME)
            .ok_or_else(|| invalid("scheme must be queue://"))?;
        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, query),
            None => (rest, ""),
        };
        let location = location.trim_end_matches('/');
        let (stream, group) = location
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected <stream>:<group>"))?;
        if stream.is_empty() {
            return Err(invalid("stream name is empty"));
        }
        if group.is_empty() {
            return Err(invalid("group name is empty"));
        }

        let mut definition = Self::new(stream, group);
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "maxlen" => {
                    definition.max_len = value
                        .parse()
                        .map_err(|_| invalid(&format!("maxlen '{}' is not a number", value)))?;
                }
                "maxretry" => {
                    definition.max_retry = value
                        .parse()
                        .map_err(|_| invalid(&format!("maxretry '{}' is not a number", value)))?;
                }
                "maxttl" => {
                    definition.max_ttl = humantime::parse_duration(&value)
                        .map_err(|e| invalid(&format!("maxttl '{}': {}", value, e)))?;
                }
                "deadletter" if !value.is_empty() => {
                    definition.dead_letter = Some(value.into_owned());
                }
                other => return Err(invalid(&format!("unknown parameter '{}'", other))),
            }
        }

        if definition.max_retry == 0 {
            return Err(invalid("maxretry must be at least 1"));
        }
        Ok(definition)
    }
}

impl FromStr for QueueDefinition {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for QueueDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}:{}/?maxlen={}&maxretry={}&maxttl={}",
            SCHEME,
            self.stream,
            self.group,
            self.max_len,
            self.max_retry,
            humantime::format_duration(self.max_ttl).to_string().replace(' ', "")
        )?;
        if let Some(dead_letter) = &self.dead_letter {
            write!(f, "&deadletter={}", dead_letter)?;
        }
        Ok(())
    }
}

/// Connection endpoint whose password never appears in formatted output
#[derive(Clone, PartialEq, Eq)]
pub struct Dsn(String);

impl Dsn {
    const MASK: &'static str = "****";

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The unmasked endpoint, for handing to the client library only
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Endpoint with the password segment replaced
    pub fn masked(&self) -> String {
        if let Ok(mut url) = Url::parse(&self.0) {
            if url.password().is_some() && url.set_password(Some(Self::MASK)).is_ok() {
                return url.to_string();
            }
            if url.password().is_none() {
                return self.0.clone();
            }
        }
        mask_userinfo(&self.0)
    }
}

/// Fallback for strings the URL parser rejects
fn mask_userinfo(raw: &str) -> String {
    let Some((scheme, rest)) = raw.split_once("://") else {
        return raw.to_string();
    };
    let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(authority_end);
    match authority.rsplit_once('@') {
        Some((userinfo, host)) => match userinfo.split_once(':') {
            Some((user, _)) => format!("{}://{}:{}@{}{}", scheme, user, Dsn::MASK, host, tail),
            None => raw.to_string(),
        },
        None => raw.to_string(),
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl fmt::Debug for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Dsn").field(&self.masked()).finish()
    }
}

impl From<&str> for Dsn {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for Dsn {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

/// Redis connection configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: Dsn,
    /// Maximum number of connections in the pool
    pub pool_size: usize,
    /// Startup connection attempts before giving up
    pub connect_attempts: u32,
    /// Fixed pause between startup attempts
    pub retry_delay: Duration,
    /// Upper bound for one non-blocking command
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: Dsn::new("redis://localhost:6379"),
            pool_size: 16,
            connect_attempts: 5,
            retry_delay: Duration::from_secs(2),
            command_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisConfig {
    /// Create a new Redis configuration
    pub fn new(url: impl Into<Dsn>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `SCANQ_REDIS_URL`, `SCANQ_POOL_SIZE`,
    /// `SCANQ_CONNECT_ATTEMPTS` and `SCANQ_CONNECT_RETRY_DELAY`
    pub fn from_env() -> QueueResult<Self> {
        let mut config = Self::default();

        if let Ok(url) = env::var("SCANQ_REDIS_URL") {
            config.url = Dsn::new(url);
        }
        if let Ok(raw) = env::var("SCANQ_POOL_SIZE") {
            config.pool_size = raw.parse().map_err(|_| {
                QueueError::InvalidConfig(format!("SCANQ_POOL_SIZE '{}' is not a number", raw))
            })?;
        }
        if let Ok(raw) = env::var("SCANQ_CONNECT_ATTEMPTS") {
            config.connect_attempts = raw.parse().map_err(|_| {
                QueueError::InvalidConfig(format!(
                    "SCANQ_CONNECT_ATTEMPTS '{}' is not a number",
                    raw
                ))
            })?;
        }
        if let Ok(raw) = env::var("SCANQ_CONNECT_RETRY_DELAY") {
            config.retry_delay = humantime::parse_duration(&raw).map_err(|e| {
                QueueError::InvalidConfig(format!("SCANQ_CONNECT_RETRY_DELAY '{}': {}", raw, e))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the pool size
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set startup retry policy
    pub fn with_connect_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.connect_attempts = attempts;
        self.retry_delay = delay;
        self
    }

    /// Set command timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> QueueResult<()> {
        if self.url.expose().is_empty() {
            return Err(QueueError::InvalidConfig(
                "Redis URL cannot be empty".to_string(),
            ));
        }
        if self.pool_size == 0 {
            return Err(QueueError::InvalidConfig(
                "Pool size cannot be zero".to_string(),
            ));
        }
        if self.pool_size > 256 {
            return Err(QueueError::InvalidConfig(
                "Pool size too large (max 256)".to_string(),
            ));
        }
        if self.connect_attempts == 0 {
            return Err(QueueError::InvalidConfig(
                "At least one connection attempt is required".to_string(),
            ));
        }
        Ok(())
    }
}
