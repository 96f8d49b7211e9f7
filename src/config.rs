use std::{str::FromStr, time::Duration};

use anyhow::{Context, bail};

use crate::store::HistoryLimits;

/// Per-connection limits and deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Outbound envelopes buffered per connection before it counts as a slow consumer.
    pub mailbox_capacity: usize,
    pub max_frame_bytes: usize,
    /// Silence allowed from the client, refreshed by every frame including pongs.
    pub read_timeout: Duration,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    /// Deadline for each session, membership or persistence call.
    pub store_timeout: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            mailbox_capacity: 16,
            max_frame_bytes: 4096,
            read_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            store_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub session_cookie: String,
    pub connection: ConnectionLimits,
    pub history: HistoryLimits,
}

impl Config {
    /// Reads configuration from the environment, loading `.env` first if present.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let defaults = ConnectionLimits::default();
        let history = HistoryLimits::default();

        let config = Self {
            bind_addr: var_or("BIND_ADDR", "0.0.0.0:8080"),
            database_url: dotenv::var("DATABASE_URL").context("DATABASE_URL not set")?,
            session_cookie: var_or("SESSION_COOKIE", "session"),
            connection: ConnectionLimits {
                mailbox_capacity: parse_var("MAILBOX_CAPACITY", defaults.mailbox_capacity)?,
                max_frame_bytes: parse_var("MAX_FRAME_BYTES", defaults.max_frame_bytes)?,
                read_timeout: secs_var("READ_TIMEOUT_SECS", defaults.read_timeout)?,
                ping_interval: secs_var("PING_INTERVAL_SECS", defaults.ping_interval)?,
                write_timeout: secs_var("WRITE_TIMEOUT_SECS", defaults.write_timeout)?,
                store_timeout: secs_var("STORE_TIMEOUT_SECS", defaults.store_timeout)?,
            },
            history: HistoryLimits {
                default_limit: parse_var("HISTORY_DEFAULT_LIMIT", history.default_limit)?,
                max_limit: parse_var("HISTORY_MAX_LIMIT", history.max_limit)?,
            },
        };
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let limits = &self.connection;
        if limits.mailbox_capacity == 0 {
            bail!("MAILBOX_CAPACITY must be at least 1");
        }
        if limits.ping_interval.is_zero() || limits.ping_interval >= limits.read_timeout {
            bail!(
                "PING_INTERVAL_SECS ({:?}) must be > 0 and < READ_TIMEOUT_SECS ({:?})",
                limits.ping_interval,
                limits.read_timeout
            );
        }
        if self.history.max_limit == 0 {
            bail!("HISTORY_MAX_LIMIT must be at least 1");
        }
        Ok(())
    }
}

fn var_or(key: &str, fallback: &str) -> String {
    dotenv::var(key)
        .ok()
        .filter(|x| !x.trim().is_empty())
        .unwrap_or_else(|| fallback.to_owned())
}

fn parse_var<T>(key: &str, fallback: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match dotenv::var(key).ok().filter(|x| !x.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: {raw:?}")),
        None => Ok(fallback),
    }
}

fn secs_var(key: &str, fallback: Duration) -> anyhow::Result<Duration> {
    parse_var(key, fallback.as_secs()).map(Duration::from_secs)
}
