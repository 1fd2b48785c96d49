//! Configuration module for the streaming feed core

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::codec::Exchange;
use crate::error::{FeedError, Result};
use crate::feed::Symbol;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Exchange whose wire protocol the connection speaks
    pub exchange: Exchange,

    /// Canonical symbols the binary streams (e.g. ["XBT-USD", "ETH-USD"])
    pub symbols: Vec<Symbol>,

    /// Public WebSocket endpoint
    pub ws_endpoint: String,

    /// Private (authenticated) WebSocket endpoint
    pub ws_auth_endpoint: String,

    /// REST API endpoint used for the auth token bootstrap
    pub rest_endpoint: String,

    /// Order book depth to subscribe to and maintain
    pub book_depth: u32,

    /// Reconnection settings
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,

    /// Silence on the socket before a keepalive ping is sent
    pub recv_timeout_secs: u64,

    /// Subscription confirmation wait
    pub subscription_timeout_ms: u64,
    pub confirmation_poll_ms: u64,

    /// How long a book delta waits for its paired spread observation
    pub spread_pairing_timeout_ms: u64,

    /// Bounded heartbeat queue size (oldest entries are evicted)
    pub heartbeat_queue_capacity: usize,

    /// Scheduler watcher sleep when nothing is pending
    pub scheduler_idle_ms: u64,

    /// Port for the health and metrics server
    pub health_port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an env file without touching the process environment
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self> {
        let vars = dotenvy::from_path_iter(path.as_ref())
            .map_err(|e| FeedError::Config(format!("Failed to read env file: {}", e)))?
            .collect::<std::result::Result<HashMap<String, String>, _>>()
            .map_err(|e| FeedError::Config(format!("Invalid env file entry: {}", e)))?;

        Self::from_lookup(|key| vars.get(key).cloned())
    }

    /// Build configuration from an arbitrary key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let symbols = match lookup("SYMBOLS") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| Symbol::new(s.to_uppercase()))
                .collect(),
            None => defaults.symbols.clone(),
        };

        Ok(Self {
            exchange: parse_or(&lookup, "EXCHANGE", defaults.exchange)?,
            symbols,
            ws_endpoint: lookup("WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            ws_auth_endpoint: lookup("WS_AUTH_ENDPOINT").unwrap_or(defaults.ws_auth_endpoint),
            rest_endpoint: lookup("REST_ENDPOINT").unwrap_or(defaults.rest_endpoint),
            book_depth: parse_or(&lookup, "BOOK_DEPTH", defaults.book_depth)?,
            reconnect_delay_ms: parse_or(&lookup, "RECONNECT_DELAY_MS", defaults.reconnect_delay_ms)?,
            max_reconnect_attempts: parse_or(
                &lookup,
                "MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            )?,
            recv_timeout_secs: parse_or(&lookup, "RECV_TIMEOUT_SECS", defaults.recv_timeout_secs)?,
            subscription_timeout_ms: parse_or(
                &lookup,
                "SUBSCRIPTION_TIMEOUT_MS",
                defaults.subscription_timeout_ms,
            )?,
            confirmation_poll_ms: parse_or(
                &lookup,
                "CONFIRMATION_POLL_MS",
                defaults.confirmation_poll_ms,
            )?,
            spread_pairing_timeout_ms: parse_or(
                &lookup,
                "SPREAD_PAIRING_TIMEOUT_MS",
                defaults.spread_pairing_timeout_ms,
            )?,
            heartbeat_queue_capacity: parse_or(
                &lookup,
                "HEARTBEAT_QUEUE_CAPACITY",
                defaults.heartbeat_queue_capacity,
            )?,
            scheduler_idle_ms: parse_or(&lookup, "SCHEDULER_IDLE_MS", defaults.scheduler_idle_ms)?,
            health_port: parse_or(&lookup, "HEALTH_PORT", defaults.health_port)?,
        })
    }

    /// Same configuration pointed at a different WebSocket endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.ws_endpoint = endpoint.into();
        self
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_secs(self.recv_timeout_secs)
    }

    pub fn subscription_timeout(&self) -> Duration {
        Duration::from_millis(self.subscription_timeout_ms)
    }

    pub fn confirmation_poll(&self) -> Duration {
        Duration::from_millis(self.confirmation_poll_ms)
    }

    pub fn spread_pairing_timeout(&self) -> Duration {
        Duration::from_millis(self.spread_pairing_timeout_ms)
    }

    pub fn scheduler_idle(&self) -> Duration {
        Duration::from_millis(self.scheduler_idle_ms)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| FeedError::Config(format!("{} = {:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: Exchange::Kraken,
            symbols: vec![Symbol::new("XBT-USD")],
            ws_endpoint: "wss://ws.kraken.com".to_string(),
            ws_auth_endpoint: "wss://ws-auth.kraken.com".to_string(),
            rest_endpoint: "https://api.kraken.com".to_string(),
            book_depth: 10,
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: 10,
            recv_timeout_secs: 45,
            subscription_timeout_ms: 5000,
            confirmation_poll_ms: 50,
            spread_pairing_timeout_ms: 2000,
            heartbeat_queue_capacity: 16,
            scheduler_idle_ms: 10,
            health_port: 9090,
        }
    }
}
