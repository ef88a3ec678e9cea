//! Feed Configuration Settings
//!
//! Configuration types for the feed multiplexer, loaded from environment
//! variables.

use std::time::Duration;

use crate::domain::market_data::Ticker;
use crate::domain::subscription::ConsumerKind;
use crate::infrastructure::aster::DEFAULT_WS_URL;
use crate::infrastructure::reconnect::ReconnectConfig;

/// Which consumer kinds to subscribe for every configured ticker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSelection {
    /// Best bid/offer.
    pub bbo: bool,
    /// Raw book quotes.
    pub book_quotes: bool,
    /// Time and sales.
    pub time_and_sales: bool,
}

impl Default for StreamSelection {
    fn default() -> Self {
        Self {
            bbo: true,
            book_quotes: false,
            time_and_sales: true,
        }
    }
}

impl StreamSelection {
    /// Parse a comma separated list of `bbo`, `book` and `trades`.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown entries or an empty list.
    pub fn parse(list: &str) -> Result<Self, ConfigError> {
        let mut selection = Self {
            bbo: false,
            book_quotes: false,
            time_and_sales: false,
        };

        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.to_lowercase().as_str() {
                "bbo" => selection.bbo = true,
                "book" => selection.book_quotes = true,
                "trades" => selection.time_and_sales = true,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "FEED_STREAMS".to_string(),
                        value: entry.to_string(),
                    });
                }
            }
        }

        if selection.kinds().is_empty() {
            return Err(ConfigError::EmptyValue("FEED_STREAMS".to_string()));
        }

        Ok(selection)
    }

    /// Selected consumer kinds.
    #[must_use]
    pub fn kinds(self) -> Vec<ConsumerKind> {
        [
            (self.bbo, ConsumerKind::Bbo),
            (self.book_quotes, ConsumerKind::BookQuote),
            (self.time_and_sales, ConsumerKind::TimeAndSale),
        ]
        .into_iter()
        .filter_map(|(enabled, kind)| enabled.then_some(kind))
        .collect()
    }
}

/// WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Upstream endpoint.
    pub url: String,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0,
        }
    }
}

impl WebSocketSettings {
    /// Backoff configuration for the supervisor.
    #[must_use]
    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: self.reconnect_delay_initial,
            max_delay: self.reconnect_delay_max,
            multiplier: self.reconnect_delay_multiplier,
            max_attempts: self.max_reconnect_attempts,
            ..ReconnectConfig::default()
        }
    }
}

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
    /// Queue capacity of each local consumer.
    pub consumer_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            health_port: 8083,
            consumer_capacity: 4096,
        }
    }
}

/// Complete feed configuration.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Tickers to subscribe.
    pub tickers: Vec<Ticker>,
    /// Consumer kinds per ticker.
    pub streams: StreamSelection,
    /// WebSocket connection settings.
    pub websocket: WebSocketSettings,
    /// Server settings.
    pub server: ServerSettings,
}

impl FeedConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or
    /// invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if required keys are missing or invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let symbols = lookup("FEED_SYMBOLS")
            .ok_or_else(|| ConfigError::MissingEnvVar("FEED_SYMBOLS".to_string()))?;

        let tickers: Vec<Ticker> = symbols
            .split(',')
            .map(str::trim)
            .filter(|symbol| !symbol.is_empty())
            .map(Ticker::new)
            .collect();

        if tickers.is_empty() {
            return Err(ConfigError::EmptyValue("FEED_SYMBOLS".to_string()));
        }

        let streams = match lookup("FEED_STREAMS") {
            Some(list) => StreamSelection::parse(&list)?,
            None => StreamSelection::default(),
        };

        let ws_defaults = WebSocketSettings::default();
        let websocket = WebSocketSettings {
            url: lookup("FEED_WS_URL")
                .filter(|url| !url.is_empty())
                .unwrap_or(ws_defaults.url),
            reconnect_delay_initial: parse_or(&lookup, "FEED_RECONNECT_DELAY_INITIAL_MS")
                .map_or(ws_defaults.reconnect_delay_initial, Duration::from_millis),
            reconnect_delay_max: parse_or(&lookup, "FEED_RECONNECT_DELAY_MAX_SECS")
                .map_or(ws_defaults.reconnect_delay_max, Duration::from_secs),
            reconnect_delay_multiplier: parse_or(&lookup, "FEED_RECONNECT_DELAY_MULTIPLIER")
                .unwrap_or(ws_defaults.reconnect_delay_multiplier),
            max_reconnect_attempts: parse_or(&lookup, "FEED_MAX_RECONNECT_ATTEMPTS")
                .unwrap_or(ws_defaults.max_reconnect_attempts),
        };

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            health_port: parse_or(&lookup, "FEED_HEALTH_PORT")
                .unwrap_or(server_defaults.health_port),
            consumer_capacity: parse_or(&lookup, "FEED_CONSUMER_CAPACITY")
                .filter(|capacity| *capacity > 0)
                .unwrap_or(server_defaults.consumer_capacity),
        };

        Ok(Self {
            tickers,
            streams,
            websocket,
            server,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unsupported value.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

/// Parse an optional value, treating unparseable input as absent.
fn parse_or<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|value| value.trim().parse().ok())
}
