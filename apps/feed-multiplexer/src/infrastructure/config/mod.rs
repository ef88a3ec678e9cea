//! Configuration Module
//!
//! Configuration loading for the feed multiplexer service.

mod settings;

pub use settings::{ConfigError, FeedConfig, ServerSettings, StreamSelection, WebSocketSettings};
