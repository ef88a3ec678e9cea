//! Domain Layer - Core market data types and business logic.
//!
//! This layer contains the market data types, the top-of-book aggregator
//! and the subscription registry. Nothing here performs I/O.

/// Market data value types (quotes, BBO, trades).
pub mod market_data;

/// Subscription routing and fan-out.
pub mod subscription;

/// Best bid/offer reconstruction from book quotes.
pub mod top_of_book;
