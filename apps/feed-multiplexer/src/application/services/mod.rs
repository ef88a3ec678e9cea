//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `FeedMultiplexer`: Owns the upstream connection, routes subscriptions
//!   and runs the receive loop

mod multiplexer;

pub use multiplexer::{
    FeedMultiplexer, LifecycleState, LoopExit, LoopExitReason, MultiplexerError,
    ReceiveLoopState,
};
