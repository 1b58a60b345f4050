//! Circuit breaking per pool key.
//!
//! Every physical operation runs through the breaker of its pool key. While a
//! breaker is open, calls fail fast with [`crate::Error::CircuitOpen`] before
//! any connection is acquired.

mod breaker;
mod manager;
mod window;

pub use breaker::{BreakerConfig, CallPermit, CircuitBreaker, CircuitState};
pub use manager::CircuitBreakerManager;
pub use window::WindowCounts;
