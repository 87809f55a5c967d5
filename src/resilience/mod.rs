//! Retry and circuit breaking for calls to the identity provider.
//!
//! Only the metadata fetch goes over the network, so it is the only caller.
//! Request-path validation never touches these types unless it has to load
//! metadata lazily.

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use retry::{ResilientCallError, with_circuit_breaker_and_retry, with_retry};
