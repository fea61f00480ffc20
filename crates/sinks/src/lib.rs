//! Concrete sink implementations and the generic batching loop they all
//! share. Every sink is [`engine::SinkEngine`] wrapping a [`transport::Transport`];
//! accumulation, retry, the circuit breaker, and dead-letter handoff live
//! once in the engine, not once per wire format.
mod circuit;
pub mod engine;
pub mod http_stream;
pub mod local_file;
pub mod message_bus;
mod metrics;
pub mod transport;

pub use circuit::CircuitBreaker;
pub use engine::SinkEngine;
pub use transport::{
    Transport,
    TransportError,
};
