//! Ambient building blocks shared by the coordinator and node binaries:
//! environment loading, tracing setup, and bounded queues.

pub mod env;
pub mod observability;
pub mod queue;

pub use env::{ConfigError, Environment};
pub use queue::{bounded_queue, PushOutcome, QueueConsumer, QueueProducer};
