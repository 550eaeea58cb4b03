#![warn(missing_docs)]

//! Siphon replication engine: per-key ordered, concurrently scheduled
//! replication of object mutations with retry-driven outcome tracking.

pub mod auth;
pub mod consumer;
pub mod processor;
pub mod scheduler;
pub mod store;
pub mod task;

pub use consumer::{ChannelConsumer, ConsumerLoop, LogConsumer};
pub use processor::{Disposition, Processor, RawRecord};
pub use scheduler::KeyScheduler;
pub use task::ReplicationTask;
