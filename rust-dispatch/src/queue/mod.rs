//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - The static queue catalog
//! - Message types for work, dead-letter and unrouted queues
//! - A confirm-mode publisher with bounded retry
//!
//! ## Architecture
//!
//! ```text
//! Web Server → <product>_predictions / recommendations / ... → Worker
//!            ↘ unrouted_events             Worker failure → dead_letters
//! ```

pub mod publisher;
pub mod retry;
pub mod topology;
pub mod types;

pub use publisher::{JobSink, Publisher};
pub use retry::RetryPolicy;
pub use topology::{
    QueueDescriptor, QueueTopology, DEAD_LETTER_QUEUE, DEFAULT_CATALOG, UNROUTED_QUEUE,
};
pub use types::{derive_job_id, DeadLetter, DeadLetterCode, Job, UnroutedEvent};
