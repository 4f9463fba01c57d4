//! Forecast dispatch - payment confirmations in, forecast jobs out.
//!
//! This library provides shared modules for the three binaries:
//! - `forecast-web`: webhook receiver that turns payments into queued jobs
//! - `forecast-worker`: consumer that hands jobs to the forecast service
//! - `forecast-monitor`: one-shot queue depth report
//!
//! ## Architecture
//!
//! ```text
//! Provider → Web Server → normalize → dedupe → route → publish → *_predictions, ... → Worker
//!                                                  ↘ unrouted_events          ↘ dead_letters
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod idempotency;
pub mod monitor;
pub mod queue;
pub mod routing;
pub mod shutdown;
pub mod web;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use event::{normalize, PaymentEvent};
pub use idempotency::IdempotencyStore;
pub use queue::{Job, JobSink, Publisher, QueueTopology};
pub use routing::ProductRouter;
pub use shutdown::shutdown_signal;
pub use web::AppState;
