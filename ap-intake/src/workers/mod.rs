//! Queue-triggered and scheduled workers.
//!
//! Each `spawn` function is a long-running task meant to be handed to
//! `tokio::spawn` once at process start; they never return under
//! normal operation.

pub mod enricher;
pub mod ingest;
pub mod notification_worker;
pub mod notifier;
pub mod router;
pub mod subscription_manager;
pub mod timer_poller;
