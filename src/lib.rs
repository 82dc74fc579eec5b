//! # Test Tracking System
//!
//! A QA test tracking backend: test suites, cases, runs and results, with
//! bulk result imports processed by a background worker pool and progress
//! pushed to clients over WebSockets.
//!
//! ## Features
//!
//! - **Background imports**: uploads return a task id immediately; a fixed
//!   pool of workers parses and persists the data off the request path
//! - **Task tracking**: every task moves `pending -> running ->
//!   completed|failed` and can be polled by id
//! - **Live notifications**: per-client history plus best-effort WebSocket
//!   delivery of progress, error and completion events
//! - **REST API**: upload, task status, run status and notification
//!   endpoints
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use test_tracking_system_rs::server::{routes, AppContext};
//! use test_tracking_system_rs::store::{MemoryStore, TestDataStore};
//! use test_tracking_system_rs::{NotificationHub, TaskQueue};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let queue = Arc::new(TaskQueue::new());
//!     queue.start(3).await?;
//!
//!     let store: Arc<dyn TestDataStore> = Arc::new(MemoryStore::new());
//!     let ctx = AppContext {
//!         queue,
//!         hub: Arc::new(NotificationHub::new()),
//!         store,
//!     };
//!     warp::serve(routes(ctx)).run(([127, 0, 0, 1], 8000)).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **TaskQueue**: worker pool draining a shared queue, task record table
//! - **NotificationHub**: per-client connections and notification history
//! - **ImportPipeline**: parses uploads and materializes suites, cases and
//!   result rows
//! - **TestDataStore**: persistence seam (in-memory implementation included)
//! - **Server**: warp HTTP + WebSocket surface

pub mod import;
pub mod notifications;
pub mod queue;
pub mod server;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use import::{ImportPipeline, ImportSummary};
pub use notifications::NotificationHub;
pub use queue::TaskQueue;
pub use server::AppContext;
pub use store::{MemoryStore, TestDataStore};
pub use types::*;

/// Result type alias for system operations
pub type SystemResult<T> = Result<T, SystemError>;
