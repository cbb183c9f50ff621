//! # kaizen-jobs
//!
//! Task orchestration for kaizen.
//!
//! This crate provides:
//! - The task catalogue and its handlers
//! - Dispatch, guarded dispatch and multi-stage pipelines over durable barriers
//! - A concurrent worker with a bounded retry policy
//! - An inline runner for executing a single task from the command line
//!
//! ## Example
//!
//! ```ignore
//! use kaizen_jobs::{TaskEnv, TaskHandler, WorkerBuilder, WorkerConfig};
//!
//! let env = Arc::new(TaskEnv::new(engine, dispatcher));
//! let worker = WorkerBuilder::new(jobs)
//!     .with_config(WorkerConfig::from_env())
//!     .with_handlers(TaskHandler::all(env))
//!     .build()
//!     .await;
//!
//! let handle = worker.start();
//! handle.shutdown().await?;
//! ```

pub mod dispatcher;
pub mod handler;
pub mod retry;
pub mod runner;
pub mod tasks;
pub mod worker;

pub use dispatcher::{Dispatcher, Pipeline};
pub use handler::{JobContext, JobHandler, JobResult};
pub use retry::{RetryDecision, RetryPolicy};
pub use runner::InlineRunner;
pub use tasks::{run_task, TaskEnv, TaskHandler};
pub use worker::{JobWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};
