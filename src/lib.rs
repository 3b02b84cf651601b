#![deny(unsafe_code)]

//! # stagepipe - a concurrent staged-processing pipeline facade
//!
//! This library runs user-supplied workers as a chain of concurrent stages
//! connected by bounded queues, behind a single configurable [`Pipeline`]
//! object. It grew out of frame-analysis pipelines (capture, pre-process,
//! detect, post-process, emit) but is generic over the item type flowing
//! through the stages.
//!
//! ## Overview
//!
//! - [`Pipeline`] — the facade: configure, register workers, run, and
//!   exchange items over the boundary queues.
//! - [`Worker`] — the stage contract: `process` transforms or consumes an
//!   item, `produce` generates items for sources. [`FnWorker`], [`FnSink`],
//!   and [`FnSource`] adapt closures.
//! - [`StageSlot`] — the five fixed positions a worker group can occupy:
//!   Input, PreProcessing, Detection, PostProcessing, Output.
//! - [`PipelineMode`] — who owns each end of the chain: the caller or the
//!   pipeline's own threads.
//! - [`BoundedQueue`] — the blocking/non-blocking MPMC queue between
//!   stages, also usable on its own.
//! - [`StageFactory`] — builds default worker groups for unregistered
//!   slots from the [`StageConfigs`] records.
//!
//! ## Threading model
//!
//! Each registered group runs on its own thread(s) by default; groups
//! registered with `on_new_thread = false` share the previous group's
//! thread, and [`Pipeline::disable_multi_threading`] collapses everything
//! onto one thread for deterministic debugging. Worker groups with several
//! members process items in parallel while the pipeline reimposes arrival
//! order on their output.
//!
//! ## Example
//!
//! ```
//! use stagepipe::{FnWorker, Pipeline, PipelineMode, StageSlot, worker_handle};
//!
//! let mut pipeline = Pipeline::new(PipelineMode::Synchronous);
//! pipeline.set_worker(
//!     StageSlot::PreProcessing,
//!     worker_handle(FnWorker::new(|x: i64| x + 1)),
//!     true,
//! );
//! pipeline.set_worker(
//!     StageSlot::Detection,
//!     worker_handle(FnWorker::new(|x: i64| x * 3)),
//!     true,
//! );
//!
//! pipeline.start().unwrap();
//! assert_eq!(pipeline.emplace_and_pop(4), Some(15));
//! pipeline.stop().unwrap();
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod graph;
pub mod manager;
pub mod queue;
pub mod reorder;
pub mod slot;
pub mod worker;
pub mod wrapper;

pub use batch::FrameBatch;
pub use config::{
    ExtraConfig, FaceConfig, HandConfig, InputConfig, NoBuiltinStages, OutputConfig, PoseConfig,
    StageConfigs, StageFactory, StageFactoryHandle,
};
pub use error::{PipelineError, Result};
pub use graph::BuildRequest;
pub use manager::{PipelineMode, ThreadManager};
pub use queue::BoundedQueue;
pub use reorder::ReorderBuffer;
pub use slot::{StageSlot, WorkerRegistry};
pub use worker::{worker_handle, FnFilter, FnSink, FnSource, FnWorker, Worker, WorkerHandle};
pub use wrapper::{Pipeline, DEFAULT_QUEUE_CAPACITY};
