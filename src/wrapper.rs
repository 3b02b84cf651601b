//! The user-facing pipeline facade.
//!
//! [`Pipeline`] bundles configuration records, worker registrations, and a
//! [`ThreadManager`] behind one object. Configuration happens through
//! `&mut self` before a run; lifecycle and boundary calls take `&self`, so
//! a `Pipeline` shared behind an `Arc` can be stopped or fed from any
//! thread.
//!
//! Registering a worker transfers ownership of the matching pipeline end:
//! once an Input group exists the caller may no longer emplace, and once an
//! Output group exists the caller may no longer pop. Violations are logged
//! and refused, never silently absorbed.

use std::sync::Arc;

use crate::batch::FrameBatch;
use crate::config::{
    ExtraConfig, FaceConfig, HandConfig, InputConfig, NoBuiltinStages, OutputConfig,
    StageConfigs, StageFactoryHandle,
};
use crate::error::{PipelineError, Result};
use crate::graph::BuildRequest;
use crate::manager::{PipelineMode, ThreadManager};
use crate::slot::{StageSlot, WorkerRegistry};
use crate::worker::WorkerHandle;

/// Capacity of every boundary and inter-stage queue unless tuned.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// A configurable staged-processing pipeline.
///
/// The type parameter is the item flowing through every stage; for
/// frame-oriented processing this is typically [`FrameBatch<F>`].
///
/// Dropping a `Pipeline` stops any active run and joins its threads.
///
/// # Example
///
/// ```
/// use stagepipe::{Pipeline, PipelineMode, StageSlot, FnWorker, worker_handle};
///
/// let mut pipeline = Pipeline::new(PipelineMode::Synchronous);
/// pipeline.set_worker(StageSlot::Detection, worker_handle(FnWorker::new(|x: i32| x * 2)), true);
/// pipeline.start().unwrap();
/// assert_eq!(pipeline.emplace_and_pop(21), Some(42));
/// pipeline.stop().unwrap();
/// ```
pub struct Pipeline<T> {
    manager: ThreadManager<T>,
    registry: WorkerRegistry<T>,
    configs: StageConfigs,
    factory: StageFactoryHandle<T>,
    multi_threaded: bool,
    queue_capacity: usize,
}

impl<T: Send + 'static> Pipeline<T> {
    /// Create a pipeline with no built-in stages: only registered workers
    /// (and the graph wiring around them) will run.
    #[must_use]
    pub fn new(mode: PipelineMode) -> Self {
        Self::with_factory(mode, Arc::new(NoBuiltinStages))
    }

    /// Create a pipeline whose unregistered slots are filled by `factory`
    /// according to the configuration records at build time.
    #[must_use]
    pub fn with_factory(mode: PipelineMode, factory: StageFactoryHandle<T>) -> Self {
        Self {
            manager: ThreadManager::new(mode),
            registry: WorkerRegistry::new(),
            configs: StageConfigs::default(),
            factory,
            multi_threaded: true,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// The thread-ownership mode this pipeline was created with.
    #[must_use]
    pub fn mode(&self) -> PipelineMode {
        self.manager.mode()
    }

    /// Replace all configuration records at once.
    pub fn configure(&mut self, configs: StageConfigs) {
        self.configs = configs;
    }

    /// Replace the face configuration record.
    pub fn configure_face(&mut self, face: FaceConfig) {
        self.configs.face = face;
    }

    /// Replace the hand configuration record.
    pub fn configure_hand(&mut self, hand: HandConfig) {
        self.configs.hand = hand;
    }

    /// Replace the extra-processing configuration record.
    pub fn configure_extra(&mut self, extra: ExtraConfig) {
        self.configs.extra = extra;
    }

    /// Replace the input configuration record.
    pub fn configure_input(&mut self, input: InputConfig) {
        self.configs.input = input;
    }

    /// Replace the output configuration record.
    pub fn configure_output(&mut self, output: OutputConfig) {
        self.configs.output = output;
    }

    /// Current configuration records.
    #[must_use]
    pub fn configs(&self) -> &StageConfigs {
        &self.configs
    }

    /// Register a single worker for `slot`, replacing any previous group
    /// and claiming the matching pipeline end when the slot is a boundary.
    pub fn set_worker(&mut self, slot: StageSlot, worker: WorkerHandle<T>, on_new_thread: bool) {
        self.registry.register(slot, vec![worker], on_new_thread);
    }

    /// Register a worker group for `slot`; group size is the group's thread
    /// count. An empty group is a contract violation and leaves the
    /// registry untouched.
    pub fn set_worker_group(
        &mut self,
        slot: StageSlot,
        workers: Vec<WorkerHandle<T>>,
        on_new_thread: bool,
    ) -> Result<()> {
        if workers.is_empty() {
            log::error!("set_worker_group: empty worker group for slot {slot:?}");
            return Err(PipelineError::EmptyWorkerGroup { operation: "set_worker_group", slot });
        }
        self.registry.register(slot, workers, on_new_thread);
        Ok(())
    }

    /// Number of workers currently registered for `slot`.
    #[must_use]
    pub fn worker_count(&self, slot: StageSlot) -> usize {
        self.registry.group_size(slot)
    }

    /// Run every task on the calling thread. Consulted at the next build;
    /// useful for debugging nondeterministic stage interactions.
    pub fn disable_multi_threading(&mut self) {
        self.multi_threaded = false;
    }

    /// Tune the capacity used for every queue at the next build.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn set_queue_capacity(&mut self, capacity: usize) {
        assert!(capacity > 0, "queue capacity must be positive");
        self.queue_capacity = capacity;
    }

    /// Build from the current state and run, blocking the calling thread as
    /// one of the pipeline's workers until the run stops, completes, or
    /// faults. Fails immediately when a run is already active.
    pub fn exec(&self) -> Result<()> {
        self.manager.exec(self.build_request())
    }

    /// Build from the current state and run on background threads only,
    /// returning immediately. Fails when a run is already active.
    pub fn start(&self) -> Result<()> {
        self.manager.start(self.build_request())
    }

    /// Stop the active run, join its threads, and discard queued items.
    /// Idempotent; returns the first fault recorded during the run.
    pub fn stop(&self) -> Result<()> {
        self.manager.stop()
    }

    /// Whether a run is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.manager.is_running()
    }

    /// Offer an item to the input end without blocking. The item comes
    /// back whenever the pipeline refuses it: full queue, not running, or
    /// an input end the caller does not control.
    pub fn try_emplace(&self, item: T) -> std::result::Result<(), T> {
        if !self.input_allowed("try_emplace") {
            return Err(item);
        }
        self.manager.try_emplace(item)
    }

    /// Offer an item to the input end, blocking while the queue is full.
    /// The item comes back when the run stops or the end is not
    /// caller-controlled.
    pub fn wait_and_emplace(&self, item: T) -> std::result::Result<(), T> {
        if !self.input_allowed("wait_and_emplace") {
            return Err(item);
        }
        self.manager.wait_and_emplace(item)
    }

    /// Copy-in variant of [`try_emplace`](Self::try_emplace).
    pub fn try_push(&self, item: &T) -> bool
    where
        T: Clone,
    {
        self.input_allowed("try_push") && self.manager.try_push(item)
    }

    /// Copy-in variant of [`wait_and_emplace`](Self::wait_and_emplace).
    pub fn wait_and_push(&self, item: &T) -> bool
    where
        T: Clone,
    {
        self.input_allowed("wait_and_push") && self.manager.wait_and_push(item)
    }

    /// Take the next result from the output end without blocking.
    pub fn try_pop(&self) -> Option<T> {
        if !self.output_allowed("try_pop") {
            return None;
        }
        self.manager.try_pop()
    }

    /// Take the next result from the output end, blocking while the queue
    /// is empty. Returns `None` once the run stops.
    pub fn wait_and_pop(&self) -> Option<T> {
        if !self.output_allowed("wait_and_pop") {
            return None;
        }
        self.manager.wait_and_pop()
    }

    /// Feed one item and block for one result: blocking emplace followed by
    /// blocking pop. `None` when either end is not caller-controlled or the
    /// run stops first.
    ///
    /// With concurrent boundary users the popped item is not necessarily
    /// the one emplaced; with a single boundary user FIFO ordering makes
    /// it so.
    pub fn emplace_and_pop(&self, item: T) -> Option<T> {
        if !self.input_allowed("emplace_and_pop") || !self.output_allowed("emplace_and_pop") {
            return None;
        }
        match self.manager.wait_and_emplace(item) {
            Ok(()) => self.manager.wait_and_pop(),
            Err(_) => None,
        }
    }

    fn build_request(&self) -> BuildRequest<T> {
        BuildRequest {
            mode: self.manager.mode(),
            multi_threaded: self.multi_threaded,
            queue_capacity: self.queue_capacity,
            configs: self.configs.clone(),
            registry: self.registry.clone(),
            factory: Arc::clone(&self.factory),
        }
    }

    fn input_allowed(&self, operation: &'static str) -> bool {
        if self.registry.is_occupied(StageSlot::Input) {
            log::error!("{operation}: input end is owned by the registered Input worker group");
            return false;
        }
        true
    }

    fn output_allowed(&self, operation: &'static str) -> bool {
        if self.registry.is_occupied(StageSlot::Output) {
            log::error!("{operation}: output end is owned by the registered Output worker group");
            return false;
        }
        true
    }
}

impl<F: Send + 'static> Pipeline<FrameBatch<F>> {
    /// Feed a single frame and block for its processed batch: the frame is
    /// wrapped in a one-item batch and run through
    /// [`emplace_and_pop`](Self::emplace_and_pop).
    pub fn process_frame(&self, frame: F) -> Option<FrameBatch<F>> {
        self.emplace_and_pop(FrameBatch::from_frame(frame))
    }
}
