//! Thread lifecycle and the pipeline run loop.
//!
//! [`ThreadManager`] owns a run: it builds the stage graph from a
//! [`BuildRequest`], spawns one worker thread per plan, steps tasks with
//! non-blocking queue operations, and tears everything down on stop, on an
//! internal fault, or on natural completion.
//!
//! # Scheduling
//!
//! Worker threads never block on queues. Each thread round-robins over its
//! task plan; a task that finds its input empty or its output full simply
//! reports no progress, and a thread whose whole plan made no progress
//! sleeps with exponential backoff (10us doubling to 1ms) before retrying.
//! This keeps `stop` responsive no matter where the chain has stalled.
//!
//! # Natural completion
//!
//! Completion cascades forward through the graph. A source finishes when
//! `produce` returns `None` and its last item has been accepted downstream.
//! A queue is settled once every task producing into it has finished; a
//! consuming task finishes when its input is settled, empty, and any
//! reassembly state has been flushed. When the last task finishes the run
//! ends, except that a tail queue read by the caller is left for them to
//! drain first.
//!
//! # Faults
//!
//! A panic inside a worker is caught at the thread boundary, converted to
//! [`PipelineError::WorkerPanicked`], and recorded first-error-wins; every
//! other thread then winds down. The error is surfaced by whichever of
//! `exec`/`stop` next observes it.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::graph::{
    build_graph, BuildRequest, DrainTask, SourceTask, StageReorder, StageTask, TransformTask,
    EXTERNAL_PRODUCER,
};
use crate::queue::BoundedQueue;

/// Minimum idle backoff between scheduling attempts.
const MIN_BACKOFF_US: u64 = 10;
/// Maximum idle backoff between scheduling attempts.
const MAX_BACKOFF_US: u64 = 1_000;

/// Who owns each end of the pipeline, fixed for the facade's lifetime.
///
/// "In" and "Out" name the end the caller keeps: `AsynchronousIn` hands the
/// caller the input end, `AsynchronousOut` the output end, `Asynchronous`
/// both. Under `Synchronous` ownership follows worker registration alone:
/// an end is caller-operable exactly while no worker occupies its slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineMode {
    /// No end is reserved for the caller; registered workers decide.
    #[default]
    Synchronous,
    /// The caller feeds input; consumption stays pipeline-internal.
    AsynchronousIn,
    /// Production stays pipeline-internal; the caller reads output.
    AsynchronousOut,
    /// The caller feeds input and reads output.
    Asynchronous,
}

impl PipelineMode {
    /// Whether the input end is reserved for the pipeline itself.
    pub(crate) fn input_is_internal(self) -> bool {
        matches!(self, PipelineMode::AsynchronousOut)
    }

    /// Whether the output end is reserved for the pipeline itself.
    pub(crate) fn output_is_internal(self) -> bool {
        matches!(self, PipelineMode::AsynchronousIn)
    }
}

/// Run lifecycle; transitions are Idle -> Running -> Stopped, then back to
/// Running on the next `exec`/`start` (each run builds fresh state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RunState {
    Idle = 0,
    Running = 1,
    Stopped = 2,
}

impl RunState {
    fn from_u8(value: u8) -> RunState {
        match value {
            1 => RunState::Running,
            2 => RunState::Stopped,
            _ => RunState::Idle,
        }
    }
}

/// Outcome of stepping one task once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepResult {
    /// The task moved an item (or part of one) forward.
    Progress,
    /// Nothing to do right now: input empty, output full, or already done.
    Idle,
    /// The task just finished for good.
    Finished,
}

/// State shared between worker threads and the manager for one run.
struct PipelineShared<T> {
    state: AtomicU8,
    stop_requested: AtomicBool,
    error_flag: AtomicBool,
    error: Mutex<Option<PipelineError>>,
    queues: Vec<Arc<BoundedQueue<T>>>,
    /// Producer-task count per queue; zero means the queue is settled.
    producers: Vec<AtomicUsize>,
    /// Unfinished tasks across all plans; zero triggers natural completion.
    tasks_remaining: AtomicUsize,
    /// Set when all tasks finished but the caller still owns tail items.
    draining: AtomicBool,
    first_queue: usize,
    last_queue: usize,
    tail_caller_controlled: bool,
}

impl<T> PipelineShared<T> {
    fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn should_exit(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
            || self.error_flag.load(Ordering::SeqCst)
            || self.state() != RunState::Running
    }

    fn first(&self) -> &Arc<BoundedQueue<T>> {
        &self.queues[self.first_queue]
    }

    fn last(&self) -> &Arc<BoundedQueue<T>> {
        &self.queues[self.last_queue]
    }

    /// Whether every producer into `queue` has finished.
    fn settled(&self, queue: usize) -> bool {
        self.producers[queue].load(Ordering::SeqCst) == 0
    }

    fn producer_finished(&self, queue: usize) {
        let previous = self.producers[queue].fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous != 0 && previous != EXTERNAL_PRODUCER);
    }

    /// Record that one task finished; the last one ends the run, unless the
    /// tail queue belongs to the caller and still holds items for them.
    fn task_finished(&self) {
        if self.tasks_remaining.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        if self.tail_caller_controlled && !self.last().is_empty() {
            self.draining.store(true, Ordering::SeqCst);
            // the caller may have emptied the tail before the flag was set
            if self.last().is_empty() {
                self.finish_natural();
            }
        } else {
            self.finish_natural();
        }
    }

    /// Called after every caller-side pop; completes a draining run once
    /// the tail queue empties.
    fn note_pop(&self) {
        if self.draining.load(Ordering::SeqCst) && self.last().is_empty() {
            self.finish_natural();
        }
    }

    fn finish_natural(&self) {
        let swapped = self.state.compare_exchange(
            RunState::Running as u8,
            RunState::Stopped as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if swapped.is_ok() {
            log::debug!("pipeline run completed naturally");
            for queue in &self.queues {
                queue.close();
            }
        }
    }

    /// Force the run into Stopped and wake everything that blocks.
    fn shutdown(&self) {
        self.state.store(RunState::Stopped as u8, Ordering::SeqCst);
        for queue in &self.queues {
            queue.close();
        }
    }

    /// Record a fault, first error wins, and wind the run down.
    fn set_error(&self, error: PipelineError) {
        {
            let mut slot = self.error.lock();
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.error_flag.store(true, Ordering::SeqCst);
        self.shutdown();
    }

    fn take_error(&self) -> Option<PipelineError> {
        self.error.lock().take()
    }
}

struct ManagerInner<T> {
    shared: Option<Arc<PipelineShared<T>>>,
    handles: Vec<JoinHandle<()>>,
}

/// Builds, runs, and tears down pipeline threads.
///
/// All methods take `&self`; a `ThreadManager` shared behind an `Arc` can
/// be stopped from any thread while another blocks in [`exec`].
///
/// [`exec`]: ThreadManager::exec
pub struct ThreadManager<T> {
    mode: PipelineMode,
    inner: Mutex<ManagerInner<T>>,
}

impl<T> ThreadManager<T> {
    /// Create a manager in `mode` with no active run.
    #[must_use]
    pub fn new(mode: PipelineMode) -> Self {
        Self { mode, inner: Mutex::new(ManagerInner { shared: None, handles: Vec::new() }) }
    }

    /// The thread-ownership mode this manager was created with.
    #[must_use]
    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    /// Whether a run is active (including one draining its tail queue).
    #[must_use]
    pub fn is_running(&self) -> bool {
        let inner = self.inner.lock();
        inner.shared.as_ref().is_some_and(|shared| shared.state() == RunState::Running)
    }

    /// Stop the active run, join its threads, and discard queued items.
    ///
    /// Idempotent: stopping an idle or already-stopped pipeline is a no-op.
    /// Returns the first fault recorded by a worker thread, if any.
    pub fn stop(&self) -> Result<()> {
        let (shared, handles) = {
            let mut inner = self.inner.lock();
            let Some(shared) = inner.shared.clone() else {
                return Ok(());
            };
            shared.stop_requested.store(true, Ordering::SeqCst);
            shared.shutdown();
            (shared, inner.handles.drain(..).collect::<Vec<_>>())
        };
        // join outside the lock so a concurrent `exec` can finish
        for handle in handles {
            let _ = handle.join();
        }
        for queue in &shared.queues {
            queue.clear();
        }
        log::debug!("pipeline stopped");
        match shared.take_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Shared state of the active run, or `None` outside Running.
    fn running_shared(&self) -> Option<Arc<PipelineShared<T>>> {
        let inner = self.inner.lock();
        let shared = inner.shared.as_ref()?;
        (shared.state() == RunState::Running).then(|| Arc::clone(shared))
    }
}

impl<T: Send + 'static> ThreadManager<T> {
    /// Build the graph and run it on the calling thread plus one thread per
    /// remaining plan. Blocks until the run stops, completes naturally, or
    /// faults; queued leftovers survive into the Stopped state only on an
    /// explicit `stop`.
    pub fn exec(&self, request: BuildRequest<T>) -> Result<()> {
        let (shared, plan0) = self.launch(request, "exec", true)?;
        run_plan(&shared, 0, plan0);
        self.finish(&shared)
    }

    /// Build the graph and run every plan on its own thread, returning
    /// immediately. Faults surface through the next `stop`.
    pub fn start(&self, request: BuildRequest<T>) -> Result<()> {
        self.launch(request, "start", false)?;
        Ok(())
    }

    fn launch(
        &self,
        request: BuildRequest<T>,
        operation: &'static str,
        hold_first_plan: bool,
    ) -> Result<(Arc<PipelineShared<T>>, Vec<StageTask<T>>)> {
        let mut inner = self.inner.lock();
        if inner.shared.as_ref().is_some_and(|shared| shared.state() == RunState::Running) {
            log::error!("{operation}: pipeline is already running");
            return Err(PipelineError::AlreadyRunning { operation });
        }
        // reap threads left over from a naturally completed run
        for handle in inner.handles.drain(..) {
            let _ = handle.join();
        }

        let graph = build_graph(&request);
        let task_count: usize = graph.plans.iter().map(Vec::len).sum();
        let shared = Arc::new(PipelineShared {
            state: AtomicU8::new(RunState::Running as u8),
            stop_requested: AtomicBool::new(false),
            error_flag: AtomicBool::new(false),
            error: Mutex::new(None),
            queues: graph.queues,
            producers: graph.producer_counts.into_iter().map(AtomicUsize::new).collect(),
            tasks_remaining: AtomicUsize::new(task_count),
            draining: AtomicBool::new(false),
            first_queue: graph.first_queue,
            last_queue: graph.last_queue,
            tail_caller_controlled: graph.tail_caller_controlled,
        });

        let mut plans = graph.plans;
        let plan0 =
            if hold_first_plan && !plans.is_empty() { plans.remove(0) } else { Vec::new() };
        inner.shared = Some(Arc::clone(&shared));
        let base = usize::from(hold_first_plan);
        for (offset, plan) in plans.into_iter().enumerate() {
            let thread_id = base + offset;
            let thread_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("pipeline-worker-{thread_id}"))
                .spawn(move || run_plan(&thread_shared, thread_id, plan));
            match spawned {
                Ok(handle) => inner.handles.push(handle),
                Err(e) => {
                    // already-spawned threads wind down via the recorded error
                    let message = format!("failed to spawn worker thread: {e}");
                    log::error!("{message}");
                    shared.set_error(PipelineError::WorkerPanicked {
                        thread_id,
                        message: message.clone(),
                    });
                    return Err(PipelineError::WorkerPanicked { thread_id, message });
                }
            }
        }
        log::info!(
            "pipeline {operation}: {} worker thread(s) spawned",
            inner.handles.len()
        );
        Ok((shared, plan0))
    }

    /// Join the remaining threads of an `exec` run and surface its outcome.
    fn finish(&self, shared: &Arc<PipelineShared<T>>) -> Result<()> {
        let handles: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.handles.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
        // a caller-owned tail queue keeps the run alive until drained
        while shared.state() == RunState::Running {
            thread::sleep(Duration::from_micros(MAX_BACKOFF_US));
        }
        shared.shutdown();
        match shared.take_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Offer an item to the input end without blocking. The item comes back
    /// when the pipeline refuses it: full queue, not running, or an input
    /// end the mode keeps internal.
    pub fn try_emplace(&self, item: T) -> std::result::Result<(), T> {
        if self.mode.input_is_internal() {
            log::error!("try_emplace: input end is pipeline-internal in {:?} mode", self.mode);
            return Err(item);
        }
        match self.running_shared() {
            Some(shared) => shared.first().try_push(item),
            None => Err(item),
        }
    }

    /// Offer an item to the input end, blocking while the queue is full.
    /// The item comes back when the run stops (or was never running).
    pub fn wait_and_emplace(&self, item: T) -> std::result::Result<(), T> {
        if self.mode.input_is_internal() {
            log::error!("wait_and_emplace: input end is pipeline-internal in {:?} mode", self.mode);
            return Err(item);
        }
        match self.running_shared() {
            Some(shared) => shared.first().wait_push(item),
            None => Err(item),
        }
    }

    /// Copy-in variant of [`try_emplace`](Self::try_emplace).
    pub fn try_push(&self, item: &T) -> bool
    where
        T: Clone,
    {
        self.try_emplace(item.clone()).is_ok()
    }

    /// Copy-in variant of [`wait_and_emplace`](Self::wait_and_emplace).
    pub fn wait_and_push(&self, item: &T) -> bool
    where
        T: Clone,
    {
        self.wait_and_emplace(item.clone()).is_ok()
    }

    /// Take the next result from the output end without blocking.
    pub fn try_pop(&self) -> Option<T> {
        if self.mode.output_is_internal() {
            log::error!("try_pop: output end is pipeline-internal in {:?} mode", self.mode);
            return None;
        }
        let shared = self.running_shared()?;
        let item = shared.last().try_pop();
        if item.is_some() {
            shared.note_pop();
        }
        item
    }

    /// Take the next result from the output end, blocking while the queue
    /// is empty. Returns `None` once the run stops.
    pub fn wait_and_pop(&self) -> Option<T> {
        if self.mode.output_is_internal() {
            log::error!("wait_and_pop: output end is pipeline-internal in {:?} mode", self.mode);
            return None;
        }
        let shared = self.running_shared()?;
        let item = shared.last().wait_pop();
        if item.is_some() {
            shared.note_pop();
        }
        item
    }
}

impl<T> Drop for ThreadManager<T> {
    fn drop(&mut self) {
        if let Err(error) = self.stop() {
            log::error!("pipeline stopped on drop with error: {error}");
        }
    }
}

/// Run one plan to completion, converting panics into recorded faults.
fn run_plan<T>(shared: &Arc<PipelineShared<T>>, thread_id: usize, mut tasks: Vec<StageTask<T>>) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| run_worker(shared, &mut tasks)));
    if let Err(payload) = result {
        let message = panic_message(payload.as_ref());
        log::error!("worker thread {thread_id} panicked: {message}");
        shared.set_error(PipelineError::WorkerPanicked { thread_id, message });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// The scheduling loop: round-robin the plan's tasks, back off when idle.
///
/// An empty plan idles until the run is stopped externally; this is how an
/// empty graph behaves as a blocking no-op under `exec`.
fn run_worker<T>(shared: &PipelineShared<T>, tasks: &mut [StageTask<T>]) {
    let mut backoff_us = MIN_BACKOFF_US;
    loop {
        if shared.should_exit() {
            break;
        }
        let mut did_work = false;
        for task in tasks.iter_mut() {
            match step_task(shared, task) {
                StepResult::Progress | StepResult::Finished => did_work = true,
                StepResult::Idle => {}
            }
        }
        if !tasks.is_empty() && tasks.iter().all(StageTask::is_done) {
            break;
        }
        if did_work {
            backoff_us = MIN_BACKOFF_US;
        } else {
            thread::sleep(Duration::from_micros(backoff_us));
            backoff_us = (backoff_us * 2).min(MAX_BACKOFF_US);
        }
    }
}

fn step_task<T>(shared: &PipelineShared<T>, task: &mut StageTask<T>) -> StepResult {
    match task {
        StageTask::Source(task) => step_source(shared, task),
        StageTask::Transform(task) => match task.reorder.clone() {
            Some(reorder) => step_transform_parallel(shared, task, &reorder),
            None => step_transform(shared, task),
        },
        StageTask::Drain(task) => step_drain(shared, task),
    }
}

/// Mark a task finished and settle its downstream queue.
fn finish_task<T>(shared: &PipelineShared<T>, done: &mut bool, downstream: Option<usize>) -> StepResult {
    *done = true;
    if let Some(queue) = downstream {
        shared.producer_finished(queue);
    }
    shared.task_finished();
    StepResult::Finished
}

fn step_source<T>(shared: &PipelineShared<T>, task: &mut SourceTask<T>) -> StepResult {
    if task.done {
        return StepResult::Idle;
    }
    if let Some(item) = task.held.take() {
        match shared.queues[task.output].try_push(item) {
            Ok(()) => {}
            Err(item) => {
                task.held = Some(item);
                return StepResult::Idle;
            }
        }
    } else if !task.exhausted {
        match task.worker.lock().produce() {
            Some(item) => {
                if let Err(item) = shared.queues[task.output].try_push(item) {
                    task.held = Some(item);
                }
                return StepResult::Progress;
            }
            None => task.exhausted = true,
        }
    }
    if task.exhausted && task.held.is_none() {
        return finish_task(shared, &mut task.done, Some(task.output));
    }
    StepResult::Progress
}

fn step_transform<T>(shared: &PipelineShared<T>, task: &mut TransformTask<T>) -> StepResult {
    if task.done {
        return StepResult::Idle;
    }
    // deliver the held item first; popping past it would reorder the stream
    if let Some(item) = task.held.take() {
        let Some(output) = task.output else {
            return StepResult::Idle;
        };
        match shared.queues[output].try_push(item) {
            Ok(()) => return StepResult::Progress,
            Err(item) => {
                task.held = Some(item);
                return StepResult::Idle;
            }
        }
    }
    match shared.queues[task.input].try_pop() {
        Some(item) => {
            let result = task.worker.lock().process(item);
            if let (Some(result), Some(output)) = (result, task.output) {
                if let Err(refused) = shared.queues[output].try_push(result) {
                    task.held = Some(refused);
                }
            }
            StepResult::Progress
        }
        None => {
            // settled input read before emptiness: no later push can race
            if shared.settled(task.input) && shared.queues[task.input].is_empty() {
                finish_task(shared, &mut task.done, task.output)
            } else {
                StepResult::Idle
            }
        }
    }
}

/// One member of a parallel group: pop tagged with the input's pop ordinal,
/// process, insert into the shared window, and flush whatever prefix of the
/// serial stream is ready.
fn step_transform_parallel<T>(
    shared: &PipelineShared<T>,
    task: &mut TransformTask<T>,
    reorder: &StageReorder<T>,
) -> StepResult {
    if task.done {
        return StepResult::Idle;
    }
    let Some(output) = task.output else {
        return StepResult::Idle;
    };
    let progressed = flush_reorder(shared, reorder, output);

    // admission control: a stalled output must not grow the window forever
    if reorder.buf.lock().len() < reorder.capacity {
        if let Some((serial, item)) = shared.queues[task.input].try_pop_tagged() {
            let result = task.worker.lock().process(item);
            // a dropped item still occupies its serial, as a gap marker
            reorder.buf.lock().insert(serial, result);
            flush_reorder(shared, reorder, output);
            return StepResult::Progress;
        }
    }

    if shared.settled(task.input) && shared.queues[task.input].is_empty() && reorder.is_idle() {
        finish_task(shared, &mut task.done, Some(output))
    } else if progressed {
        StepResult::Progress
    } else {
        StepResult::Idle
    }
}

/// Drain the ready prefix of the window into the output queue. The whole
/// flush runs under the `pending` lock so concurrent members cannot
/// interleave deliveries out of serial order.
fn flush_reorder<T>(shared: &PipelineShared<T>, reorder: &StageReorder<T>, output: usize) -> bool {
    let queue = &shared.queues[output];
    let mut progressed = false;
    let mut pending = reorder.pending.lock();
    loop {
        if let Some(item) = pending.take() {
            if let Err(item) = queue.try_push(item) {
                *pending = Some(item);
                break;
            }
            progressed = true;
        }
        match reorder.buf.lock().try_pop_next() {
            Some(Some(item)) => *pending = Some(item),
            Some(None) => progressed = true,
            None => break,
        }
    }
    progressed
}

fn step_drain<T>(shared: &PipelineShared<T>, task: &mut DrainTask) -> StepResult {
    if task.done {
        return StepResult::Idle;
    }
    match shared.queues[task.input].try_pop() {
        Some(_) => StepResult::Progress,
        None => {
            if shared.settled(task.input) && shared.queues[task.input].is_empty() {
                finish_task(shared, &mut task.done, None)
            } else {
                StepResult::Idle
            }
        }
    }
}
