//! Stage graph construction.
//!
//! The graph translates the facade's current state (mode, configuration
//! records, worker registrations, threading flags) into a linear chain of
//! bounded queues and per-thread task plans. Building happens on every
//! `exec`/`start` call; a graph is never reused across runs.
//!
//! # Wiring
//!
//! ```text
//! [first queue] -> group -> [queue] -> group -> ... -> [last queue]
//! ```
//!
//! - A boundary queue is allocated before the first stage; every
//!   instantiated stage that forwards output allocates the queue after it.
//! - An Input-slot group is a source: it has no input queue and produces
//!   into the first boundary queue.
//! - An Output-slot group is a terminal sink: it drains the frontier queue
//!   and allocates nothing after it.
//! - Slots with neither a user worker nor a factory-built group are skipped
//!   entirely; their absence does not perturb downstream queue identity.
//! - When the mode keeps consumption internal and no Output worker exists,
//!   an implicit drain task discards the tail queue.
//!
//! Tasks refer to queues by index into [`StageGraph::queues`]. Alongside
//! each queue the graph records how many tasks produce into it; the run
//! counts these down to zero to detect that a queue is settled (no item
//! will ever arrive again), which is what drives natural completion. A
//! queue fed by the caller rather than by tasks never settles.
//!
//! Groups with more than one member share their input queue across member
//! threads and reimpose arrival order on their output through a shared
//! [`StageReorder`] keyed by the queue's pop ordinal.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{StageConfigs, StageFactoryHandle};
use crate::manager::PipelineMode;
use crate::queue::BoundedQueue;
use crate::reorder::ReorderBuffer;
use crate::slot::{StageSlot, WorkerRegistry};
use crate::worker::WorkerHandle;

/// Producer count for a queue fed by the caller instead of by tasks.
pub(crate) const EXTERNAL_PRODUCER: usize = usize::MAX;

/// Everything a build needs, collected into one explicit value.
///
/// The facade snapshots its state into a `BuildRequest` at `exec`/`start`
/// time; nothing else is shared between the facade and the manager.
pub struct BuildRequest<T> {
    /// Thread-ownership mode, fixed at facade construction.
    pub mode: PipelineMode,
    /// False collapses every group onto the calling pipeline thread.
    pub multi_threaded: bool,
    /// Capacity of every queue in the chain.
    pub queue_capacity: usize,
    /// Current configuration records (opaque to the core).
    pub configs: StageConfigs,
    /// Snapshot of user worker registrations.
    pub registry: WorkerRegistry<T>,
    /// Builds default groups for slots without user workers.
    pub factory: StageFactoryHandle<T>,
}

/// Shared per-group reassembly state for parallel stage groups.
///
/// Members insert `(serial, Some(output))` after processing, or
/// `(serial, None)` for items their worker dropped, keeping the serial
/// stream contiguous. Whichever member flushes next drains the ready
/// prefix to the output queue; an item refused by a full output queue is
/// parked in `pending` until it can be delivered.
pub(crate) struct StageReorder<T> {
    /// The reassembly window.
    pub buf: Mutex<ReorderBuffer<Option<T>>>,
    /// In-order item popped from the window but not yet accepted downstream.
    /// Deliveries happen under this lock, which also serializes flushers.
    pub pending: Mutex<Option<T>>,
    /// Window size cap; members pause popping while the window is this full.
    pub capacity: usize,
}

impl<T> StageReorder<T> {
    fn new(capacity: usize) -> Self {
        Self { buf: Mutex::new(ReorderBuffer::new()), pending: Mutex::new(None), capacity }
    }

    /// True when nothing is buffered or parked.
    pub fn is_idle(&self) -> bool {
        self.buf.lock().is_empty() && self.pending.lock().is_none()
    }
}

/// A source task: one Input-slot group member.
pub(crate) struct SourceTask<T> {
    pub worker: WorkerHandle<T>,
    pub output: usize,
    /// Set once `produce` returns `None`.
    pub exhausted: bool,
    /// Produced item refused by a full output queue, retried next step.
    pub held: Option<T>,
    pub done: bool,
}

/// A transform or sink task: one group member of a non-Input slot.
pub(crate) struct TransformTask<T> {
    pub worker: WorkerHandle<T>,
    pub input: usize,
    /// `None` for terminal sinks.
    pub output: Option<usize>,
    /// Present when the group has several members and forwards output.
    pub reorder: Option<Arc<StageReorder<T>>>,
    /// Processed item refused by a full output queue (FIFO path only).
    pub held: Option<T>,
    pub done: bool,
}

/// Discards the tail queue when consumption is pipeline-internal.
pub(crate) struct DrainTask {
    pub input: usize,
    pub done: bool,
}

/// One schedulable unit of stage work.
pub(crate) enum StageTask<T> {
    Source(SourceTask<T>),
    Transform(TransformTask<T>),
    Drain(DrainTask),
}

impl<T> StageTask<T> {
    pub fn is_done(&self) -> bool {
        match self {
            StageTask::Source(task) => task.done,
            StageTask::Transform(task) => task.done,
            StageTask::Drain(task) => task.done,
        }
    }
}

/// A built, runnable graph: queues plus per-thread task plans.
///
/// Plan 0 is the calling thread's share under `exec`; the remaining plans
/// each get a dedicated thread.
pub(crate) struct StageGraph<T> {
    pub queues: Vec<Arc<BoundedQueue<T>>>,
    /// Per-queue producer-task count, [`EXTERNAL_PRODUCER`] for the caller.
    pub producer_counts: Vec<usize>,
    pub plans: Vec<Vec<StageTask<T>>>,
    /// Index of the first boundary queue (always 0).
    pub first_queue: usize,
    /// Index of the last boundary queue; equals `first_queue` for an empty
    /// graph.
    pub last_queue: usize,
    /// Number of source tasks; zero means the pipeline only ever stops on
    /// request.
    pub source_count: usize,
    /// Whether the tail queue is consumed by the caller rather than by an
    /// Output sink or an implicit drain.
    pub tail_caller_controlled: bool,
    /// Number of instantiated stage groups (for logging).
    pub stage_count: usize,
}

struct StageDesc<T> {
    slot: StageSlot,
    workers: Vec<WorkerHandle<T>>,
    on_new_thread: bool,
}

/// Build a runnable graph from the request.
pub(crate) fn build_graph<T>(request: &BuildRequest<T>) -> StageGraph<T> {
    let capacity = request.queue_capacity;

    // Resolve which slots participate: a user group wins over the factory's
    // default group; slots with neither are skipped.
    let mut descs: Vec<StageDesc<T>> = Vec::new();
    for slot in StageSlot::all() {
        let entry = request.registry.entry(slot);
        if entry.workers.is_empty() {
            if let Some(group) = request.factory.build(slot, &request.configs) {
                if !group.is_empty() {
                    descs.push(StageDesc { slot, workers: group, on_new_thread: true });
                }
            }
        } else {
            descs.push(StageDesc {
                slot,
                workers: entry.workers.clone(),
                on_new_thread: entry.on_new_thread,
            });
        }
    }

    // Wire the queue chain and turn each group into member tasks.
    let mut queues = vec![Arc::new(BoundedQueue::new(capacity))];
    let mut producer_counts = vec![EXTERNAL_PRODUCER];
    let mut plans: Vec<Vec<StageTask<T>>> = Vec::new();
    let mut frontier = 0usize;
    let mut source_count = 0usize;
    let mut output_slot_present = false;
    let stage_count = descs.len();

    for desc in descs {
        let members = desc.workers.len();
        let mut tasks: Vec<StageTask<T>> = Vec::with_capacity(members);

        if desc.slot == StageSlot::Input {
            // Sources fill the first boundary queue; the frontier stays put.
            source_count += members;
            producer_counts[0] = source_count;
            for worker in desc.workers {
                tasks.push(StageTask::Source(SourceTask {
                    worker,
                    output: 0,
                    exhausted: false,
                    held: None,
                    done: false,
                }));
            }
        } else {
            let input = frontier;
            let output = if desc.slot == StageSlot::Output {
                output_slot_present = true;
                None
            } else {
                queues.push(Arc::new(BoundedQueue::new(capacity)));
                producer_counts.push(members);
                frontier = queues.len() - 1;
                Some(frontier)
            };
            let reorder = if members > 1 && output.is_some() {
                Some(Arc::new(StageReorder::new(capacity)))
            } else {
                None
            };
            for worker in desc.workers {
                tasks.push(StageTask::Transform(TransformTask {
                    worker,
                    input,
                    output,
                    reorder: reorder.clone(),
                    held: None,
                    done: false,
                }));
            }
        }

        // Thread planning: one thread per member when the group asked for
        // its own thread(s), otherwise the whole group joins the previous
        // plan. Disabled multithreading collapses everything onto plan 0.
        if !request.multi_threaded {
            if plans.is_empty() {
                plans.push(Vec::new());
            }
            plans[0].extend(tasks);
        } else if desc.on_new_thread || plans.is_empty() {
            for task in tasks {
                plans.push(vec![task]);
            }
        } else {
            let last = plans.len() - 1;
            plans[last].extend(tasks);
        }
    }

    // Consumption stays internal in AsynchronousIn mode: without an Output
    // sink the tail queue would fill and stall the whole chain.
    let drain_added = request.mode.output_is_internal() && !output_slot_present;
    if drain_added {
        let drain = StageTask::Drain(DrainTask { input: frontier, done: false });
        if let Some(last) = plans.last_mut() {
            last.push(drain);
        } else {
            plans.push(vec![drain]);
        }
    }

    log::debug!(
        "built stage graph: {} stage(s), {} queue(s) of capacity {}, {} thread plan(s), {} source(s)",
        stage_count,
        queues.len(),
        capacity,
        plans.len(),
        source_count,
    );

    StageGraph {
        queues,
        producer_counts,
        plans,
        first_queue: 0,
        last_queue: frontier,
        source_count,
        tail_caller_controlled: !output_slot_present && !drain_added,
        stage_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NoBuiltinStages;
    use crate::worker::{worker_handle, FnSink, FnSource, FnWorker};

    fn request(mode: PipelineMode) -> BuildRequest<u32> {
        BuildRequest {
            mode,
            multi_threaded: true,
            queue_capacity: 4,
            configs: StageConfigs::default(),
            registry: WorkerRegistry::new(),
            factory: Arc::new(NoBuiltinStages),
        }
    }

    #[test]
    fn test_empty_graph_is_single_queue_no_plans() {
        let graph = build_graph(&request(PipelineMode::Synchronous));
        assert_eq!(graph.queues.len(), 1);
        assert!(graph.plans.is_empty());
        assert_eq!(graph.stage_count, 0);
        // First and last boundary queue are the same queue: a no-op chain.
        assert_eq!(graph.first_queue, graph.last_queue);
        assert_eq!(graph.producer_counts[0], EXTERNAL_PRODUCER);
        assert!(graph.tail_caller_controlled);
    }

    #[test]
    fn test_skipped_slots_do_not_affect_queue_identity() {
        let mut req = request(PipelineMode::Synchronous);
        req.registry.register(
            StageSlot::Detection,
            vec![worker_handle(FnWorker::new(|x: u32| x))],
            true,
        );
        let graph = build_graph(&req);
        assert_eq!(graph.queues.len(), 2);
        assert_eq!(graph.plans.len(), 1);
        assert_eq!(graph.first_queue, 0);
        assert_eq!(graph.last_queue, 1);
        assert_eq!(graph.producer_counts, vec![EXTERNAL_PRODUCER, 1]);
    }

    #[test]
    fn test_chain_of_three_transforms() {
        let mut req = request(PipelineMode::Synchronous);
        for slot in [StageSlot::PreProcessing, StageSlot::Detection, StageSlot::PostProcessing] {
            req.registry.register(slot, vec![worker_handle(FnWorker::new(|x: u32| x))], true);
        }
        let graph = build_graph(&req);
        // boundary + one queue after each of the three stages
        assert_eq!(graph.queues.len(), 4);
        assert_eq!(graph.plans.len(), 3);
        assert_eq!(graph.stage_count, 3);
        assert_eq!(graph.last_queue, 3);
    }

    #[test]
    fn test_source_binds_to_first_queue() {
        let mut req = request(PipelineMode::Synchronous);
        req.registry.register(
            StageSlot::Input,
            vec![worker_handle(FnSource::new(|| Some(1u32)))],
            true,
        );
        let graph = build_graph(&req);
        assert_eq!(graph.source_count, 1);
        assert_eq!(graph.queues.len(), 1);
        assert_eq!(graph.producer_counts[0], 1);
        match &graph.plans[0][0] {
            StageTask::Source(task) => assert_eq!(task.output, graph.first_queue),
            _ => panic!("expected a source task"),
        }
    }

    #[test]
    fn test_output_slot_is_terminal_sink() {
        let mut req = request(PipelineMode::Synchronous);
        req.registry.register(StageSlot::Output, vec![worker_handle(FnSink::new(|_: u32| ()))], true);
        let graph = build_graph(&req);
        // The sink consumes the boundary queue and allocates nothing after.
        assert_eq!(graph.queues.len(), 1);
        assert!(!graph.tail_caller_controlled);
        match &graph.plans[0][0] {
            StageTask::Transform(task) => {
                assert!(task.output.is_none());
                assert!(task.reorder.is_none());
            }
            _ => panic!("expected a transform task"),
        }
    }

    #[test]
    fn test_multi_member_group_shares_reorder() {
        let mut req = request(PipelineMode::Synchronous);
        req.registry.register(
            StageSlot::Detection,
            vec![
                worker_handle(FnWorker::new(|x: u32| x)),
                worker_handle(FnWorker::new(|x: u32| x)),
                worker_handle(FnWorker::new(|x: u32| x)),
            ],
            true,
        );
        let graph = build_graph(&req);
        assert_eq!(graph.plans.len(), 3);
        assert_eq!(graph.producer_counts[1], 3);
        let reorders: Vec<_> = graph
            .plans
            .iter()
            .map(|plan| match &plan[0] {
                StageTask::Transform(task) => task.reorder.clone().expect("reorder expected"),
                _ => panic!("expected transform tasks"),
            })
            .collect();
        assert!(Arc::ptr_eq(&reorders[0], &reorders[1]));
        assert!(Arc::ptr_eq(&reorders[1], &reorders[2]));
    }

    #[test]
    fn test_on_new_thread_false_merges_into_previous_plan() {
        let mut req = request(PipelineMode::Synchronous);
        req.registry.register(
            StageSlot::Detection,
            vec![worker_handle(FnWorker::new(|x: u32| x))],
            true,
        );
        req.registry.register(
            StageSlot::PostProcessing,
            vec![worker_handle(FnWorker::new(|x: u32| x))],
            false,
        );
        let graph = build_graph(&req);
        assert_eq!(graph.plans.len(), 1);
        assert_eq!(graph.plans[0].len(), 2);
    }

    #[test]
    fn test_multithreading_disabled_collapses_to_plan_zero() {
        let mut req = request(PipelineMode::Synchronous);
        req.multi_threaded = false;
        for slot in [StageSlot::PreProcessing, StageSlot::Detection] {
            req.registry.register(slot, vec![worker_handle(FnWorker::new(|x: u32| x))], true);
        }
        let graph = build_graph(&req);
        assert_eq!(graph.plans.len(), 1);
        assert_eq!(graph.plans[0].len(), 2);
    }

    #[test]
    fn test_asynchronous_in_without_output_worker_gets_drain() {
        let mut req = request(PipelineMode::AsynchronousIn);
        req.registry.register(
            StageSlot::Detection,
            vec![worker_handle(FnWorker::new(|x: u32| x))],
            true,
        );
        let graph = build_graph(&req);
        assert!(!graph.tail_caller_controlled);
        let last_plan = graph.plans.last().unwrap();
        match last_plan.last().unwrap() {
            StageTask::Drain(task) => assert_eq!(task.input, graph.last_queue),
            _ => panic!("expected a drain task at the tail"),
        }
    }

    #[test]
    fn test_factory_default_group_fills_unregistered_slot() {
        struct DetectionOnly;
        impl crate::config::StageFactory<u32> for DetectionOnly {
            fn build(
                &self,
                slot: StageSlot,
                configs: &StageConfigs,
            ) -> Option<Vec<WorkerHandle<u32>>> {
                (slot == StageSlot::Detection && configs.pose.enable)
                    .then(|| vec![worker_handle(FnWorker::new(|x: u32| x + 1))])
            }
        }

        let mut req = request(PipelineMode::Synchronous);
        req.factory = Arc::new(DetectionOnly);
        let graph = build_graph(&req);
        assert_eq!(graph.stage_count, 0, "disabled configuration builds nothing");

        req.configs.pose.enable = true;
        let graph = build_graph(&req);
        assert_eq!(graph.stage_count, 1);

        // A user registration takes precedence over the factory default.
        req.registry.register(
            StageSlot::Detection,
            vec![
                worker_handle(FnWorker::new(|x: u32| x)),
                worker_handle(FnWorker::new(|x: u32| x)),
            ],
            true,
        );
        let graph = build_graph(&req);
        assert_eq!(graph.plans.len(), 2);
    }
}
