//! End-to-end pipeline behavior: lifecycle, boundary contracts, ordering.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use stagepipe::{
    worker_handle, FnFilter, FnSink, FnSource, FnWorker, Pipeline, PipelineMode, StageSlot,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A source yielding `1..=limit`, then exhaustion.
fn counting_source(limit: i64) -> stagepipe::WorkerHandle<i64> {
    let mut next = 0;
    worker_handle(FnSource::new(move || {
        if next < limit {
            next += 1;
            Some(next)
        } else {
            None
        }
    }))
}

#[test]
fn test_exec_end_to_end_exactly_once_in_order() {
    init_logging();
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink_items = Arc::clone(&collected);

    let mut pipeline = Pipeline::new(PipelineMode::Synchronous);
    pipeline.set_worker(StageSlot::Input, counting_source(5), true);
    pipeline.set_worker(
        StageSlot::PreProcessing,
        worker_handle(FnWorker::new(|x: i64| x * 10)),
        true,
    );
    pipeline.set_worker(
        StageSlot::PostProcessing,
        worker_handle(FnWorker::new(|x: i64| x + 1)),
        true,
    );
    pipeline.set_worker(
        StageSlot::Output,
        worker_handle(FnSink::new(move |x: i64| sink_items.lock().push(x))),
        true,
    );

    // exec blocks until the source runs dry and the chain empties
    pipeline.exec().unwrap();
    assert!(!pipeline.is_running());
    assert_eq!(*collected.lock(), vec![11, 21, 31, 41, 51]);
}

#[test]
fn test_boundary_round_trip_preserves_order() {
    init_logging();
    let mut pipeline = Pipeline::new(PipelineMode::Asynchronous);
    pipeline.set_worker(StageSlot::Detection, worker_handle(FnWorker::new(|x: i64| x * x)), true);
    pipeline.start().unwrap();

    for i in 1..=5 {
        assert!(pipeline.wait_and_emplace(i).is_ok());
    }
    let results: Vec<_> = (0..5).map(|_| pipeline.wait_and_pop().unwrap()).collect();
    assert_eq!(results, vec![1, 4, 9, 16, 25]);

    pipeline.stop().unwrap();
}

#[test]
fn test_factory_built_stage_runs_end_to_end() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use stagepipe::{FaceConfig, StageConfigs, StageFactory, WorkerHandle};

    init_logging();

    /// Supplies a Detection group only while the face record is enabled.
    struct FaceStages {
        invocations: Arc<AtomicUsize>,
    }

    impl StageFactory<i64> for FaceStages {
        fn build(&self, slot: StageSlot, configs: &StageConfigs) -> Option<Vec<WorkerHandle<i64>>> {
            if slot != StageSlot::Detection || !configs.face.enable {
                return None;
            }
            let invocations = Arc::clone(&self.invocations);
            Some(vec![worker_handle(FnWorker::new(move |x: i64| {
                invocations.fetch_add(1, Ordering::SeqCst);
                x * 3
            }))])
        }
    }

    let invocations = Arc::new(AtomicUsize::new(0));
    let mut pipeline = Pipeline::with_factory(
        PipelineMode::Synchronous,
        Arc::new(FaceStages { invocations: Arc::clone(&invocations) }),
    );
    pipeline.configure_face(FaceConfig { enable: true, ..FaceConfig::default() });
    pipeline.start().unwrap();

    // no user workers anywhere: the configured stage alone does the work
    let results: Vec<_> = (1..=5).map(|i| pipeline.emplace_and_pop(i).unwrap()).collect();
    assert_eq!(results, vec![3, 6, 9, 12, 15]);
    assert_eq!(invocations.load(Ordering::SeqCst), 5);

    pipeline.stop().unwrap();
}

#[test]
fn test_parallel_group_preserves_arrival_order() {
    init_logging();
    let jittery = || {
        worker_handle(FnWorker::new(|x: i64| {
            // uneven per-item latency forces members to finish out of order
            thread::sleep(Duration::from_micros(u64::try_from(x % 3).unwrap() * 300));
            x * 2
        }))
    };

    let mut pipeline = Pipeline::new(PipelineMode::Asynchronous);
    pipeline
        .set_worker_group(StageSlot::Detection, vec![jittery(), jittery(), jittery(), jittery()], true)
        .unwrap();
    pipeline.start().unwrap();

    for i in 0..50 {
        assert!(pipeline.wait_and_emplace(i).is_ok());
    }
    let results: Vec<_> = (0..50).map(|_| pipeline.wait_and_pop().unwrap()).collect();
    let expected: Vec<_> = (0..50).map(|i| i * 2).collect();
    assert_eq!(results, expected);

    pipeline.stop().unwrap();
}

#[test]
fn test_exec_with_parallel_group_completes_in_order() {
    init_logging();
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink_items = Arc::clone(&collected);
    let jittery = || {
        worker_handle(FnWorker::new(|x: i64| {
            thread::sleep(Duration::from_micros(u64::try_from(x % 5).unwrap() * 100));
            x + 1000
        }))
    };

    let mut pipeline = Pipeline::new(PipelineMode::Synchronous);
    pipeline.set_worker(StageSlot::Input, counting_source(100), true);
    pipeline
        .set_worker_group(StageSlot::Detection, vec![jittery(), jittery(), jittery()], true)
        .unwrap();
    pipeline.set_worker(
        StageSlot::Output,
        worker_handle(FnSink::new(move |x: i64| sink_items.lock().push(x))),
        true,
    );

    pipeline.exec().unwrap();
    let expected: Vec<_> = (1..=100).map(|i| i + 1000).collect();
    assert_eq!(*collected.lock(), expected);
}

#[test]
fn test_dropping_workers_leave_no_gaps() {
    init_logging();
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink_items = Arc::clone(&collected);
    // two parallel filters discarding odd items must not stall the evens
    let dropping = || worker_handle(FnFilter::new(|x: i64| (x % 2 == 0).then_some(x)));

    let mut pipeline = Pipeline::new(PipelineMode::Synchronous);
    pipeline.set_worker(StageSlot::Input, counting_source(20), true);
    pipeline.set_worker_group(StageSlot::Detection, vec![dropping(), dropping()], true).unwrap();
    pipeline.set_worker(
        StageSlot::Output,
        worker_handle(FnSink::new(move |x: i64| sink_items.lock().push(x))),
        true,
    );

    pipeline.exec().unwrap();
    let expected: Vec<_> = (1..=20).filter(|x| x % 2 == 0).collect();
    assert_eq!(*collected.lock(), expected);
}

#[test]
fn test_stop_makes_all_boundary_ops_fail() {
    init_logging();
    let mut pipeline = Pipeline::new(PipelineMode::Asynchronous);
    pipeline.set_worker(StageSlot::Detection, worker_handle(FnWorker::new(|x: i64| x)), true);
    pipeline.start().unwrap();
    assert!(pipeline.try_emplace(1).is_ok());

    pipeline.stop().unwrap();
    assert!(!pipeline.is_running());
    assert!(pipeline.try_emplace(2).is_err());
    assert!(pipeline.wait_and_emplace(3).is_err());
    assert!(!pipeline.try_push(&4));
    assert!(!pipeline.wait_and_push(&5));
    assert!(pipeline.try_pop().is_none());
    assert!(pipeline.wait_and_pop().is_none());
    assert!(pipeline.emplace_and_pop(6).is_none());
}

#[test]
fn test_stop_is_idempotent() {
    init_logging();
    let mut pipeline = Pipeline::new(PipelineMode::Asynchronous);
    pipeline.set_worker(StageSlot::Detection, worker_handle(FnWorker::new(|x: i64| x)), true);
    pipeline.start().unwrap();
    pipeline.stop().unwrap();
    pipeline.stop().unwrap();
    pipeline.stop().unwrap();
    assert!(!pipeline.is_running());
}

#[test]
fn test_stop_unblocks_a_waiting_producer() {
    use std::sync::atomic::{AtomicBool, Ordering};

    init_logging();
    let taken = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));

    let mut pipeline = Pipeline::new(PipelineMode::AsynchronousIn);
    pipeline.set_queue_capacity(2);
    // the consumer parks on its first item, so once the input queue is full
    // no space can free until the run is torn down
    let worker_taken = Arc::clone(&taken);
    let worker_release = Arc::clone(&release);
    pipeline.set_worker(
        StageSlot::Detection,
        worker_handle(FnWorker::new(move |x: i64| {
            worker_taken.store(true, Ordering::SeqCst);
            for _ in 0..10_000 {
                if worker_release.load(Ordering::SeqCst) {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            x
        })),
        true,
    );
    pipeline.start().unwrap();
    let pipeline = Arc::new(pipeline);

    // hand the consumer its in-flight item, then top the queue back up
    assert!(pipeline.try_emplace(0).is_ok());
    while !taken.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(1));
    }
    let mut next = 1;
    while pipeline.try_emplace(next).is_ok() {
        next += 1;
    }
    assert!(pipeline.try_emplace(next).is_err());

    let blocked = thread::spawn({
        let pipeline = Arc::clone(&pipeline);
        move || pipeline.wait_and_emplace(99)
    });
    thread::sleep(Duration::from_millis(30));

    // stop joins the parked worker, so it runs on its own thread
    let stopper = thread::spawn({
        let pipeline = Arc::clone(&pipeline);
        move || pipeline.stop()
    });
    // the blocked emplace is woken by the stop and hands the item back
    assert_eq!(blocked.join().unwrap().unwrap_err(), 99);
    // the boundary is already closed; unpark the consumer so stop can join
    release.store(true, Ordering::SeqCst);
    stopper.join().unwrap().unwrap();
}

#[test]
fn test_stop_unblocks_a_waiting_consumer() {
    init_logging();
    let pipeline: Arc<Pipeline<i64>> = Arc::new(Pipeline::new(PipelineMode::Asynchronous));
    pipeline.start().unwrap();

    let blocked = thread::spawn({
        let pipeline = Arc::clone(&pipeline);
        move || pipeline.wait_and_pop()
    });
    thread::sleep(Duration::from_millis(30));
    pipeline.stop().unwrap();
    assert!(blocked.join().unwrap().is_none());
}

#[test]
fn test_empty_graph_passes_items_through() {
    init_logging();
    let pipeline: Pipeline<i64> = Pipeline::new(PipelineMode::Asynchronous);
    pipeline.start().unwrap();
    assert!(pipeline.wait_and_emplace(7).is_ok());
    assert_eq!(pipeline.wait_and_pop(), Some(7));
    assert_eq!(pipeline.emplace_and_pop(8), Some(8));
    pipeline.stop().unwrap();
}

#[test]
fn test_disable_multi_threading_still_moves_items() {
    init_logging();
    let mut pipeline = Pipeline::new(PipelineMode::Asynchronous);
    pipeline.disable_multi_threading();
    pipeline.set_worker(StageSlot::PreProcessing, worker_handle(FnWorker::new(|x: i64| x + 1)), true);
    pipeline.set_worker(StageSlot::Detection, worker_handle(FnWorker::new(|x: i64| x * 2)), true);
    pipeline.set_worker(StageSlot::PostProcessing, worker_handle(FnWorker::new(|x: i64| x - 3)), true);
    pipeline.start().unwrap();

    for i in 1..=10 {
        assert!(pipeline.wait_and_emplace(i).is_ok());
    }
    let results: Vec<_> = (0..10).map(|_| pipeline.wait_and_pop().unwrap()).collect();
    let expected: Vec<_> = (1..=10).map(|i| (i + 1) * 2 - 3).collect();
    assert_eq!(results, expected);

    pipeline.stop().unwrap();
}

#[test]
fn test_input_worker_registration_claims_the_boundary() {
    init_logging();
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink_items = Arc::clone(&collected);

    let mut pipeline = Pipeline::new(PipelineMode::Synchronous);
    pipeline.set_worker(StageSlot::Input, counting_source(3), true);
    pipeline.set_worker(
        StageSlot::Output,
        worker_handle(FnSink::new(move |x: i64| sink_items.lock().push(x))),
        true,
    );
    pipeline.start().unwrap();

    // the registered source owns the input end now
    assert!(pipeline.try_emplace(42).is_err());
    assert!(!pipeline.try_push(&42));

    // the run still completes from the source alone
    while pipeline.is_running() {
        thread::sleep(Duration::from_millis(1));
    }
    pipeline.stop().unwrap();
    assert_eq!(*collected.lock(), vec![1, 2, 3]);
}

#[test]
fn test_restart_after_stop_builds_a_fresh_run() {
    init_logging();
    let mut pipeline = Pipeline::new(PipelineMode::Asynchronous);
    pipeline.set_worker(StageSlot::Detection, worker_handle(FnWorker::new(|x: i64| x + 1)), true);

    pipeline.start().unwrap();
    assert_eq!(pipeline.emplace_and_pop(1), Some(2));
    pipeline.stop().unwrap();

    // re-registration between runs takes effect on the rebuild
    pipeline.set_worker(StageSlot::Detection, worker_handle(FnWorker::new(|x: i64| x + 10)), true);
    pipeline.start().unwrap();
    assert_eq!(pipeline.emplace_and_pop(1), Some(11));
    pipeline.stop().unwrap();
}
