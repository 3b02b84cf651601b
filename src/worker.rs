//! The worker contract: one unit of stage logic.
//!
//! A worker is a polymorphic unit of work bound to a stage slot. Most
//! workers transform items (`process`); a worker registered on the Input
//! slot acts as a source instead (`produce`) and a worker whose `process`
//! always returns `None` is a terminal sink.
//!
//! Workers must not retain cross-call mutable state that depends on item
//! ordering: when a group runs as multiple threads, calls to a single
//! worker stay ordered, but which member sees which item is not specified.
//! Per-item sequencing is reimposed by the stage graph, not by workers.

use std::sync::Arc;

use parking_lot::Mutex;

/// One unit of stage logic.
///
/// `process` is called once per item pulled from the stage's input queue;
/// `produce` is called instead when the worker occupies the Input slot and
/// therefore has no upstream queue.
pub trait Worker<T>: Send {
    /// Transform one item.
    ///
    /// Return `Some` to forward the result downstream, `None` to drop it.
    /// Terminal sinks always return `None`.
    fn process(&mut self, item: T) -> Option<T>;

    /// Generate the next item when acting as a source.
    ///
    /// Returning `None` marks the source as exhausted; once every source in
    /// the pipeline is exhausted and all queues have drained, the pipeline
    /// completes naturally. The default implementation is immediately
    /// exhausted, so only Input-slot workers need to override this.
    fn produce(&mut self) -> Option<T> {
        None
    }
}

/// Shared handle to a worker.
///
/// Injected workers are shared between the caller and the pipeline; the
/// handle's lifetime extends to the longest holder. Groups the pipeline
/// builds itself from configuration hold the only reference.
pub type WorkerHandle<T> = Arc<Mutex<dyn Worker<T>>>;

/// Wrap a worker into a [`WorkerHandle`].
pub fn worker_handle<T, W>(worker: W) -> WorkerHandle<T>
where
    W: Worker<T> + 'static,
{
    Arc::new(Mutex::new(worker))
}

/// Transform worker built from a closure.
pub struct FnWorker<F> {
    f: F,
}

impl<F> FnWorker<F> {
    /// Wrap `f` as a transform worker; the closure's return value is
    /// forwarded downstream.
    pub fn new<T>(f: F) -> Self
    where
        F: FnMut(T) -> T + Send,
    {
        Self { f }
    }
}

impl<T, F> Worker<T> for FnWorker<F>
where
    F: FnMut(T) -> T + Send,
{
    fn process(&mut self, item: T) -> Option<T> {
        Some((self.f)(item))
    }
}

/// Terminal sink worker built from a closure.
pub struct FnSink<F> {
    f: F,
}

impl<F> FnSink<F> {
    /// Wrap `f` as a sink; items are consumed and never forwarded.
    pub fn new<T>(f: F) -> Self
    where
        F: FnMut(T) + Send,
    {
        Self { f }
    }
}

impl<T, F> Worker<T> for FnSink<F>
where
    F: FnMut(T) + Send,
{
    fn process(&mut self, item: T) -> Option<T> {
        (self.f)(item);
        None
    }
}

/// Filtering worker built from a closure.
pub struct FnFilter<F> {
    f: F,
}

impl<F> FnFilter<F> {
    /// Wrap `f` as a filtering transform; items mapped to `None` are
    /// dropped from the stream.
    pub fn new<T>(f: F) -> Self
    where
        F: FnMut(T) -> Option<T> + Send,
    {
        Self { f }
    }
}

impl<T, F> Worker<T> for FnFilter<F>
where
    F: FnMut(T) -> Option<T> + Send,
{
    fn process(&mut self, item: T) -> Option<T> {
        (self.f)(item)
    }
}

/// Source worker built from a closure.
///
/// The closure is polled for items until it returns `None`, at which point
/// the source is exhausted.
pub struct FnSource<F> {
    f: F,
}

impl<F> FnSource<F> {
    /// Wrap `f` as a source worker for the Input slot.
    pub fn new<T>(f: F) -> Self
    where
        F: FnMut() -> Option<T> + Send,
    {
        Self { f }
    }
}

impl<T, F> Worker<T> for FnSource<F>
where
    F: FnMut() -> Option<T> + Send,
{
    fn process(&mut self, item: T) -> Option<T> {
        // A source has no upstream queue; pass anything through untouched.
        Some(item)
    }

    fn produce(&mut self) -> Option<T> {
        (self.f)()
    }
}
