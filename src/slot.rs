//! Stage slots and the per-slot worker registry.
//!
//! A slot is a named position in the pipeline that hosts at most one worker
//! group. The slot set is closed; [`StageSlot::COUNT`] is the sentinel that
//! sizes the registry, and every registry access validates against the
//! closed set by construction (the enum cannot hold an out-of-range value).

use crate::worker::WorkerHandle;

/// A named position in the pipeline, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageSlot {
    /// Frame production. A worker here is a source: it generates items via
    /// `produce` and owns the input end of the pipeline.
    Input,
    /// Transformations applied before detection (resizing, normalization).
    PreProcessing,
    /// The detection stages themselves (pose, face, hand).
    Detection,
    /// Transformations applied after detection (rendering, annotation).
    PostProcessing,
    /// Result consumption. A worker here is a sink and owns the output end
    /// of the pipeline.
    Output,
}

impl StageSlot {
    /// Number of slots; sizes the registry.
    pub const COUNT: usize = 5;

    /// All slots in pipeline order.
    #[must_use]
    pub const fn all() -> [StageSlot; Self::COUNT] {
        [
            StageSlot::Input,
            StageSlot::PreProcessing,
            StageSlot::Detection,
            StageSlot::PostProcessing,
            StageSlot::Output,
        ]
    }

    /// Index of this slot within the registry.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            StageSlot::Input => 0,
            StageSlot::PreProcessing => 1,
            StageSlot::Detection => 2,
            StageSlot::PostProcessing => 3,
            StageSlot::Output => 4,
        }
    }
}

/// One registry entry: an optional worker group plus its threading flag.
pub(crate) struct SlotEntry<T> {
    /// The registered group, empty when the slot has no user workers.
    pub workers: Vec<WorkerHandle<T>>,
    /// Whether the group runs on its own thread(s). Defaults to true.
    pub on_new_thread: bool,
}

// Cloning copies the `Arc` handles, so no `T: Clone` bound is needed and a
// clone shares the same workers as the original.
impl<T> Clone for SlotEntry<T> {
    fn clone(&self) -> Self {
        Self { workers: self.workers.clone(), on_new_thread: self.on_new_thread }
    }
}

impl<T> Default for SlotEntry<T> {
    fn default() -> Self {
        Self { workers: Vec::new(), on_new_thread: true }
    }
}

/// Fixed-size registry of user-supplied worker groups, keyed by slot.
///
/// Re-registering a slot discards the previous group entirely; groups are
/// replaced, never merged or appended.
pub struct WorkerRegistry<T> {
    entries: [SlotEntry<T>; StageSlot::COUNT],
}

impl<T> WorkerRegistry<T> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: std::array::from_fn(|_| SlotEntry::default()) }
    }

    /// Replace the worker group for `slot`.
    pub fn register(&mut self, slot: StageSlot, workers: Vec<WorkerHandle<T>>, on_new_thread: bool) {
        let entry = &mut self.entries[slot.index()];
        entry.workers = workers;
        entry.on_new_thread = on_new_thread;
    }

    /// Whether a user group occupies `slot`.
    #[must_use]
    pub fn is_occupied(&self, slot: StageSlot) -> bool {
        !self.entries[slot.index()].workers.is_empty()
    }

    /// Number of workers registered for `slot`.
    #[must_use]
    pub fn group_size(&self, slot: StageSlot) -> usize {
        self.entries[slot.index()].workers.len()
    }

    /// Drop every registration.
    pub fn clear(&mut self) {
        for entry in &mut self.entries {
            entry.workers.clear();
            entry.on_new_thread = true;
        }
    }

    pub(crate) fn entry(&self, slot: StageSlot) -> &SlotEntry<T> {
        &self.entries[slot.index()]
    }
}

impl<T> Default for WorkerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for WorkerRegistry<T> {
    fn clone(&self) -> Self {
        Self { entries: self.entries.clone() }
    }
}
