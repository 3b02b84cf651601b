//! Per-stage configuration records and the built-in stage seam.
//!
//! The records below are opaque payloads as far as the pipeline core is
//! concerned: the facade stores them wholesale on each `configure` call
//! (last write wins, no field-level merging) and hands them to the
//! [`StageFactory`] at build time. The core never interprets their fields;
//! only the factory does.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::slot::StageSlot;
use crate::worker::WorkerHandle;

/// Body pose estimation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseConfig {
    /// Whether the pose stage participates when no user worker is injected.
    pub enable: bool,
    /// Model input resolution, `(width, height)`.
    pub net_resolution: (u32, u32),
    /// Number of parallel workers for the stage group.
    pub workers: usize,
    /// Whether to render keypoints onto the frame.
    pub render: bool,
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self { enable: false, net_resolution: (656, 368), workers: 1, render: false }
    }
}

/// Face detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceConfig {
    /// Whether the face stage participates when no user worker is injected.
    pub enable: bool,
    /// Model input resolution, `(width, height)`.
    pub net_resolution: (u32, u32),
    /// Whether to render keypoints onto the frame.
    pub render: bool,
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self { enable: false, net_resolution: (368, 368), render: false }
    }
}

/// Hand detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandConfig {
    /// Whether the hand stage participates when no user worker is injected.
    pub enable: bool,
    /// Model input resolution, `(width, height)`.
    pub net_resolution: (u32, u32),
    /// Number of refinement passes per detection.
    pub scale_count: usize,
    /// Whether to render keypoints onto the frame.
    pub render: bool,
}

impl Default for HandConfig {
    fn default() -> Self {
        Self { enable: false, net_resolution: (368, 368), scale_count: 1, render: false }
    }
}

/// Extra post-detection settings (3-D reconstruction and the like).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtraConfig {
    /// Whether the extra stage participates when no user worker is injected.
    pub enable: bool,
    /// Identity-tracking interval in frames; 0 disables tracking.
    pub tracking_interval: u32,
}

/// Frame producer settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Whether the built-in producer participates when no user worker is
    /// injected on the Input slot.
    pub enable: bool,
    /// Producer locator (video path, camera index), opaque to the core.
    pub source: Option<String>,
    /// Stop producing after this many frames; `None` means unbounded.
    pub frame_limit: Option<u64>,
}

/// Result consumer settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Whether the built-in consumer participates when no user worker is
    /// injected on the Output slot.
    pub enable: bool,
    /// Consumer destination (file path, display name), opaque to the core.
    pub destination: Option<String>,
}

/// All six records, stored and replaced as one unit by `configure`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageConfigs {
    /// Pose estimation record.
    pub pose: PoseConfig,
    /// Face detection record.
    pub face: FaceConfig,
    /// Hand detection record.
    pub hand: HandConfig,
    /// Extra processing record.
    pub extra: ExtraConfig,
    /// Frame producer record.
    pub input: InputConfig,
    /// Result consumer record.
    pub output: OutputConfig,
}

/// Builds the default worker group for a slot from the current records.
///
/// This is the seam to the actual stage logic (detection, rendering,
/// encoding), which lives outside the pipeline core. Returning `None`
/// leaves the slot disabled: the graph skips it entirely and downstream
/// queue identity is unaffected.
pub trait StageFactory<T>: Send + Sync {
    /// Build the built-in worker group for `slot`, or `None` if the
    /// configuration leaves the slot disabled.
    fn build(&self, slot: StageSlot, configs: &StageConfigs) -> Option<Vec<WorkerHandle<T>>>;
}

/// Shared handle to a stage factory.
pub type StageFactoryHandle<T> = Arc<dyn StageFactory<T>>;

/// The default factory: no built-in stages at all.
///
/// With this factory every slot is driven purely by injected workers, which
/// is the common arrangement for callers that feed and drain the pipeline
/// through the boundary API.
pub struct NoBuiltinStages;

impl<T> StageFactory<T> for NoBuiltinStages {
    fn build(&self, _slot: StageSlot, _configs: &StageConfigs) -> Option<Vec<WorkerHandle<T>>> {
        None
    }
}
