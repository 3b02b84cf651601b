//! The batch object that flows through pipeline queues.
//!
//! A `FrameBatch` groups the frames processed together as one queue item.
//! Ownership transfers with the batch: "emplace" moves a batch into the
//! pipeline, "push" clones it, and nothing in between duplicates it
//! silently.

use std::ops::{Deref, DerefMut};

/// A batch of frames flowing through the pipeline as a single item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameBatch<F> {
    frames: Vec<F>,
}

impl<F> FrameBatch<F> {
    /// Create an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Wrap a single frame as a one-item batch.
    ///
    /// This is what the single-frame convenience API uses before emplacing.
    #[must_use]
    pub fn from_frame(frame: F) -> Self {
        Self { frames: vec![frame] }
    }

    /// Append a frame to the batch.
    pub fn push_frame(&mut self, frame: F) {
        self.frames.push(frame);
    }

    /// Consume the batch, yielding its frames.
    #[must_use]
    pub fn into_frames(self) -> Vec<F> {
        self.frames
    }
}

impl<F> From<Vec<F>> for FrameBatch<F> {
    fn from(frames: Vec<F>) -> Self {
        Self { frames }
    }
}

impl<F> Deref for FrameBatch<F> {
    type Target = [F];

    fn deref(&self) -> &Self::Target {
        &self.frames
    }
}

impl<F> DerefMut for FrameBatch<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.frames
    }
}

impl<F> IntoIterator for FrameBatch<F> {
    type Item = F;
    type IntoIter = std::vec::IntoIter<F>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_frame_is_single_item() {
        let batch = FrameBatch::from_frame(7u32);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0], 7);
    }

    #[test]
    fn test_batch_collects_frames() {
        let mut batch = FrameBatch::new();
        assert!(batch.is_empty());
        batch.push_frame(1);
        batch.push_frame(2);
        assert_eq!(batch.into_frames(), vec![1, 2]);
    }
}
