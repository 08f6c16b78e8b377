/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! The frame-source capability contract and its in-memory implementation.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{FlipbookError, Result};
use crate::frame::ImageFrame;

/// Capability contract every frame provider implements: a container decoder,
/// a sprite sheet, a list of discrete assets. The engine never inspects what
/// is behind it.
///
/// Implementations are shared between the owning thread and decode lanes, so
/// the contract is `Send + Sync` and every accessor takes `&self`. The
/// metadata (`frame_count`, `repeat_count`, durations, costs) must stay
/// stable for the lifetime of the value; `frame_at` is the only operation
/// allowed to be expensive.
pub trait FrameSource: Send + Sync {
    /// Total number of frames. A conforming source has at least 1.
    fn frame_count(&self) -> u64;

    /// How many times the sequence plays before stopping. 0 means forever.
    fn repeat_count(&self) -> u64;

    /// Estimated decoded size in bytes of the frame at `index`.
    fn byte_cost_at(&self, index: u64) -> u64;

    /// Produce the frame at `index`. May be slow; the cache calls this from
    /// decode lanes.
    fn frame_at(&self, index: u64) -> Result<Arc<ImageFrame>>;

    /// How long the frame at `index` stays on screen.
    fn duration_at(&self, index: u64) -> Duration;
}

/// In-memory frame source: pre-decoded frames with either one shared
/// duration or one duration per frame.
pub struct FrameSequence {
    frames: Vec<Arc<ImageFrame>>,
    durations: Vec<Duration>,
    repeat_count: u64,
}

impl FrameSequence {
    /// Build from per-frame durations. `durations` must be as long as
    /// `frames`, and `frames` must not be empty.
    pub fn new(
        frames: Vec<ImageFrame>,
        durations: Vec<Duration>,
        repeat_count: u64,
    ) -> Result<Self> {
        if frames.is_empty() {
            return Err(FlipbookError::InvalidFrameSource("no frames".into()));
        }
        if durations.len() != frames.len() {
            return Err(FlipbookError::InvalidFrameSource(format!(
                "{} frames but {} durations",
                frames.len(),
                durations.len()
            )));
        }
        Ok(Self {
            frames: frames.into_iter().map(Arc::new).collect(),
            durations,
            repeat_count,
        })
    }

    /// Build with one shared duration for every frame.
    pub fn with_uniform_duration(
        frames: Vec<ImageFrame>,
        duration: Duration,
        repeat_count: u64,
    ) -> Result<Self> {
        let count = frames.len();
        Self::new(frames, vec![duration; count], repeat_count)
    }
}

impl FrameSource for FrameSequence {
    fn frame_count(&self) -> u64 {
        self.frames.len() as u64
    }

    fn repeat_count(&self) -> u64 {
        self.repeat_count
    }

    fn byte_cost_at(&self, index: u64) -> u64 {
        self.frames
            .get(index as usize)
            .map(|frame| frame.byte_len())
            .unwrap_or(0)
    }

    fn frame_at(&self, index: u64) -> Result<Arc<ImageFrame>> {
        self.frames.get(index as usize).cloned().ok_or_else(|| {
            FlipbookError::IndexOutOfRange {
                index,
                frame_count: self.frame_count(),
            }
        })
    }

    fn duration_at(&self, index: u64) -> Duration {
        self.durations
            .get(index as usize)
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}
