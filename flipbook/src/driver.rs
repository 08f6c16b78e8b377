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

//! Playback state machine ticked by the host's refresh signal.
//!
//! The driver owns a frame source and its cache, advances the current index
//! from the elapsed time the host reports, and presents frames to a borrowed
//! [`DisplaySurface`]. It never blocks a tick on decode work: a frame that
//! is not resident yet leaves the previous content on the surface while the
//! cache catches up on its lanes.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use flipbook_dispatch::pool::{self, QosTier, QueuePool};
use flipbook_dispatch::transaction::{self, TargetId, TransactionQueue};

use crate::cache::{CacheConfig, FrameCache};
use crate::error::{FlipbookError, Result};
use crate::frame::ImageFrame;
use crate::memory::{FixedBudget, MemoryGauge};
use crate::source::FrameSource;

/// Floor applied to per-frame durations while ticking. Animated GIF tooling
/// has treated sub-10ms delays as "as fast as possible" for decades and
/// browsers round them up; the floor also keeps the advance loop from
/// spinning on a zero-duration source.
pub const K_MIN_FRAME_DURATION: Duration = Duration::from_millis(10);

/// Default multiple of the average frame duration one tick may consume.
/// After a stall (window drag, app resume) the driver catches up by at most
/// this much and drops the rest instead of fast-forwarding the whole gap.
pub const K_MAX_CATCHUP_FACTOR: u32 = 3;

/// Assumed available memory when the host has no platform gauge. Deliberately
/// conservative; hosts with a real signal should pass their own gauge.
pub const K_DEFAULT_AVAILABLE_BYTES: u64 = 256 * 1024 * 1024;

/// Frames sampled when computing the average frame duration at construction.
const K_DURATION_SAMPLE_FRAMES: u64 = 256;

/// Operation identity for the coalesced cache rebalance.
const OP_REBALANCE: u64 = 1;

/// Opaque target the driver presents frames to. Borrowed per tick; the
/// driver never keeps a reference to it.
pub trait DisplaySurface {
    fn present(&mut self, frame: &Arc<ImageFrame>);
}

/// Tuning for one driver instance.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub cache: CacheConfig,
    pub min_frame_duration: Duration,
    pub max_catchup_factor: u32,
    /// Begin playback as soon as the driver is constructed.
    pub autoplay: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            min_frame_duration: K_MIN_FRAME_DURATION,
            max_catchup_factor: K_MAX_CATCHUP_FACTOR,
            autoplay: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackStatus {
    Stopped,
    Playing,
    Paused,
}

/// Snapshot of the driver's position, serializable for host dashboards.
/// Mutated only on the tick thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackState {
    pub current_index: u64,
    pub elapsed_in_current_frame: Duration,
    pub loop_count: u64,
    pub status: PlaybackStatus,
}

impl PlaybackState {
    pub fn is_playing(&self) -> bool {
        self.status == PlaybackStatus::Playing
    }
}

type IndexCallback = Box<dyn Fn(u64) + Send + Sync>;

/// Drives one animated sequence: owns the source and cache, is ticked once
/// per display refresh, and publishes to a borrowed surface.
pub struct PlaybackDriver {
    source: Arc<dyn FrameSource>,
    cache: FrameCache,
    transactions: Arc<TransactionQueue>,
    target: TargetId,
    state: PlaybackState,
    last_published: Option<Arc<ImageFrame>>,
    average_frame_duration: Duration,
    config: DriverConfig,
    on_frame_changed: Option<IndexCallback>,
    on_loop_end: Option<IndexCallback>,
}

impl PlaybackDriver {
    pub fn new(
        source: Arc<dyn FrameSource>,
        pool: Arc<QueuePool>,
        gauge: Arc<dyn MemoryGauge>,
        transactions: Arc<TransactionQueue>,
        config: DriverConfig,
    ) -> Result<Self> {
        let cache = FrameCache::new(source.clone(), pool, gauge, config.cache.clone())?;
        let average_frame_duration = average_duration(source.as_ref(), config.min_frame_duration);
        let mut driver = Self {
            source,
            cache,
            transactions,
            target: TargetId::next(),
            state: PlaybackState {
                current_index: 0,
                elapsed_in_current_frame: Duration::ZERO,
                loop_count: 0,
                status: PlaybackStatus::Stopped,
            },
            last_published: None,
            average_frame_duration,
            config,
            on_frame_changed: None,
            on_loop_end: None,
        };
        if driver.config.autoplay {
            driver.start();
        }
        Ok(driver)
    }

    /// Driver on the global utility pool and transaction queue, with a
    /// conservative fixed memory assumption. The common entry point for
    /// hosts without their own pool or platform gauge.
    pub fn with_defaults(source: Arc<dyn FrameSource>) -> Result<Self> {
        Self::new(
            source,
            pool::global(QosTier::Utility),
            Arc::new(FixedBudget(K_DEFAULT_AVAILABLE_BYTES)),
            transaction::global(),
            DriverConfig::default(),
        )
    }

    /// `Stopped|Paused -> Playing`. No-op while already playing. Starting
    /// from `Stopped` clears the loop count and elapsed accumulator so
    /// playback restarts cleanly after a finished run.
    pub fn start(&mut self) {
        match self.state.status {
            PlaybackStatus::Playing => {}
            PlaybackStatus::Paused => {
                self.state.status = PlaybackStatus::Playing;
                debug!("playback resumed at frame {}", self.state.current_index);
            }
            PlaybackStatus::Stopped => {
                self.state.status = PlaybackStatus::Playing;
                self.state.loop_count = 0;
                self.state.elapsed_in_current_frame = Duration::ZERO;
                self.cache.mark_playback_started();
                self.cache.retarget(self.state.current_index);
                debug!("playback started at frame {}", self.state.current_index);
            }
        }
    }

    /// `* -> Stopped`, rewinding to frame 0 and clearing the loop count.
    pub fn stop(&mut self) {
        self.state.status = PlaybackStatus::Stopped;
        self.state.current_index = 0;
        self.state.loop_count = 0;
        self.state.elapsed_in_current_frame = Duration::ZERO;
        debug!("playback stopped");
    }

    /// `Playing -> Paused`, position retained. No-op otherwise.
    pub fn pause(&mut self) {
        if self.state.status == PlaybackStatus::Playing {
            self.state.status = PlaybackStatus::Paused;
            debug!("playback paused at frame {}", self.state.current_index);
        }
    }

    /// Advance playback by `elapsed` and publish the current frame.
    ///
    /// Called once per display refresh with the wall time since the previous
    /// tick. Irregular gaps are clamped to a small multiple of the average
    /// frame duration and the remainder dropped, so a stalled host resumes
    /// near where it left off instead of fast-forwarding.
    pub fn tick(&mut self, elapsed: Duration, surface: &mut dyn DisplaySurface) {
        if !self.state.is_playing() {
            return;
        }
        let n = self.source.frame_count();
        if n == 1 {
            // Static image: publish once, then ignore elapsed time entirely.
            if self.last_published.is_none() {
                self.publish(0, surface);
            }
            return;
        }

        let clamp = self.average_frame_duration * self.config.max_catchup_factor;
        self.state.elapsed_in_current_frame += elapsed.min(clamp);

        let previous_index = self.state.current_index;
        loop {
            let duration = self.frame_duration(self.state.current_index);
            if self.state.elapsed_in_current_frame < duration {
                break;
            }
            self.state.elapsed_in_current_frame -= duration;
            self.state.current_index = (self.state.current_index + 1) % n;
            if self.state.current_index == 0 {
                self.state.loop_count += 1;
                trace!("loop {} complete", self.state.loop_count);
            }
        }

        let repeat = self.source.repeat_count();
        if repeat > 0 && self.state.loop_count >= repeat {
            self.finish();
            return;
        }

        self.publish(self.state.current_index, surface);
        self.cache.retarget(self.state.current_index);
        if self.state.current_index != previous_index {
            trace!(
                "frame {} -> {}",
                previous_index,
                self.state.current_index
            );
            self.notify_frame_changed(self.state.current_index);
        }
    }

    /// Jump to `index`: resets the elapsed accumulator, retargets the cache
    /// and publishes immediately when the frame is resident. Works in every
    /// playback state.
    pub fn seek_to(&mut self, index: u64, surface: &mut dyn DisplaySurface) -> Result<()> {
        let frame_count = self.source.frame_count();
        if index >= frame_count {
            return Err(FlipbookError::IndexOutOfRange { index, frame_count });
        }
        let previous_index = self.state.current_index;
        self.state.current_index = index;
        self.state.elapsed_in_current_frame = Duration::ZERO;
        self.cache.retarget(index);
        self.publish(index, surface);
        if index != previous_index {
            self.notify_frame_changed(index);
        }
        debug!("seek to frame {}", index);
        Ok(())
    }

    /// Whether the host needs to keep delivering refresh ticks. False for a
    /// single-frame source, which `tick` publishes once and then ignores.
    pub fn needs_ticks(&self) -> bool {
        self.source.frame_count() > 1
    }

    /// Current frame if resident. Before the first `start` this may decode
    /// frame content synchronously so hosts can show a poster frame.
    pub fn current_frame(&self) -> Option<Arc<ImageFrame>> {
        self.cache.get(self.state.current_index)
    }

    /// Schedule one cache rebalance through the transaction queue. Any
    /// number of calls within a pass collapse to a single rebalance at the
    /// next flush; hosts call this when their memory gauge moved.
    pub fn schedule_rebalance(&self) {
        let cache = self.cache.clone();
        self.transactions.commit(self.target, OP_REBALANCE, move || {
            let capacity = cache.rebalance();
            trace!("coalesced rebalance ran, window capacity {}", capacity);
        });
    }

    pub fn state(&self) -> PlaybackState {
        self.state.clone()
    }

    pub fn status(&self) -> PlaybackStatus {
        self.state.status
    }

    pub fn cache(&self) -> &FrameCache {
        &self.cache
    }

    pub fn target(&self) -> TargetId {
        self.target
    }

    pub fn set_on_frame_changed<F>(&mut self, callback: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.on_frame_changed = Some(Box::new(callback));
    }

    pub fn set_on_loop_end<F>(&mut self, callback: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.on_loop_end = Some(Box::new(callback));
    }

    /// Repeat count reached: stop in place, keeping the loop count and the
    /// final frame on the surface. The public `stop` is the one that rewinds.
    fn finish(&mut self) {
        self.state.status = PlaybackStatus::Stopped;
        self.state.elapsed_in_current_frame = Duration::ZERO;
        debug!("playback finished after {} loops", self.state.loop_count);
        if let Some(callback) = &self.on_loop_end {
            callback(self.state.loop_count);
        }
    }

    fn publish(&mut self, index: u64, surface: &mut dyn DisplaySurface) {
        match self.cache.get(index) {
            Some(image) => {
                surface.present(&image);
                self.last_published = Some(image);
            }
            None => {
                // Cache is lagging; keep the previous content up rather
                // than stall the tick waiting for decode.
                if let Some(image) = &self.last_published {
                    surface.present(image);
                }
            }
        }
    }

    fn frame_duration(&self, index: u64) -> Duration {
        self.source
            .duration_at(index)
            .max(self.config.min_frame_duration)
    }

    fn notify_frame_changed(&self, index: u64) {
        if let Some(callback) = &self.on_frame_changed {
            callback(index);
        }
    }
}

/// Average floored frame duration over a bounded sample. The source contract
/// is immutable, so one pass at construction is enough.
fn average_duration(source: &dyn FrameSource, floor: Duration) -> Duration {
    let sampled = source.frame_count().clamp(1, K_DURATION_SAMPLE_FRAMES);
    let mut total = Duration::ZERO;
    for index in 0..sampled {
        total += source.duration_at(index).max(floor);
    }
    total / sampled as u32
}
