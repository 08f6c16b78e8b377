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

//! Memory-bounded cache of decoded frames.
//!
//! Entries are keyed by frame index and kept inside a window anchored at
//! the current playback position. Misses are filled by decode jobs on pool
//! lanes; results whose index has left the window by the time they finish
//! are discarded, so late work never pollutes the store. Insertion and
//! eviction are the only mutually exclusive operations and hold the lock
//! for a handful of map operations at most.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use web_time::Instant;

use flipbook_dispatch::pool::QueuePool;

use crate::error::FlipbookError;
use crate::frame::ImageFrame;
use crate::memory::{resolve_budget, MemoryGauge};
use crate::source::FrameSource;

// --- Window sizing constants ---

/// Hard ceiling on entries one cache instance will hold. Past this the
/// marginal smoothness gain no longer covers the decode and memory churn.
pub const K_HARD_CEILING_ENTRIES: usize = 64;

/// Frames sampled when estimating the average per-frame cost. Enough to
/// smooth variable frame sizes without walking a long sequence.
const K_COST_SAMPLE_FRAMES: u64 = 16;

/// Tuning for one cache instance.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Fixed byte budget. `None` derives one from the memory gauge on
    /// every rebalance.
    pub budget_bytes: Option<u64>,
    /// Hard per-instance ceiling on retained entries, whatever the budget
    /// would allow.
    pub max_entries: usize,
    /// Trailing frames kept behind the anchor once the window is at least
    /// four entries wide. One trailing frame makes an immediate backwards
    /// seek free, which is the common scrub gesture.
    pub backward_span: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: None,
            max_entries: K_HARD_CEILING_ENTRIES,
            backward_span: 1,
        }
    }
}

/// The set of indices the cache should hold right now: a forward span and a
/// short backward span around the anchor, wrapping at the frame count.
/// Derived per tick, never authoritative storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheWindow {
    anchor: u64,
    frame_count: u64,
    forward: u64,
    backward: u64,
}

impl CacheWindow {
    /// Window for `anchor` given `capacity` retained entries. Capacity is
    /// clamped to `[1, frame_count]`; when it covers the whole sequence the
    /// window is every index.
    pub fn compute(anchor: u64, frame_count: u64, capacity: u64, backward_span: u64) -> Self {
        debug_assert!(frame_count >= 1);
        debug_assert!(anchor < frame_count);
        let capacity = capacity.clamp(1, frame_count);
        if capacity >= frame_count {
            return Self {
                anchor,
                frame_count,
                forward: frame_count,
                backward: 0,
            };
        }
        let backward = if capacity >= 4 {
            backward_span.min(capacity - 2)
        } else {
            0
        };
        Self {
            anchor,
            frame_count,
            forward: capacity - backward,
            backward,
        }
    }

    pub fn anchor(&self) -> u64 {
        self.anchor
    }

    /// Number of indices in the window.
    pub fn len(&self) -> u64 {
        self.forward + self.backward
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `index` falls inside the window, wrapping arithmetic.
    pub fn contains(&self, index: u64) -> bool {
        if index >= self.frame_count {
            return false;
        }
        let n = self.frame_count;
        let ahead = (index + n - self.anchor) % n;
        if ahead < self.forward {
            return true;
        }
        let behind = (self.anchor + n - index) % n;
        behind != 0 && behind <= self.backward
    }

    /// Indices in decode-priority order: the anchor forward, then the
    /// backward span.
    pub fn indices(&self) -> impl Iterator<Item = u64> {
        let n = self.frame_count;
        let anchor = self.anchor;
        let forward = (0..self.forward).map(move |i| (anchor + i) % n);
        let backward = (1..=self.backward).map(move |i| (anchor + n - i) % n);
        forward.chain(backward)
    }
}

/// Counters exposed to hosts, serializable for dashboards.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    /// Decodes that finished after their index left the window.
    pub stale_decodes: u64,
    pub decode_failures: u64,
    /// Synchronous first-frame decodes before playback started.
    pub poster_decodes: u64,
    pub entries: usize,
    pub resident_bytes: u64,
    /// Entries the current budget allows.
    pub window_capacity: u64,
}

/// One cached decode result. Entries never leave the cache; `get` hands out
/// the shared image, not the entry.
struct BufferEntry {
    image: Arc<ImageFrame>,
    cost: u64,
}

struct CacheState {
    entries: BTreeMap<u64, BufferEntry>,
    in_flight: HashSet<u64>,
    window: CacheWindow,
    capacity: u64,
    hard_ceiling: usize,
    resident_bytes: u64,
    stats: CacheStats,
}

impl CacheState {
    fn insert(&mut self, index: u64, image: Arc<ImageFrame>, cost: u64) {
        if let Some(old) = self.entries.insert(index, BufferEntry { image, cost }) {
            self.resident_bytes = self.resident_bytes.saturating_sub(old.cost);
        }
        self.resident_bytes += cost;
        self.stats.inserts += 1;
        self.enforce_ceiling();
    }

    fn remove(&mut self, index: u64) {
        if let Some(old) = self.entries.remove(&index) {
            self.resident_bytes = self.resident_bytes.saturating_sub(old.cost);
        }
    }

    /// Drop entries outside the window until the hard ceiling holds.
    fn enforce_ceiling(&mut self) {
        while self.entries.len() > self.hard_ceiling {
            let victim = self
                .entries
                .keys()
                .copied()
                .find(|&index| !self.window.contains(index));
            match victim {
                Some(index) => {
                    self.remove(index);
                    self.stats.evictions += 1;
                }
                None => break,
            }
        }
    }

    fn evict_outside(&mut self, window: &CacheWindow) -> usize {
        let doomed: Vec<u64> = self
            .entries
            .keys()
            .copied()
            .filter(|&index| !window.contains(index))
            .collect();
        let dropped = doomed.len();
        for index in doomed {
            self.remove(index);
            self.stats.evictions += 1;
        }
        dropped
    }
}

struct CacheShared {
    source: Arc<dyn FrameSource>,
    state: Mutex<CacheState>,
    playback_started: AtomicBool,
}

/// Memory-bounded store of decoded frames, keyed by index.
///
/// Cloning yields another handle to the same underlying cache; the driver
/// keeps one and hands clones to coalesced maintenance jobs.
#[derive(Clone)]
pub struct FrameCache {
    shared: Arc<CacheShared>,
    pool: Arc<QueuePool>,
    gauge: Arc<dyn MemoryGauge>,
    config: CacheConfig,
}

impl FrameCache {
    pub fn new(
        source: Arc<dyn FrameSource>,
        pool: Arc<QueuePool>,
        gauge: Arc<dyn MemoryGauge>,
        config: CacheConfig,
    ) -> crate::error::Result<Self> {
        let frame_count = source.frame_count();
        if frame_count == 0 {
            return Err(FlipbookError::InvalidFrameSource(
                "frame count is zero".into(),
            ));
        }
        let budget = config
            .budget_bytes
            .unwrap_or_else(|| resolve_budget(gauge.as_ref()));
        let capacity = Self::capacity_for_budget(source.as_ref(), budget, config.max_entries);
        let window = CacheWindow::compute(0, frame_count, capacity, config.backward_span);
        debug!(
            "frame cache: {} frames, budget {} bytes, window capacity {}",
            frame_count, budget, capacity
        );
        let state = CacheState {
            entries: BTreeMap::new(),
            in_flight: HashSet::new(),
            window,
            capacity,
            hard_ceiling: config.max_entries.max(1),
            resident_bytes: 0,
            stats: CacheStats::default(),
        };
        Ok(Self {
            shared: Arc::new(CacheShared {
                source,
                state: Mutex::new(state),
                playback_started: AtomicBool::new(false),
            }),
            pool,
            gauge,
            config,
        })
    }

    /// Entries the budget supports at the source's average frame cost,
    /// clamped to `[1, min(frame_count, max_entries)]`.
    fn capacity_for_budget(source: &dyn FrameSource, budget_bytes: u64, max_entries: usize) -> u64 {
        let frame_count = source.frame_count();
        let sampled = frame_count.min(K_COST_SAMPLE_FRAMES).max(1);
        let mut total = 0u64;
        for index in 0..sampled {
            total += source.byte_cost_at(index).max(1);
        }
        let average = (total / sampled).max(1);
        let by_budget = budget_bytes / average;
        if by_budget == 0 {
            warn!(
                "budget {} bytes is below one frame (average cost {}); window clamped to 1",
                budget_bytes, average
            );
        }
        by_budget.clamp(1, (max_entries as u64).max(1).min(frame_count))
    }

    /// Cached frame at `index`, or `None` without blocking. One exception:
    /// while the cache is empty and playback has never started, a miss
    /// decodes inline so hosts can show a poster frame before the first
    /// tick.
    pub fn get(&self, index: u64) -> Option<Arc<ImageFrame>> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(entry) = state.entries.get(&index) {
                let image = entry.image.clone();
                state.stats.hits += 1;
                return Some(image);
            }
            state.stats.misses += 1;
            if !state.entries.is_empty() || self.shared.playback_started.load(Ordering::Acquire) {
                return None;
            }
        }
        self.decode_poster(index)
    }

    fn decode_poster(&self, index: u64) -> Option<Arc<ImageFrame>> {
        match self.shared.source.frame_at(index) {
            Ok(image) => {
                let cost = image.byte_len();
                let mut state = self.shared.state.lock().unwrap();
                state.stats.poster_decodes += 1;
                state.insert(index, image.clone(), cost);
                Some(image)
            }
            Err(e) => {
                warn!("poster decode of frame {} failed: {}", index, e);
                self.shared.state.lock().unwrap().stats.decode_failures += 1;
                None
            }
        }
    }

    /// Called by the driver when playback starts; retires the synchronous
    /// poster path for the rest of this cache's life.
    pub fn mark_playback_started(&self) {
        self.shared.playback_started.store(true, Ordering::Release);
    }

    /// Schedule background decode of every window index that is neither
    /// resident nor already in flight. Publication happens as the lanes
    /// finish; anything whose index has left the window by then is
    /// discarded.
    pub fn prefetch(&self, window: &CacheWindow) {
        let missing: Vec<u64> = {
            let mut state = self.shared.state.lock().unwrap();
            state.window = window.clone();
            let mut missing = Vec::new();
            for index in window.indices() {
                if !state.entries.contains_key(&index) && !state.in_flight.contains(&index) {
                    missing.push(index);
                }
            }
            for &index in &missing {
                state.in_flight.insert(index);
            }
            missing
        };
        for index in missing {
            let shared = self.shared.clone();
            self.pool.execute(move || {
                decode_into(&shared, index);
            });
        }
    }

    /// Drop every entry whose index is not in `keep`. Memory is reclaimed
    /// immediately.
    pub fn evict<I>(&self, keep: I)
    where
        I: IntoIterator<Item = u64>,
    {
        let keep: HashSet<u64> = keep.into_iter().collect();
        let mut state = self.shared.state.lock().unwrap();
        let doomed: Vec<u64> = state
            .entries
            .keys()
            .copied()
            .filter(|index| !keep.contains(index))
            .collect();
        for index in doomed {
            state.remove(index);
            state.stats.evictions += 1;
        }
    }

    /// Recompute the allowed window size for `max_bytes`. A larger average
    /// per-frame cost yields a smaller window. Returns the new capacity in
    /// entries.
    pub fn resize(&self, max_bytes: u64) -> u64 {
        let capacity = Self::capacity_for_budget(
            self.shared.source.as_ref(),
            max_bytes,
            self.config.max_entries,
        );
        let mut state = self.shared.state.lock().unwrap();
        state.capacity = capacity;
        debug!("cache window capacity now {} entries", capacity);
        capacity
    }

    /// Re-derive the byte budget (fixed override or memory gauge) and apply
    /// it. This is the operation the driver coalesces when several triggers
    /// land in one scheduling pass.
    pub fn rebalance(&self) -> u64 {
        let budget = self
            .config
            .budget_bytes
            .unwrap_or_else(|| resolve_budget(self.gauge.as_ref()));
        self.resize(budget)
    }

    /// Per-tick maintenance: compute the window for `anchor`, drop entries
    /// outside it and schedule decode of the missing ones.
    pub fn retarget(&self, anchor: u64) -> CacheWindow {
        let window = {
            let mut state = self.shared.state.lock().unwrap();
            let window = CacheWindow::compute(
                anchor,
                self.shared.source.frame_count(),
                state.capacity,
                self.config.backward_span,
            );
            state.window = window.clone();
            state.evict_outside(&window);
            window
        };
        self.prefetch(&window);
        window
    }

    /// Memory-pressure hook. Shrinks immediately to the anchor and the
    /// frame after it; the reduced capacity stays until the next resize or
    /// rebalance.
    pub fn on_memory_pressure(&self) {
        let frame_count = self.shared.source.frame_count();
        let mut state = self.shared.state.lock().unwrap();
        state.capacity = 2.min(frame_count);
        let window = CacheWindow::compute(state.window.anchor(), frame_count, state.capacity, 0);
        state.window = window.clone();
        let dropped = state.evict_outside(&window);
        debug!(
            "memory pressure: dropped {} entries, window now {} wide",
            dropped,
            window.len()
        );
    }

    pub fn contains(&self, index: u64) -> bool {
        self.shared.state.lock().unwrap().entries.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn window_capacity(&self) -> u64 {
        self.shared.state.lock().unwrap().capacity
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        let state = self.shared.state.lock().unwrap();
        let mut stats = state.stats.clone();
        stats.entries = state.entries.len();
        stats.resident_bytes = state.resident_bytes;
        stats.window_capacity = state.capacity;
        stats
    }
}

/// Lane-side decode body. Lock is taken only after the decode finishes, for
/// the few map operations that publish or discard the result.
fn decode_into(shared: &CacheShared, index: u64) {
    let started = Instant::now();
    let result = shared.source.frame_at(index);
    let mut state = shared.state.lock().unwrap();
    state.in_flight.remove(&index);
    match result {
        Ok(image) => {
            if !state.window.contains(index) {
                state.stats.stale_decodes += 1;
                trace!("discarding frame {} decoded after leaving the window", index);
                return;
            }
            let cost = image.byte_len();
            state.insert(index, image, cost);
            trace!("decoded frame {} in {:?}", index, started.elapsed());
        }
        Err(e) => {
            state.stats.decode_failures += 1;
            warn!("decode of frame {} failed: {}", index, e);
        }
    }
}
