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

//! Bounded worker-queue pools.
//!
//! A [`QueuePool`] runs a fixed set of independent FIFO lanes for one
//! priority tier. Jobs submitted to the same lane execute in submission
//! order and never overlap; jobs on different lanes run concurrently. The
//! pool bounds total worker-thread count under heavy churn while still
//! parallelizing independent work streams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use once_cell::sync::Lazy;

/// Most lanes a single pool will run, whatever count was requested.
pub const MAX_LANES: usize = 32;

/// Priority class of a pool's lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QosTier {
    Background,
    Utility,
    Default,
    UserInteractive,
}

impl QosTier {
    /// Label used in thread names and log lines.
    pub fn label(self) -> &'static str {
        match self {
            QosTier::Background => "background",
            QosTier::Utility => "utility",
            QosTier::Default => "default",
            QosTier::UserInteractive => "interactive",
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

enum LaneMessage {
    /// A job to run on the lane thread.
    Run(Job),
    /// A signal to shut the lane thread down.
    Shutdown,
}

/// One strictly ordered submission point: a dedicated worker thread fed by
/// a channel. Jobs sent to the same lane run in submission order.
pub struct Lane {
    sender: Sender<LaneMessage>,
    handle: Option<JoinHandle<()>>,
}

impl Lane {
    fn spawn(name: String) -> Self {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        LaneMessage::Run(job) => job(),
                        LaneMessage::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn lane thread");
        Self {
            sender,
            handle: Some(handle),
        }
    }

    /// Submit a job to this lane. Never blocks on the job itself.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.sender.send(LaneMessage::Run(Box::new(job))).is_err() {
            warn!("lane thread is gone; dropping job");
        }
    }
}

impl Drop for Lane {
    fn drop(&mut self) {
        // Shutdown queues behind every pending job, so queued work finishes
        // before the thread exits.
        let _ = self.sender.send(LaneMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("lane thread panicked before shutdown");
            }
        }
    }
}

/// A fixed set of independent FIFO lanes sharing one priority tier.
pub struct QueuePool {
    name: String,
    tier: QosTier,
    lanes: Vec<Lane>,
    next_lane: AtomicUsize,
}

impl QueuePool {
    /// Create a pool with `lane_count` lanes. Counts outside
    /// `[1, MAX_LANES]` are clamped with a warning rather than rejected.
    pub fn new(name: &str, tier: QosTier, lane_count: usize) -> Self {
        let clamped = lane_count.clamp(1, MAX_LANES);
        if clamped != lane_count {
            warn!(
                "pool '{}': lane count {} clamped to {}",
                name, lane_count, clamped
            );
        }
        let lanes = (0..clamped)
            .map(|i| Lane::spawn(format!("{}-{}", name, i)))
            .collect();
        debug!(
            "pool '{}' ({}) started with {} lanes",
            name,
            tier.label(),
            clamped
        );
        Self {
            name: name.to_string(),
            tier,
            lanes,
            next_lane: AtomicUsize::new(0),
        }
    }

    /// Acquire one lane, selected round-robin across the pool.
    pub fn lane(&self) -> &Lane {
        let next = self.next_lane.fetch_add(1, Ordering::Relaxed);
        &self.lanes[next % self.lanes.len()]
    }

    /// Submit a job to the next lane in round-robin order.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.lane().execute(job);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tier(&self) -> QosTier {
        self.tier
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }
}

/// Lane count used by the process-wide pools: one per available core,
/// clamped to `[1, MAX_LANES]`.
pub fn default_lane_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, MAX_LANES)
}

fn new_global(tier: QosTier) -> Arc<QueuePool> {
    Arc::new(QueuePool::new(
        &format!("flipbook-{}", tier.label()),
        tier,
        default_lane_count(),
    ))
}

static POOL_BACKGROUND: Lazy<Arc<QueuePool>> = Lazy::new(|| new_global(QosTier::Background));
static POOL_UTILITY: Lazy<Arc<QueuePool>> = Lazy::new(|| new_global(QosTier::Utility));
static POOL_DEFAULT: Lazy<Arc<QueuePool>> = Lazy::new(|| new_global(QosTier::Default));
static POOL_USER_INTERACTIVE: Lazy<Arc<QueuePool>> =
    Lazy::new(|| new_global(QosTier::UserInteractive));

/// Process-wide pool for `tier`, created on first access and shared for the
/// lifetime of the process. Consumers that want isolation (tests, embedded
/// hosts) construct their own [`QueuePool`] and inject it instead.
pub fn global(tier: QosTier) -> Arc<QueuePool> {
    match tier {
        QosTier::Background => POOL_BACKGROUND.clone(),
        QosTier::Utility => POOL_UTILITY.clone(),
        QosTier::Default => POOL_DEFAULT.clone(),
        QosTier::UserInteractive => POOL_USER_INTERACTIVE.clone(),
    }
}
