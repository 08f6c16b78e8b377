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

//! Per-pass action coalescing.
//!
//! A [`TransactionQueue`] collects (target, operation) keyed jobs and runs
//! each distinct key exactly once per scheduling pass. The pass boundary is
//! explicit: the host calls [`flush`](TransactionQueue::flush) once per
//! event-loop turn or frame callback, wherever its scheduler goes idle.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::trace;
use once_cell::sync::Lazy;

/// Identity of a coalescing target. Allocated process-wide, monotonic,
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(u64);

static NEXT_TARGET_ID: AtomicU64 = AtomicU64::new(1);

impl TargetId {
    pub fn next() -> Self {
        TargetId(NEXT_TARGET_ID.fetch_add(1, Ordering::Relaxed))
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Pass {
    seen: HashSet<(TargetId, u64)>,
    jobs: Vec<Job>,
}

/// Registry that deduplicates "run this once before the pass idles"
/// requests. Jobs own whatever must stay alive until they run; draining the
/// pass drops them, so nothing is retained beyond it.
#[derive(Default)]
pub struct TransactionQueue {
    pending: Mutex<Pass>,
}

impl TransactionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job` under `(target, op)` for the current pass. A second
    /// commit with the same key before the flush is a no-op.
    pub fn commit<F>(&self, target: TargetId, op: u64, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut pass = self.pending.lock().unwrap();
        if !pass.seen.insert((target, op)) {
            trace!("coalesced duplicate op {} for {:?}", op, target);
            return;
        }
        pass.jobs.push(Box::new(job));
    }

    /// Run every job registered since the previous flush and end the pass.
    /// Jobs run outside the lock, so commits made while flushing land in
    /// the next pass. Execution order among distinct keys is unspecified.
    /// Returns how many jobs ran.
    pub fn flush(&self) -> usize {
        let drained = {
            let mut pass = self.pending.lock().unwrap();
            pass.seen.clear();
            std::mem::take(&mut pass.jobs)
        };
        let count = drained.len();
        for job in drained {
            job();
        }
        count
    }

    /// Distinct operations waiting in the current pass.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending_len() == 0
    }
}

static GLOBAL_QUEUE: Lazy<Arc<TransactionQueue>> = Lazy::new(|| Arc::new(TransactionQueue::new()));

/// Process-wide queue most hosts flush once per event-loop turn. Tests and
/// embedded hosts construct their own [`TransactionQueue`] instead.
pub fn global() -> Arc<TransactionQueue> {
    GLOBAL_QUEUE.clone()
}
