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

//! Cancellable three-phase render tasks.
//!
//! A [`RenderTask`] splits display work into `prepare` (owning thread, fast),
//! `render` (pool lane, cancellable) and `commit` (owning thread again). The
//! [`AsyncRenderer`] keeps a monotonic generation counter per surface:
//! submitting a new task cancels the in-flight one, and commits for
//! superseded generations are suppressed entirely, so at most one live
//! render outcome reaches the surface even while several renders race
//! through the cancellation window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use log::trace;
use web_time::Instant;

use crate::pool::QueuePool;

/// Cooperative cancellation flag shared between a submitter and the lane
/// executing its render phase. Setting it never blocks and never preempts;
/// the render body decides when to look.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Amortized check for tight render loops: bumps `counter` and reads the
    /// flag only once every `interval` calls. The poll cadence is the task
    /// author's tunable; pick the largest interval whose worst-case abort
    /// latency is still acceptable for the surface being drawn.
    pub fn poll_every(&self, counter: &mut u32, interval: u32) -> bool {
        *counter += 1;
        if *counter >= interval.max(1) {
            *counter = 0;
            self.is_cancelled()
        } else {
            false
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Scratch bitmap a render phase draws into. Tightly packed RGBA8, zeroed
/// at submission.
pub struct RenderTarget {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl RenderTarget {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * 4],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn fill(&mut self, rgba: [u8; 4]) {
        for px in self.data.chunks_exact_mut(4) {
            px.copy_from_slice(&rgba);
        }
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        if x < self.width && y < self.height {
            let i = (y as usize * self.width as usize + x as usize) * 4;
            self.data[i..i + 4].copy_from_slice(&rgba);
        }
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// What a finished render phase produced.
pub struct RenderOutcome {
    pub target: RenderTarget,
    /// False when the render phase observed cancellation and returned early;
    /// the target may be partially drawn.
    pub completed: bool,
}

/// A cancellable unit of display work, generic over the surface type `S` it
/// is committed to. The surface itself never leaves the owning thread; only
/// the task crosses to a lane, which is why the trait is `Send` and the
/// surface type need not be.
pub trait RenderTask<S>: Send {
    /// Runs on the owning thread before the render is scheduled. Snapshot
    /// whatever state the render phase needs; must be fast.
    fn prepare(&mut self, surface: &mut S);

    /// Runs on a pool lane. Poll `cancel` between units of work and return
    /// early when it fires; whatever was drawn so far is discarded or
    /// delivered as incomplete, never presented as finished.
    fn render(&mut self, target: &mut RenderTarget, cancel: &CancelToken);

    /// Runs back on the owning thread via [`AsyncRenderer::drain`]. Not
    /// called at all when a newer submission superseded this task.
    fn commit(self: Box<Self>, surface: &mut S, outcome: RenderOutcome);
}

/// Submitter-side handle for one scheduled render: the generation it was
/// issued under and the cancellation flag shared with the executing lane.
pub struct TaskHandle {
    generation: u64,
    token: CancelToken,
}

impl TaskHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct Completion<S> {
    generation: u64,
    task: Box<dyn RenderTask<S>>,
    outcome: RenderOutcome,
}

/// Owner-side scheduler for render tasks over one surface.
///
/// Completions come back through an internal channel and are delivered by
/// [`drain`](Self::drain) on the owning thread; nothing here ever blocks on
/// a lane.
pub struct AsyncRenderer<S> {
    pool: Arc<QueuePool>,
    generation: u64,
    active: Option<CancelToken>,
    completions_tx: Sender<Completion<S>>,
    completions_rx: Receiver<Completion<S>>,
}

impl<S: 'static> AsyncRenderer<S> {
    pub fn new(pool: Arc<QueuePool>) -> Self {
        let (completions_tx, completions_rx) = mpsc::channel();
        Self {
            pool,
            generation: 0,
            active: None,
            completions_tx,
            completions_rx,
        }
    }

    /// Generation of the most recent submission.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancel the in-flight task, if any, without submitting a replacement.
    /// Its commit still arrives through `drain` with `completed = false`.
    pub fn cancel(&self) {
        if let Some(token) = &self.active {
            token.cancel();
        }
    }

    /// Run `prepare` inline, cancel the previous in-flight task and ship the
    /// render phase to a pool lane. Returns the handle owning cancellation
    /// for this submission.
    pub fn submit<T>(&mut self, mut task: T, width: u32, height: u32, surface: &mut S) -> TaskHandle
    where
        T: RenderTask<S> + 'static,
    {
        task.prepare(surface);

        if let Some(previous) = self.active.take() {
            previous.cancel();
        }
        self.generation += 1;
        let generation = self.generation;
        let token = CancelToken::new();
        self.active = Some(token.clone());

        let tx = self.completions_tx.clone();
        let lane_token = token.clone();
        let mut boxed: Box<dyn RenderTask<S>> = Box::new(task);
        self.pool.execute(move || {
            let started = Instant::now();
            let mut target = RenderTarget::new(width, height);
            boxed.render(&mut target, &lane_token);
            let completed = !lane_token.is_cancelled();
            trace!(
                "render generation {} finished in {:?} (completed: {})",
                generation,
                started.elapsed(),
                completed
            );
            // Receiver may be gone if the renderer was torn down first.
            let _ = tx.send(Completion {
                generation,
                task: boxed,
                outcome: RenderOutcome { target, completed },
            });
        });

        TaskHandle { generation, token }
    }

    /// Deliver finished work on the owning thread. Commits for superseded
    /// generations are dropped without side effects. Returns the number of
    /// live commits delivered.
    pub fn drain(&mut self, surface: &mut S) -> usize {
        let mut delivered = 0;
        while let Ok(completion) = self.completions_rx.try_recv() {
            if completion.generation != self.generation {
                trace!(
                    "dropping stale render generation {} (live is {})",
                    completion.generation,
                    self.generation
                );
                continue;
            }
            self.active = None;
            completion.task.commit(surface, completion.outcome);
            delivered += 1;
        }
        delivered
    }
}

/// Run a render task's three phases inline on the calling thread, the
/// synchronous display path for hosts that opted out of async rendering.
/// The token is fresh and never cancelled.
pub fn render_sync<S, T: RenderTask<S>>(mut task: T, width: u32, height: u32, surface: &mut S) {
    task.prepare(surface);
    let started = Instant::now();
    let mut target = RenderTarget::new(width, height);
    let token = CancelToken::new();
    task.render(&mut target, &token);
    trace!("synchronous render finished in {:?}", started.elapsed());
    Box::new(task).commit(
        surface,
        RenderOutcome {
            target,
            completed: true,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::QosTier;
    use std::sync::mpsc::Receiver;

    #[derive(Default)]
    struct TestSurface {
        prepared: usize,
        commits: Vec<(u8, bool)>,
    }

    /// Fills the target with one byte value; optionally parks on a gate so
    /// the test controls when the render phase runs.
    struct FillTask {
        fill: u8,
        gate: Option<Receiver<()>>,
    }

    impl FillTask {
        fn new(fill: u8) -> Self {
            Self { fill, gate: None }
        }

        fn gated(fill: u8) -> (Self, Sender<()>) {
            let (tx, rx) = mpsc::channel();
            (
                Self {
                    fill,
                    gate: Some(rx),
                },
                tx,
            )
        }
    }

    impl RenderTask<TestSurface> for FillTask {
        fn prepare(&mut self, surface: &mut TestSurface) {
            surface.prepared += 1;
        }

        fn render(&mut self, target: &mut RenderTarget, cancel: &CancelToken) {
            if let Some(gate) = &self.gate {
                let _ = gate.recv();
            }
            if cancel.is_cancelled() {
                return;
            }
            target.fill([self.fill, 0, 0, 255]);
        }

        fn commit(self: Box<Self>, surface: &mut TestSurface, outcome: RenderOutcome) {
            surface.commits.push((outcome.target.data()[0], outcome.completed));
        }
    }

    fn single_lane_pool() -> Arc<QueuePool> {
        Arc::new(QueuePool::new("task-test", QosTier::UserInteractive, 1))
    }

    fn fence(pool: &QueuePool) {
        let (tx, rx) = mpsc::channel();
        pool.execute(move || {
            let _ = tx.send(());
        });
        rx.recv().expect("lane did not drain");
    }

    #[test]
    fn completed_render_commits_with_content() {
        let pool = single_lane_pool();
        let mut renderer = AsyncRenderer::new(pool.clone());
        let mut surface = TestSurface::default();

        let handle = renderer.submit(FillTask::new(7), 4, 4, &mut surface);
        assert_eq!(handle.generation(), 1);
        assert_eq!(surface.prepared, 1);

        fence(&pool);
        let delivered = renderer.drain(&mut surface);

        assert_eq!(delivered, 1);
        assert_eq!(surface.commits, vec![(7, true)]);
    }

    #[test]
    fn newer_submission_suppresses_stale_commit() {
        let pool = single_lane_pool();
        let mut renderer = AsyncRenderer::new(pool.clone());
        let mut surface = TestSurface::default();

        let (first, release) = FillTask::gated(1);
        let g1 = renderer.submit(first, 4, 4, &mut surface);
        let g2 = renderer.submit(FillTask::new(2), 4, 4, &mut surface);

        // The first handle was cancelled the moment the second was submitted.
        assert!(g1.is_cancelled());
        assert!(!g2.is_cancelled());
        assert_eq!(g2.generation(), 2);

        release.send(()).unwrap();
        fence(&pool);
        let delivered = renderer.drain(&mut surface);

        // Only the live generation reached the surface; the superseded one
        // was dropped entirely, not delivered as incomplete.
        assert_eq!(delivered, 1);
        assert_eq!(surface.commits, vec![(2, true)]);
        assert_eq!(surface.prepared, 2);
    }

    #[test]
    fn explicit_cancel_delivers_incomplete_commit() {
        let pool = single_lane_pool();
        let mut renderer = AsyncRenderer::new(pool.clone());
        let mut surface = TestSurface::default();

        let (task, release) = FillTask::gated(9);
        renderer.submit(task, 4, 4, &mut surface);
        renderer.cancel();

        release.send(()).unwrap();
        fence(&pool);
        let delivered = renderer.drain(&mut surface);

        // Same generation, so the commit arrives, but the target was never
        // filled and the outcome reports the cancellation.
        assert_eq!(delivered, 1);
        assert_eq!(surface.commits, vec![(0, false)]);
    }

    #[test]
    fn render_sync_runs_all_phases_inline() {
        let mut surface = TestSurface::default();
        render_sync(FillTask::new(3), 2, 2, &mut surface);

        assert_eq!(surface.prepared, 1);
        assert_eq!(surface.commits, vec![(3, true)]);
    }

    #[test]
    fn poll_every_reads_flag_at_interval() {
        let token = CancelToken::new();
        let mut counter = 0;

        for _ in 0..3 {
            assert!(!token.poll_every(&mut counter, 4));
        }
        token.cancel();
        assert!(token.poll_every(&mut counter, 4));

        // A zero interval degenerates to checking every call.
        let mut counter = 0;
        assert!(token.poll_every(&mut counter, 0));
    }

    #[test]
    fn render_target_pixel_helpers() {
        let mut target = RenderTarget::new(3, 2);
        target.fill([1, 2, 3, 4]);
        target.put_pixel(2, 1, [9, 9, 9, 9]);
        // Out of bounds writes are ignored.
        target.put_pixel(3, 0, [7, 7, 7, 7]);

        assert_eq!(&target.data()[0..4], &[1, 2, 3, 4]);
        let last = (1 * 3 + 2) * 4;
        assert_eq!(&target.data()[last..last + 4], &[9, 9, 9, 9]);
    }
}
