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

//! End-to-end tests over the public API: source, cache, driver and the
//! dispatch crate working together on real worker threads.
//!
//! Decode lanes are drained with fence jobs (one sentinel per lane) instead
//! of sleeps, so the tests are deterministic under load.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flipbook::{
    CacheConfig, DisplaySurface, DriverConfig, FixedBudget, FrameSequence, ImageFrame,
    PlaybackDriver, PlaybackStatus,
};
use flipbook_dispatch::pool::{QosTier, QueuePool};
use flipbook_dispatch::task::{AsyncRenderer, CancelToken, RenderOutcome, RenderTarget, RenderTask};
use flipbook_dispatch::transaction::TransactionQueue;

#[derive(Default)]
struct RecordingSurface {
    presented: Vec<u8>,
}

impl DisplaySurface for RecordingSurface {
    fn present(&mut self, frame: &Arc<ImageFrame>) {
        self.presented.push(frame.data[0]);
    }
}

fn gradient_source(frame_count: u8, duration: Duration, repeat: u64) -> Arc<FrameSequence> {
    let frames = (0..frame_count)
        .map(|i| ImageFrame::solid(8, 8, [i, i, i, 255]))
        .collect();
    Arc::new(FrameSequence::with_uniform_duration(frames, duration, repeat).unwrap())
}

/// Queue one sentinel per lane and wait for all of them; every job submitted
/// before this call has finished when it returns.
fn settle(pool: &QueuePool) {
    let (tx, rx) = mpsc::channel();
    for _ in 0..pool.lane_count() {
        let tx = tx.clone();
        pool.execute(move || {
            let _ = tx.send(());
        });
    }
    drop(tx);
    for _ in 0..pool.lane_count() {
        rx.recv().expect("a lane did not drain");
    }
}

#[test]
fn full_playback_pipeline() {
    let source = gradient_source(6, Duration::from_millis(50), 2);
    let pool = Arc::new(QueuePool::new("pipeline", QosTier::Utility, 2));
    let mut driver = PlaybackDriver::new(
        source,
        pool.clone(),
        Arc::new(FixedBudget(512 * 1024 * 1024)),
        Arc::new(TransactionQueue::new()),
        DriverConfig::default(),
    )
    .unwrap();

    let changes = Arc::new(Mutex::new(Vec::new()));
    let changes_seen = changes.clone();
    driver.set_on_frame_changed(move |index| changes_seen.lock().unwrap().push(index));
    let loops = Arc::new(Mutex::new(Vec::new()));
    let loops_seen = loops.clone();
    driver.set_on_loop_end(move |count| loops_seen.lock().unwrap().push(count));

    // Poster frame is available before playback starts.
    let poster = driver.current_frame().expect("poster frame");
    assert_eq!(poster.data[0], 0);

    let mut surface = RecordingSurface::default();
    driver.start();
    settle(&pool);

    // One 50 ms tick advances exactly one frame; two loops of six frames
    // finish on the twelfth.
    for _ in 0..12 {
        assert!(driver.state().is_playing());
        driver.tick(Duration::from_millis(50), &mut surface);
        settle(&pool);
        assert!(driver.state().current_index < 6);
    }

    let state = driver.state();
    assert_eq!(state.status, PlaybackStatus::Stopped);
    assert_eq!(state.loop_count, 2);
    assert_eq!(state.current_index, 0);
    assert_eq!(*loops.lock().unwrap(), vec![2]);
    assert_eq!(
        *changes.lock().unwrap(),
        vec![1, 2, 3, 4, 5, 0, 1, 2, 3, 4, 5]
    );
    // The finishing tick publishes nothing; every other tick hit the cache.
    assert_eq!(
        surface.presented,
        vec![1, 2, 3, 4, 5, 0, 1, 2, 3, 4, 5]
    );

    let stats = driver.cache().stats();
    assert_eq!(stats.decode_failures, 0);
    assert_eq!(stats.stale_decodes, 0);
    assert_eq!(stats.entries, 6);
}

#[test]
fn constrained_window_follows_playback() {
    let source = gradient_source(12, Duration::from_millis(50), 0);
    let pool = Arc::new(QueuePool::new("window", QosTier::Utility, 2));
    let mut driver = PlaybackDriver::new(
        source,
        pool.clone(),
        Arc::new(FixedBudget(512 * 1024 * 1024)),
        Arc::new(TransactionQueue::new()),
        DriverConfig {
            cache: CacheConfig {
                // Four 256-byte frames.
                budget_bytes: Some(1024),
                ..Default::default()
            },
            ..Default::default()
        },
    )
    .unwrap();

    let mut surface = RecordingSurface::default();
    driver.start();
    settle(&pool);

    assert!(driver.cache().len() <= 4);
    assert!(driver.cache().contains(0));
    assert!(driver.cache().contains(2));

    for expected in 1..=6u64 {
        driver.tick(Duration::from_millis(50), &mut surface);
        settle(&pool);
        assert_eq!(driver.state().current_index, expected);
        // The window trails the playhead: current frame resident, memory
        // bounded, far-away frames evicted.
        assert!(driver.cache().contains(expected));
        assert!(driver.cache().len() <= 4);
        assert!(driver.cache().stats().resident_bytes <= 1024);
    }
    assert!(!driver.cache().contains(0));
    assert_eq!(surface.presented, vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn memory_pressure_then_rebalance_recovers() {
    let source = gradient_source(10, Duration::from_millis(50), 0);
    let pool = Arc::new(QueuePool::new("pressure", QosTier::Utility, 2));
    let transactions = Arc::new(TransactionQueue::new());
    let mut driver = PlaybackDriver::new(
        source,
        pool.clone(),
        Arc::new(FixedBudget(512 * 1024 * 1024)),
        transactions.clone(),
        DriverConfig::default(),
    )
    .unwrap();

    let mut surface = RecordingSurface::default();
    driver.start();
    settle(&pool);
    assert_eq!(driver.cache().len(), 10);

    // Host forwards a platform memory warning mid-playback.
    driver.cache().on_memory_pressure();
    assert!(driver.cache().len() <= 2);

    driver.tick(Duration::from_millis(50), &mut surface);
    settle(&pool);
    assert!(driver.state().is_playing());
    assert!(driver.cache().len() <= 2);

    // Pressure passed; both rebalance requests collapse into one.
    driver.schedule_rebalance();
    driver.schedule_rebalance();
    assert_eq!(transactions.pending_len(), 1);
    assert_eq!(transactions.flush(), 1);

    driver.tick(Duration::from_millis(50), &mut surface);
    settle(&pool);
    assert_eq!(driver.cache().len(), 10);
    assert_eq!(surface.presented, vec![1, 2]);
}

struct ShadeTask {
    shade: u8,
    gate: Option<mpsc::Receiver<()>>,
}

struct ShadeCanvas {
    commits: Vec<(u8, bool)>,
}

impl RenderTask<ShadeCanvas> for ShadeTask {
    fn prepare(&mut self, _canvas: &mut ShadeCanvas) {}

    fn render(&mut self, target: &mut RenderTarget, token: &CancelToken) {
        if let Some(gate) = &self.gate {
            let _ = gate.recv();
        }
        if token.is_cancelled() {
            return;
        }
        target.fill([self.shade, self.shade, self.shade, 255]);
    }

    fn commit(self: Box<Self>, canvas: &mut ShadeCanvas, outcome: RenderOutcome) {
        canvas.commits.push((self.shade, outcome.completed));
    }
}

#[test]
fn rapid_resubmission_commits_only_the_newest_render() {
    let pool = Arc::new(QueuePool::new("render", QosTier::UserInteractive, 1));
    let mut renderer: AsyncRenderer<ShadeCanvas> = AsyncRenderer::new(pool.clone());
    let mut canvas = ShadeCanvas { commits: Vec::new() };

    // Hold the lane so all three submissions queue up before any renders.
    let (gate_tx, gate_rx) = mpsc::channel();
    renderer.submit(
        ShadeTask {
            shade: 1,
            gate: Some(gate_rx),
        },
        16,
        16,
        &mut canvas,
    );
    renderer.submit(ShadeTask { shade: 2, gate: None }, 16, 16, &mut canvas);
    renderer.submit(ShadeTask { shade: 3, gate: None }, 16, 16, &mut canvas);

    gate_tx.send(()).unwrap();
    settle(&pool);

    // Generations 1 and 2 were superseded; only the newest lands.
    assert_eq!(renderer.drain(&mut canvas), 1);
    assert_eq!(canvas.commits, vec![(3, true)]);
}
