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

use std::sync::Arc;
use std::time::Duration;

use flipbook::{DisplaySurface, FrameSequence, FrameSource, ImageFrame, PlaybackDriver};
use web_time::Instant;

/// Stand-in for a real window or canvas: counts presents and reports the
/// occasional frame so the playback is visible on the console.
struct ConsoleSurface {
    presents: u64,
}

impl DisplaySurface for ConsoleSurface {
    fn present(&mut self, frame: &Arc<ImageFrame>) {
        self.presents += 1;
        if self.presents % 30 == 0 {
            println!(
                "  present #{}: {}x{} frame, shade {}",
                self.presents, frame.width, frame.height, frame.data[0]
            );
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Flipbook Playback Example");
    println!("=========================");

    // A 24-frame grayscale sweep, 41ms per frame (roughly 24 fps), played
    // twice. A real host would decode these from a GIF or sprite sheet.
    let source = Arc::new(create_gradient_sequence(24, 64, 64)?);
    println!(
        "Created source: {} frames, {} bytes per frame",
        source.frame_count(),
        source.byte_cost_at(0)
    );

    let mut driver = PlaybackDriver::with_defaults(source)?;
    driver.set_on_loop_end(|count| println!("  playback finished after {} loops", count));

    // Poster frame is available before playback starts.
    if let Some(poster) = driver.current_frame() {
        println!("Poster frame ready: {}x{}", poster.width, poster.height);
    }

    println!("\nPlaying...");
    let mut surface = ConsoleSurface { presents: 0 };
    driver.start();

    // Simulated display link: roughly 60 ticks per second, real elapsed
    // time fed to the driver, transaction queue flushed once per turn the
    // way a host event loop would before idling.
    let mut last_tick = Instant::now();
    for _ in 0..600 {
        if !driver.state().is_playing() {
            break;
        }
        std::thread::sleep(Duration::from_millis(16));
        let elapsed = last_tick.elapsed();
        last_tick = Instant::now();
        driver.tick(elapsed, &mut surface);
        flipbook_dispatch::transaction::global().flush();
    }

    let state = driver.state();
    let stats = driver.cache().stats();
    println!("\nFinal state:");
    println!("{}", serde_json::to_string_pretty(&state)?);
    println!("Cache statistics:");
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!("Surface presents: {}", surface.presents);

    println!("\nExample completed successfully!");

    Ok(())
}

/// Build an in-memory frame sequence shading from black to white.
fn create_gradient_sequence(
    frame_count: u8,
    width: u32,
    height: u32,
) -> flipbook::Result<FrameSequence> {
    let frames = (0..frame_count)
        .map(|i| {
            let shade = (i as u32 * 255 / frame_count.max(1) as u32) as u8;
            ImageFrame::solid(width, height, [shade, shade, shade, 255])
        })
        .collect();
    FrameSequence::with_uniform_duration(frames, Duration::from_millis(41), 2)
}

/// Demonstrate the memory-pressure path: shrink to a minimal window, then
/// recover through a coalesced rebalance.
#[allow(dead_code)]
fn demonstrate_memory_pressure() -> Result<(), Box<dyn std::error::Error>> {
    println!("\nDemonstrating memory pressure handling...");

    let source = Arc::new(create_gradient_sequence(24, 64, 64)?);
    let mut driver = PlaybackDriver::with_defaults(source)?;
    let mut surface = ConsoleSurface { presents: 0 };

    driver.start();
    driver.tick(Duration::from_millis(41), &mut surface);
    println!("Resident frames before pressure: {}", driver.cache().len());

    // What a host does when the platform reports a memory warning.
    driver.cache().on_memory_pressure();
    println!("Resident frames under pressure: {}", driver.cache().len());

    // Later, once the pressure passes, one rebalance restores the window.
    driver.schedule_rebalance();
    driver.schedule_rebalance();
    let ran = flipbook_dispatch::transaction::global().flush();
    println!("Two rebalance requests coalesced into {}", ran);
    driver.tick(Duration::from_millis(41), &mut surface);
    println!("Window capacity restored: {}", driver.cache().window_capacity());

    Ok(())
}
