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

//! # Flipbook
//!
//! A memory-bounded playback engine for sequenced-image animation (GIF-style
//! assets, sprite flipbooks, decoded video loops). The host supplies frames
//! through the [`FrameSource`] contract and a display refresh signal; the
//! engine keeps an adaptive window of decoded frames resident, advances
//! playback from elapsed wall time, and presents to a borrowed
//! [`DisplaySurface`] without ever blocking the tick on decode work.

pub mod cache;
pub mod driver;
pub mod error;
pub mod frame;
pub mod memory;
pub mod source;

pub use cache::{CacheConfig, CacheStats, CacheWindow, FrameCache};
pub use driver::{
    DisplaySurface, DriverConfig, PlaybackDriver, PlaybackState, PlaybackStatus,
};
pub use error::{FlipbookError, Result};
pub use frame::ImageFrame;
pub use memory::{FixedBudget, MemoryGauge};
pub use source::{FrameSequence, FrameSource};
