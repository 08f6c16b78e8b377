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

//! Memory budget derivation from the host's available-memory signal.

/// Fraction of available memory the frame cache may claim. One fifth leaves
/// room for the host UI and other caches while still buffering several
/// seconds of typical animation.
const K_BUDGET_DIVISOR: u64 = 5;

/// Floor for the derived budget. Below roughly 10 MiB the window math
/// degenerates to one or two frames on any realistic source and playback
/// spends more time decoding than presenting.
pub const K_MIN_BUDGET_BYTES: u64 = 10 * 1024 * 1024;

/// Ceiling for the derived budget. Buffering beyond half a gigabyte of
/// frames has no visible smoothness benefit on any sequence this engine
/// targets.
pub const K_MAX_BUDGET_BYTES: u64 = 512 * 1024 * 1024;

/// Host-provided view of how much memory is currently available. The
/// platform signal behind it (sysinfo, cgroup limits, a fixed quota) is the
/// host's business; the cache only ever asks for a number.
pub trait MemoryGauge: Send + Sync {
    /// Bytes of memory currently available to the process.
    fn available_bytes(&self) -> u64;
}

/// Gauge reporting a fixed figure, for hosts without a platform signal and
/// for tests.
pub struct FixedBudget(pub u64);

impl MemoryGauge for FixedBudget {
    fn available_bytes(&self) -> u64 {
        self.0
    }
}

/// Resolve the cache budget from the gauge: one fifth of available memory,
/// clamped to `[K_MIN_BUDGET_BYTES, K_MAX_BUDGET_BYTES]`.
pub fn resolve_budget(gauge: &dyn MemoryGauge) -> u64 {
    (gauge.available_bytes() / K_BUDGET_DIVISOR).clamp(K_MIN_BUDGET_BYTES, K_MAX_BUDGET_BYTES)
}
