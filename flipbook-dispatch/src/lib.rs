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

//! Concurrency substrate for frame pipelines. Worker-queue pools run jobs
//! on bounded, strictly ordered lanes; render tasks cross them with
//! cooperative cancellation and generation-checked commits. The transaction
//! module coalesces repeated maintenance requests into one run per
//! scheduling pass.

pub mod pool;
pub mod task;
pub mod transaction;
