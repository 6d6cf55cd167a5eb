// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Lock primitives for the accelerator whose methods panic on poison instead of returning an
//! error.
//!
//! Release builds run with `panic = "abort"`, so a thread that panics while holding a lock takes
//! the process down and poisoning can never be observed. Wrapping the standard library types lets
//! the slots lock, the routing lock and the hypercall registry lock be taken with a plain
//! `.lock()`, keeping `unwrap()` out of the control plane entirely.

mod condvar;
mod mutex;

pub use crate::condvar::Condvar;
pub use crate::mutex::Mutex;
pub use crate::mutex::WouldBlock;
