// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Control plane for llama.cpp style backends bound to GPU resource keys.
//!
//! [`lifecycle::LifecycleManager`] loads, unloads and switches backends per
//! key, each backend owned by a [`process::ProcessAdapter`]. Launches are
//! recorded in the [`registry::ProcessRegistry`] so a restarted controller
//! can adopt them, [`gpu::GpuDetector`] reports device occupancy, and
//! [`proxy::CompatibilityProxy`] serves an Ollama-compatible api in front of
//! the running backends.

pub mod api;
pub mod error;
pub mod gpu;
pub mod lifecycle;
pub mod logs;
pub mod os;
pub mod process;
pub mod proxy;
pub mod registry;
pub mod runtime;
pub mod shutdown;

#[cfg(test)]
mod testkit;

pub use error::LifecycleError;
pub use lifecycle::LifecycleManager;
pub use runtime::{serve, Context, SharedContext};
