// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Backend wire protocol support.
//!
//! Backends are `llama-server` style processes speaking a native http api
//! (`/completion`, `/v1/chat/completions`, `/health`). This crate holds the
//! shapes of that api and of the Ollama-compatible api the proxy exposes,
//! the translation between the two, and an http client for the native side.

mod client;
mod error;
pub mod native;
pub mod ollama;
pub mod stream;
pub mod translate;

pub use client::{ByteStream, HttpBackend, NativeBackend};
pub use error::RuntimeError;
