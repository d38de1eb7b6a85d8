// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::time::Duration;

use protocol::{InvalidResourceKey, ResourceKey};
use thiserror::Error;

use crate::process::AdapterError;

/// Errors returned by [`crate::lifecycle::LifecycleManager`] operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("backend {0:?} not found")]
    NotFound(String),

    #[error("no backend bound on resource key {0}")]
    NotBound(ResourceKey),

    #[error("resource key {key} already serves {backend_id}; unload or switch first")]
    AlreadyBound { key: ResourceKey, backend_id: String },

    #[error("resource key {0} is busy with another load, unload or switch")]
    Busy(ResourceKey),

    #[error(transparent)]
    InvalidResourceKey(#[from] InvalidResourceKey),

    #[error("backend {backend_id} on {key} did not become healthy within {timeout:?}")]
    StartupTimeout {
        key: ResourceKey,
        backend_id: String,
        timeout: Duration,
    },

    #[error("backend on {key}: {source}")]
    Adapter {
        key: ResourceKey,
        #[source]
        source: AdapterError,
    },

    #[error("failed to record backend on {key} in the process registry: {source:#}")]
    Registry {
        key: ResourceKey,
        #[source]
        source: anyhow::Error,
    },
}
