// SPDX-License-Identifier: PolyForm-Shield-1.0

use thiserror::Error;

/// Errors talking to a backend over its native http protocol.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Connection refused, reset, timed out, or the body could not be read.
    #[error("backend request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The backend answered with a non-success status.
    #[error("backend returned status {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("failed to decode backend response: {0}")]
    Decode(#[from] serde_json::Error),
}
