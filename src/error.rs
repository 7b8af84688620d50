//! Error Types
//!
//! Typed error taxonomy for the event-loop core. Failures local to one
//! event or request are absorbed near their source; only failures that
//! compromise the ability to produce further events surface through
//! these types.

use thiserror::Error;

use crate::tracker::WireError;

/// Errors surfaced by the event-loop core.
#[derive(Debug, Error)]
pub enum Error {
    /// The poll bridge could not be started or its thread is gone.
    #[error("poll bridge unavailable: {0}")]
    Bridge(String),

    /// The native pump cannot produce further events.
    #[error("native event pump failed: {0}")]
    Pump(String),

    /// A wire-protocol operation failed before any per-child work ran,
    /// or in a way that invalidates the whole batch.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Underlying OS primitive failure (pipe creation, poll setup).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
