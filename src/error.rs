//! Error types for Netrelay
//!
//! Fatal setup problems get a typed error so the binaries can report every
//! offending option at once; runtime failures travel as `anyhow` errors with
//! context attached where they occur.

use thiserror::Error;

/// Fatal startup error
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration errors, one message per offending option
    #[error("Configuration error:\n{}", .0.join("\n"))]
    Config(Vec<String>),
}
