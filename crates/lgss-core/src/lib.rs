//! # lgss-core
//!
//! Shared error handling for the linear-Gaussian state space crates.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error enum and `Result` alias.
pub mod error;

pub use error::{Error, Result};
