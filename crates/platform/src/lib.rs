//! # SshPiper Platform
//!
//! Core platform types for the sshpiper workspace.
//!
//! This crate provides the unified error types (`PiperError`,
//! `PiperResult`) shared by every crate in the workspace.
//!
//! # Examples
//!
//! ```
//! use sshpiper_platform::{PiperError, PiperResult};
//!
//! fn example_function() -> PiperResult<String> {
//!     Ok("Hello, piper!".to_string())
//! }
//!
//! # fn main() -> PiperResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, piper!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{PiperError, PiperResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
