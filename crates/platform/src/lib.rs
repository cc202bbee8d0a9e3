//! # Weir Platform
//!
//! Shared platform types for the Weir SSH proxy workspace.
//!
//! This crate provides the unified error types (`WeirError`, `WeirResult`)
//! used by every other workspace member.
//!
//! # Examples
//!
//! ```
//! use weir_platform::{WeirError, WeirResult};
//!
//! fn example_function() -> WeirResult<String> {
//!     Ok("Hello, Weir!".to_string())
//! }
//!
//! # fn main() -> WeirResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Weir!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{HandshakeSide, WeirError, WeirResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
