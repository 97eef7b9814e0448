//! Process launching for the harness
//!
//! ## Platform Support
//!
//! - **Unix**: targets run in their own session and process group so teardown
//!   can signal the whole tree at once

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::*;
