//! Core of the tailprobe harness
//!
//! Launches one externally built terminal application in its own process
//! group under an environment overlay, watches the debug log it writes, and
//! tears everything down on every exit path.

pub mod config;
pub mod env_overlay;
pub mod error;
pub mod log_tail;
pub mod output;
#[cfg(unix)]
pub mod process;
#[cfg(unix)]
pub mod runner;

pub use config::{EscalationPolicy, HarnessConfig, OutputMode, RunMode};
pub use env_overlay::EnvOverlay;
pub use error::{CoreError, Result};
pub use log_tail::{Delta, LogSnapshot, LogTailWatcher};
#[cfg(unix)]
pub use runner::{
    listen_for_interrupts, DeltaSink, RunController, RunReport, StdoutSink, StopReason,
};

/// Core utilities and helper functions
pub mod utils {
    use tracing::debug;

    /// Initialize tracing for the application.
    ///
    /// `RUST_LOG` takes precedence over `level`. Output goes to stderr so
    /// stdout only carries log deltas and the run summary.
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .map_err(|e| crate::CoreError::InitializationError(e.to_string()))?;

        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| crate::CoreError::InitializationError(e.to_string()))?;

        debug!("Tracing initialized with level: {}", level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice_fails() {
        // Only the first global subscriber wins; later attempts surface an error
        let _ = utils::init_tracing("debug");
        let second = utils::init_tracing("debug");
        assert!(matches!(second, Err(CoreError::InitializationError(_))));
    }
}
