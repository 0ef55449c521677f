//! Error types for the stimulus engine binary.
//!
//! [`EngineError`] is the top-level error type that wraps all possible
//! failure modes during engine startup and the demo run.

/// Top-level error for the stimulus engine binary.
///
/// Each variant wraps a specific subsystem error, providing a single
/// error type that `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: stimulus_core::config::ConfigError,
    },

    /// The `demo` section of the configuration is unusable.
    #[error("demo config error: {message}")]
    Demo {
        /// Description of the problem.
        message: String,
    },

    /// A producer thread could not be started or panicked.
    #[error("producer error: {message}")]
    Producer {
        /// Description of the failure.
        message: String,
    },
}
