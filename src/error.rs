//! Error types for the strata orchestration layer.

/// Result type alias for strata operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating pipelines and pools.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Kernel compilation failed inside the driver
    #[error("compile error {code}: {message}")]
    Compile {
        /// Driver-reported error code (non-zero)
        code: i32,
        /// Driver-reported build log or message
        message: String,
    },

    /// Invalid binding: kernel names, range counts, or buffer kinds/lengths
    #[error("binding error: {0}")]
    Binding(String),

    /// A declared but unavailable capability was requested
    #[error("capability error: {0}")]
    Capability(String),

    /// Scheduling error: exhausted pool, disposed device, declined facade
    #[error("scheduling error: {0}")]
    Scheduling(String),

    /// Driver-level failure while building or dispatching
    #[error("driver error: {0}")]
    Driver(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Executor error
    #[error("executor error: {0}")]
    Executor(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a binding error
    pub fn binding<S: Into<String>>(msg: S) -> Self {
        Error::Binding(msg.into())
    }

    /// Create a capability error
    pub fn capability<S: Into<String>>(msg: S) -> Self {
        Error::Capability(msg.into())
    }

    /// Create a scheduling error
    pub fn scheduling<S: Into<String>>(msg: S) -> Self {
        Error::Scheduling(msg.into())
    }

    /// Create a driver error
    pub fn driver<S: Into<String>>(msg: S) -> Self {
        Error::Driver(msg.into())
    }

    /// Create a config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Create an executor error
    pub fn executor<S: Into<String>>(msg: S) -> Self {
        Error::Executor(msg.into())
    }
}
