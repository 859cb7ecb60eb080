//! Error types for the printer library

use thiserror::Error;

/// Printer error types
#[derive(Debug, Error)]
pub enum PrintError {
    /// Network connection error
    #[error("Connection failed: {0}")]
    Connection(String),

    /// IO error during printing
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Printer is offline or unreachable
    #[error("Printer offline: {0}")]
    Offline(String),

    /// Timeout waiting for printer
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid printer configuration
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// The device reported a fault (paper out, cover open, cutter jam)
    #[error("Device fault: {0}")]
    DeviceFault(String),

    /// Windows-specific printing error
    #[cfg(windows)]
    #[error("Windows printer error: {0}")]
    WindowsPrinter(String),
}

impl PrintError {
    /// Whether retrying the same job later can succeed
    ///
    /// Network trouble and a busy/offline device clear up on their own;
    /// configuration and device faults need a human.
    pub fn is_transient(&self) -> bool {
        match self {
            PrintError::Connection(_)
            | PrintError::Io(_)
            | PrintError::Offline(_)
            | PrintError::Timeout(_) => true,
            PrintError::InvalidConfig(_) | PrintError::DeviceFault(_) => false,
            #[cfg(windows)]
            PrintError::WindowsPrinter(_) => false,
        }
    }
}

/// Result type for printer operations
pub type PrintResult<T> = Result<T, PrintError>;
