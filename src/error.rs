//! Error types shared across the client.

use thiserror::Error;

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors produced while bootstrapping or running the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A driver observable did not appear within the driver timeout.
    #[error("driver timeout: {0}")]
    DriverTimeout(String),

    /// The CnC file was written by a driver speaking a different layout.
    #[error("CnC file version not supported: version={version}")]
    UnsupportedCncVersion {
        /// The version published in the CnC metadata.
        version: i32,
    },

    /// Operation invoked after the conductor closed.
    #[error("client is closed")]
    ClientClosed,

    /// The driver rejected a registration request.
    #[error("registration rejected by driver: code={code}, {message}")]
    Registration {
        /// Driver-assigned error code.
        code: i32,
        /// Driver-supplied diagnostic.
        message: String,
    },

    /// The conductor duty cycle was starved past the inter-service timeout.
    #[error(
        "conductor duty cycle exceeded inter-service timeout: \
         {service_interval_ns} ns > {timeout_ns} ns"
    )]
    InterServiceTimeout {
        /// Observed gap between consecutive duty cycles.
        service_interval_ns: i64,
        /// Configured inter-service timeout.
        timeout_ns: i64,
    },

    /// The driver command ring had no space for the record.
    ///
    /// Transient: retry on the next duty cycle.
    #[error("driver command ring is full")]
    Backpressure,

    /// The broadcast transmitter lapped this receiver; messages were lost.
    ///
    /// The receiver has already resynchronised to the latest record.
    #[error("fell behind the driver broadcast, messages lost")]
    BroadcastLapped,

    /// A control message failed to decode.
    #[error("malformed control message: {0}")]
    Protocol(String),

    /// The CnC file contents violate the layout contract.
    #[error("CnC file: {0}")]
    Cnc(String),

    /// `open`, `mmap`, etc. failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    Io {
        /// The operation that failed.
        op: &'static str,
        /// The path it was applied to.
        path: String,
        /// The underlying errno.
        source: rustix::io::Errno,
    },

    /// The conductor thread could not be started.
    #[error("failed to start {role} thread: {source}")]
    Thread {
        /// Role name of the agent being started.
        role: String,
        /// The spawn failure.
        source: std::io::Error,
    },
}

impl ClientError {
    pub(crate) fn io(op: &'static str, path: &std::path::Path, source: rustix::io::Errno) -> Self {
        Self::Io {
            op,
            path: path.display().to_string(),
            source,
        }
    }

    /// Whether this error is fatal to a conductor harness loop.
    #[must_use]
    pub fn is_fatal_to_harness(&self) -> bool {
        matches!(self, Self::DriverTimeout(_))
    }
}
