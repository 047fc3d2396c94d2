//! Byte layout of the CnC file.
//!
//! The file opens with a one-cache-line metadata header, followed by five
//! sub-regions in a fixed order:
//!
//! ```text
//! | metadata | to-driver ring | to-clients broadcast |
//! | counters metadata | counters values | error log |
//! ```
//!
//! The header records the version and each sub-region's length; offsets are
//! derived by accumulation. The layout is ABI: a client compiled against a
//! different [`CNC_VERSION`] must refuse to attach. The version field is
//! the last thing a driver writes (with release semantics) when creating
//! the file, so readers load it with acquire semantics and treat zero as
//! "not yet initialised".

use crate::error::{ClientError, Result};
use crate::ipc::region::Region;

/// Layout version this client speaks.
pub const CNC_VERSION: i32 = 4;

/// File name of the CnC file within the driver directory.
pub const CNC_FILE_NAME: &str = "cnc.dat";

/// Length of the metadata header.
pub const META_DATA_LENGTH: usize = 64;

/// Offset of the version field (`i32`, acquire-published by the driver).
pub const VERSION_FIELD_OFFSET: usize = 0;

/// Offset of the to-driver ring length field (`i32`).
pub const TO_DRIVER_BUFFER_LENGTH_OFFSET: usize = 4;

/// Offset of the to-clients broadcast length field (`i32`).
pub const TO_CLIENTS_BUFFER_LENGTH_OFFSET: usize = 8;

/// Offset of the counters metadata length field (`i32`).
pub const COUNTERS_METADATA_BUFFER_LENGTH_OFFSET: usize = 12;

/// Offset of the counters values length field (`i32`).
pub const COUNTERS_VALUES_BUFFER_LENGTH_OFFSET: usize = 16;

/// Offset of the error log length field (`i32`).
pub const ERROR_LOG_BUFFER_LENGTH_OFFSET: usize = 20;

/// Offset of the client liveness timeout field (`i64`, nanoseconds).
pub const CLIENT_LIVENESS_TIMEOUT_OFFSET: usize = 24;

/// Read-only view of the CnC metadata header.
#[derive(Debug, Clone, Copy)]
pub struct CncMetadata {
    meta: Region,
}

impl CncMetadata {
    /// Wraps the header of a mapped CnC file.
    ///
    /// # Errors
    ///
    /// [`ClientError::Cnc`] if the file is shorter than the header.
    pub fn new(file: Region) -> Result<Self> {
        if file.len() < META_DATA_LENGTH {
            return Err(ClientError::Cnc(format!(
                "file of {} bytes is shorter than the {META_DATA_LENGTH} byte metadata header",
                file.len()
            )));
        }
        Ok(Self {
            meta: file.slice(0, META_DATA_LENGTH),
        })
    }

    /// Version published by the driver; zero until initialisation finishes.
    ///
    /// Acquire semantics: a nonzero read orders all of the driver's layout
    /// writes before it.
    #[must_use]
    pub fn version(&self) -> i32 {
        self.meta.get_i32_volatile(VERSION_FIELD_OFFSET)
    }

    /// Length of the to-driver ring region, trailer included.
    #[must_use]
    pub fn to_driver_buffer_length(&self) -> usize {
        self.meta.get_i32(TO_DRIVER_BUFFER_LENGTH_OFFSET) as usize
    }

    /// Length of the to-clients broadcast region, trailer included.
    #[must_use]
    pub fn to_clients_buffer_length(&self) -> usize {
        self.meta.get_i32(TO_CLIENTS_BUFFER_LENGTH_OFFSET) as usize
    }

    /// Length of the counters metadata region.
    #[must_use]
    pub fn counters_metadata_buffer_length(&self) -> usize {
        self.meta.get_i32(COUNTERS_METADATA_BUFFER_LENGTH_OFFSET) as usize
    }

    /// Length of the counters values region.
    #[must_use]
    pub fn counters_values_buffer_length(&self) -> usize {
        self.meta.get_i32(COUNTERS_VALUES_BUFFER_LENGTH_OFFSET) as usize
    }

    /// Length of the error log region.
    #[must_use]
    pub fn error_log_buffer_length(&self) -> usize {
        self.meta.get_i32(ERROR_LOG_BUFFER_LENGTH_OFFSET) as usize
    }

    /// Timeout (ns) after which the driver declares a silent client dead.
    ///
    /// Doubles as the default conductor inter-service timeout.
    #[must_use]
    pub fn client_liveness_timeout_ns(&self) -> i64 {
        self.meta.get_i64_volatile(CLIENT_LIVENESS_TIMEOUT_OFFSET)
    }
}

fn checked_slice(file: Region, offset: usize, len: usize, name: &str) -> Result<Region> {
    if offset.checked_add(len).is_none_or(|end| end > file.len()) {
        return Err(ClientError::Cnc(format!(
            "{name} region [{offset}, {offset}+{len}) exceeds file of {} bytes",
            file.len()
        )));
    }
    Ok(file.slice(offset, len))
}

/// Carves the to-driver ring region out of the file.
///
/// # Errors
///
/// [`ClientError::Cnc`] if the metadata lengths exceed the file.
pub fn to_driver_buffer(file: Region, meta: &CncMetadata) -> Result<Region> {
    checked_slice(
        file,
        META_DATA_LENGTH,
        meta.to_driver_buffer_length(),
        "to-driver",
    )
}

/// Carves the to-clients broadcast region out of the file.
///
/// # Errors
///
/// [`ClientError::Cnc`] if the metadata lengths exceed the file.
pub fn to_clients_buffer(file: Region, meta: &CncMetadata) -> Result<Region> {
    let offset = META_DATA_LENGTH + meta.to_driver_buffer_length();
    checked_slice(file, offset, meta.to_clients_buffer_length(), "to-clients")
}

/// Carves the counters metadata region out of the file.
///
/// # Errors
///
/// [`ClientError::Cnc`] if the metadata lengths exceed the file.
pub fn counters_metadata_buffer(file: Region, meta: &CncMetadata) -> Result<Region> {
    let offset =
        META_DATA_LENGTH + meta.to_driver_buffer_length() + meta.to_clients_buffer_length();
    checked_slice(
        file,
        offset,
        meta.counters_metadata_buffer_length(),
        "counters-metadata",
    )
}

/// Carves the counters values region out of the file.
///
/// # Errors
///
/// [`ClientError::Cnc`] if the metadata lengths exceed the file.
pub fn counters_values_buffer(file: Region, meta: &CncMetadata) -> Result<Region> {
    let offset = META_DATA_LENGTH
        + meta.to_driver_buffer_length()
        + meta.to_clients_buffer_length()
        + meta.counters_metadata_buffer_length();
    checked_slice(
        file,
        offset,
        meta.counters_values_buffer_length(),
        "counters-values",
    )
}

/// Carves the error log region out of the file.
///
/// # Errors
///
/// [`ClientError::Cnc`] if the metadata lengths exceed the file.
pub fn error_log_buffer(file: Region, meta: &CncMetadata) -> Result<Region> {
    let offset = META_DATA_LENGTH
        + meta.to_driver_buffer_length()
        + meta.to_clients_buffer_length()
        + meta.counters_metadata_buffer_length()
        + meta.counters_values_buffer_length();
    checked_slice(file, offset, meta.error_log_buffer_length(), "error-log")
}

/// Total file length for the given sub-region lengths. For driver-side
/// tooling and fixtures.
#[must_use]
pub fn compute_cnc_file_length(
    to_driver_length: usize,
    to_clients_length: usize,
    counters_metadata_length: usize,
    counters_values_length: usize,
    error_log_length: usize,
) -> usize {
    META_DATA_LENGTH
        + to_driver_length
        + to_clients_length
        + counters_metadata_length
        + counters_values_length
        + error_log_length
}
