//! Handshake with a running driver over the CnC file.
//!
//! The driver initialises the CnC file in stages and may be starting up,
//! crash-looping, or long dead, so every observable is waited on with a
//! bound: the file's existence, the acquire-published version field, and
//! finally a fresh consumer heartbeat in the ring trailer. A stale
//! heartbeat usually means the file was left behind by a dead driver; the
//! mapping is discarded and the whole sequence restarts so a freshly
//! created file is picked up. Every failure path drops the mapping before
//! returning.

use std::path::Path;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use crate::cnc::layout::{
    self, CNC_FILE_NAME, CNC_VERSION, CncMetadata,
};
use crate::cnc::mapped::CncFile;
use crate::error::{ClientError, Result};
use crate::ipc::broadcast::{BroadcastReceiver, CopyBroadcastReceiver};
use crate::ipc::region::Region;
use crate::ipc::ring::CommandRing;
use crate::time::EpochClock;
use crate::trace::{debug, info, warn};

/// Sleep while waiting for the CnC file to appear.
const FILE_WAIT_SLEEP_MS: u64 = 16;

/// Sleep while waiting for the version field or first heartbeat.
const SPIN_SLEEP_MS: u64 = 1;

/// Backoff before remapping after a stale heartbeat.
const REMAP_SLEEP_MS: u64 = 100;

/// The validated IPC surface of an attached driver.
///
/// Owns the mapping through the `Arc` shared with every handle; dropping
/// the bindings (and any readers derived from them) unmaps the file.
pub struct CncBindings {
    /// The mapped CnC file.
    pub cnc: Arc<CncFile>,
    /// Many-producer command ring toward the driver.
    pub to_driver: CommandRing,
    /// Copying observer of the driver's response broadcast.
    pub to_clients: CopyBroadcastReceiver,
    /// Counters metadata region.
    pub counters_metadata: Region,
    /// Counters values region.
    pub counters_values: Region,
    /// Driver-configured client liveness timeout in nanoseconds.
    pub client_liveness_timeout_ns: i64,
}

/// Attaches to the driver whose CnC file lives in `dir`.
///
/// Bounded by `driver_timeout_ms` measured on `epoch_clock` from entry.
///
/// # Errors
///
/// - [`ClientError::DriverTimeout`] if the file never appears, is never
///   initialised, or no fresh heartbeat is observed in time
/// - [`ClientError::UnsupportedCncVersion`] on a layout version mismatch
/// - [`ClientError::Cnc`] / [`ClientError::Io`] on a malformed or
///   unmappable file
pub fn connect_to_driver(
    dir: &Path,
    driver_timeout_ms: u64,
    epoch_clock: &dyn EpochClock,
) -> Result<CncBindings> {
    let cnc_path = dir.join(CNC_FILE_NAME);
    let start_ms = epoch_clock.time_ms();
    let deadline_ms = start_ms + driver_timeout_ms as i64;

    loop {
        while !cnc_path.exists() {
            if epoch_clock.time_ms() > deadline_ms {
                return Err(ClientError::DriverTimeout(format!(
                    "CnC file not found: {}",
                    cnc_path.display()
                )));
            }
            sleep(Duration::from_millis(FILE_WAIT_SLEEP_MS));
        }

        let cnc = Arc::new(CncFile::map_existing(&cnc_path)?);
        let file = cnc.region();
        let metadata = CncMetadata::new(file)?;

        let version = loop {
            let version = metadata.version();
            if version != 0 {
                break version;
            }
            if epoch_clock.time_ms() > deadline_ms {
                return Err(ClientError::DriverTimeout(
                    "CnC file is created but not initialised".to_string(),
                ));
            }
            sleep(Duration::from_millis(SPIN_SLEEP_MS));
        };

        if version != CNC_VERSION {
            return Err(ClientError::UnsupportedCncVersion { version });
        }

        let to_driver = CommandRing::new(Arc::clone(&cnc), layout::to_driver_buffer(file, &metadata)?)?;

        while to_driver.consumer_heartbeat_time() == 0 {
            if epoch_clock.time_ms() > deadline_ms {
                return Err(ClientError::DriverTimeout(
                    "no driver heartbeat detected".to_string(),
                ));
            }
            sleep(Duration::from_millis(SPIN_SLEEP_MS));
        }

        let now_ms = epoch_clock.time_ms();
        if to_driver.consumer_heartbeat_time() < now_ms - driver_timeout_ms as i64 {
            // Stale heartbeat: most likely a CnC file left by a dead
            // driver. A restarted driver creates a fresh file, so drop
            // this mapping and start over.
            if now_ms > deadline_ms {
                return Err(ClientError::DriverTimeout(
                    "no driver heartbeat detected".to_string(),
                ));
            }

            warn!(
                path = %cnc_path.display(),
                heartbeat_ms = to_driver.consumer_heartbeat_time(),
                "stale driver heartbeat, remapping"
            );
            drop(to_driver);
            drop(cnc);
            sleep(Duration::from_millis(REMAP_SLEEP_MS));
            continue;
        }

        debug!(version, "CnC file validated");

        let to_clients = CopyBroadcastReceiver::new(BroadcastReceiver::new(
            Arc::clone(&cnc),
            layout::to_clients_buffer(file, &metadata)?,
        )?);
        let counters_metadata = layout::counters_metadata_buffer(file, &metadata)?;
        let counters_values = layout::counters_values_buffer(file, &metadata)?;
        let client_liveness_timeout_ns = metadata.client_liveness_timeout_ns();

        info!(
            path = %cnc_path.display(),
            liveness_timeout_ns = client_liveness_timeout_ns,
            "attached to driver"
        );

        return Ok(CncBindings {
            cnc,
            to_driver,
            to_clients,
            counters_metadata,
            counters_values,
            client_liveness_timeout_ns,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cnc::layout::{
        CLIENT_LIVENESS_TIMEOUT_OFFSET, COUNTERS_METADATA_BUFFER_LENGTH_OFFSET,
        COUNTERS_VALUES_BUFFER_LENGTH_OFFSET, ERROR_LOG_BUFFER_LENGTH_OFFSET,
        TO_CLIENTS_BUFFER_LENGTH_OFFSET, TO_DRIVER_BUFFER_LENGTH_OFFSET, VERSION_FIELD_OFFSET,
        compute_cnc_file_length,
    };
    use crate::ipc::broadcast::BROADCAST_TRAILER_LENGTH;
    use crate::ipc::ring::RING_TRAILER_LENGTH;
    use crate::time::SystemEpochClock;
    use std::time::Instant;
    use tempfile::TempDir;

    const TO_DRIVER_LENGTH: usize = 1024 + RING_TRAILER_LENGTH;
    const TO_CLIENTS_LENGTH: usize = 1024 + BROADCAST_TRAILER_LENGTH;

    fn write_cnc_file(dir: &Path, version: i32, heartbeat_ms: i64) -> Arc<CncFile> {
        let len = compute_cnc_file_length(TO_DRIVER_LENGTH, TO_CLIENTS_LENGTH, 256, 128, 64);
        let cnc = Arc::new(CncFile::create(&dir.join(CNC_FILE_NAME), len).unwrap());
        let file = cnc.region();
        file.put_i32(TO_DRIVER_BUFFER_LENGTH_OFFSET, TO_DRIVER_LENGTH as i32);
        file.put_i32(TO_CLIENTS_BUFFER_LENGTH_OFFSET, TO_CLIENTS_LENGTH as i32);
        file.put_i32(COUNTERS_METADATA_BUFFER_LENGTH_OFFSET, 256);
        file.put_i32(COUNTERS_VALUES_BUFFER_LENGTH_OFFSET, 128);
        file.put_i32(ERROR_LOG_BUFFER_LENGTH_OFFSET, 64);
        file.put_i64(CLIENT_LIVENESS_TIMEOUT_OFFSET, 5_000_000_000);
        file.put_i32_ordered(VERSION_FIELD_OFFSET, version);

        if heartbeat_ms != 0 {
            let metadata = CncMetadata::new(file).unwrap();
            let ring = CommandRing::new(
                Arc::clone(&cnc),
                layout::to_driver_buffer(file, &metadata).unwrap(),
            )
            .unwrap();
            ring.update_consumer_heartbeat(heartbeat_ms);
        }
        cnc
    }

    #[test]
    fn times_out_when_file_never_appears() {
        let dir = TempDir::new().unwrap();
        let clock = SystemEpochClock;

        let start = Instant::now();
        let result = connect_to_driver(dir.path(), 200, &clock);

        assert!(matches!(result, Err(ClientError::DriverTimeout(_))));
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn times_out_when_version_never_published() {
        let dir = TempDir::new().unwrap();
        let _cnc = write_cnc_file(dir.path(), 0, 0);
        let clock = SystemEpochClock;

        let result = connect_to_driver(dir.path(), 150, &clock);
        assert!(
            matches!(result, Err(ClientError::DriverTimeout(ref msg)) if msg.contains("not initialised"))
        );
    }

    #[test]
    fn rejects_version_mismatch_immediately() {
        let dir = TempDir::new().unwrap();
        let clock = SystemEpochClock;
        let _cnc = write_cnc_file(dir.path(), 3, clock.time_ms());

        let start = Instant::now();
        let result = connect_to_driver(dir.path(), 5_000, &clock);

        assert!(matches!(
            result,
            Err(ClientError::UnsupportedCncVersion { version: 3 })
        ));
        // Fatal, not retried until the deadline.
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn times_out_on_stale_heartbeat() {
        let dir = TempDir::new().unwrap();
        let clock = SystemEpochClock;
        let _cnc = write_cnc_file(dir.path(), CNC_VERSION, clock.time_ms() - 60_000);

        let result = connect_to_driver(dir.path(), 400, &clock);
        assert!(
            matches!(result, Err(ClientError::DriverTimeout(ref msg)) if msg.contains("heartbeat"))
        );
    }

    #[test]
    fn attaches_to_live_driver() {
        let dir = TempDir::new().unwrap();
        let clock = SystemEpochClock;
        let _cnc = write_cnc_file(dir.path(), CNC_VERSION, clock.time_ms());

        let bindings = connect_to_driver(dir.path(), 1_000, &clock).unwrap();
        assert_eq!(bindings.client_liveness_timeout_ns, 5_000_000_000);
        assert_eq!(bindings.to_driver.capacity(), 1024);
        assert_eq!(bindings.counters_metadata.len(), 256);
        assert_eq!(bindings.counters_values.len(), 128);
    }

    #[test]
    fn picks_up_driver_appearing_late() {
        let dir = TempDir::new().unwrap();
        let clock = SystemEpochClock;
        let path = dir.path().to_path_buf();

        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(80));
            let clock = SystemEpochClock;
            write_cnc_file(&path, CNC_VERSION, clock.time_ms())
        });

        let bindings = connect_to_driver(dir.path(), 2_000, &clock).unwrap();
        assert_eq!(bindings.to_driver.capacity(), 1024);
        drop(bindings);
        drop(writer.join().unwrap());
    }
}
