//! Client configuration and its finalisation.
//!
//! [`Context`] is a fluent record of optional settings, each with a
//! documented default. [`Context::conclude`] is the explicit finalise step:
//! it consumes the context, fills remaining defaults, performs the driver
//! handshake, and yields an immutable [`ConcludedContext`] holding the
//! mapped CnC file and every collaborator the client needs. A context
//! cannot be reused across clients; the move enforces it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::agent::{ThreadFactory, default_thread_factory};
use crate::cnc::connector::connect_to_driver;
use crate::cnc::mapped::CncFile;
use crate::conductor::Image;
use crate::error::{ClientError, Result};
use crate::idle::{IdleStrategy, SleepingIdleStrategy};
use crate::ipc::broadcast::CopyBroadcastReceiver;
use crate::ipc::region::Region;
use crate::ipc::ring::CommandRing;
use crate::time::{EpochClock, NanoClock, SystemEpochClock, SystemNanoClock};

/// Callback receiving client errors. Always invoked off the client lock.
pub type ErrorHandler = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// Callback receiving image availability events.
pub type ImageHandler = Arc<dyn Fn(&Image) + Send + Sync>;

/// Memory mapping mode for image log buffers handed to layers above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageMapMode {
    /// Map image buffers read-only (the default).
    #[default]
    ReadOnly,
    /// Map image buffers read-write.
    ReadWrite,
}

/// Default interval between keepalives to the driver.
pub const KEEPALIVE_INTERVAL_NS: i64 = 500_000_000;

/// Default inter-service timeout used when neither the user nor the CnC
/// metadata provides one.
pub const INTER_SERVICE_TIMEOUT_NS: i64 = 10_000_000_000;

/// Default timeout for deciding a publication has no connected subscribers.
pub const PUBLICATION_CONNECTION_TIMEOUT_MS: i64 = 5_000;

/// Default bound on every driver observable during bootstrap.
pub const DRIVER_TIMEOUT_MS: u64 = 10_000;

/// Driver directory for the current user, `/dev/shm` backed where
/// available.
#[must_use]
pub fn default_driver_dir() -> PathBuf {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "default".to_string());
    let leaf = format!("maestro-{user}");

    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.join(leaf)
    } else {
        std::env::temp_dir().join(leaf)
    }
}

/// The default error handler: log the error, and on a driver timeout exit
/// the process with status -1.
#[must_use]
pub fn default_error_handler() -> ErrorHandler {
    Arc::new(|error: &ClientError| {
        eprintln!("maestro client error: {error}");
        if matches!(error, ClientError::DriverTimeout(_)) {
            eprintln!("***\n*** timeout from the media driver - is it currently running?\n***");
            std::process::exit(-1);
        }
    })
}

/// Configuration for a [`crate::Client`].
///
/// Defaults follow each setter's documentation. Not reusable: `conclude`
/// consumes the context.
pub struct Context {
    driver_dir: PathBuf,
    driver_timeout_ms: u64,
    use_conductor_agent_invoker: bool,
    epoch_clock: Arc<dyn EpochClock>,
    nano_clock: Arc<dyn NanoClock>,
    idle_strategy: Option<Box<dyn IdleStrategy + Send>>,
    keep_alive_interval_ns: i64,
    inter_service_timeout_ns: i64,
    publication_connection_timeout_ms: i64,
    image_map_mode: ImageMapMode,
    thread_factory: ThreadFactory,
    error_handler: ErrorHandler,
    available_image_handler: Option<ImageHandler>,
    unavailable_image_handler: Option<ImageHandler>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// A context with every setting at its default.
    #[must_use]
    pub fn new() -> Self {
        Self {
            driver_dir: default_driver_dir(),
            driver_timeout_ms: DRIVER_TIMEOUT_MS,
            use_conductor_agent_invoker: false,
            epoch_clock: Arc::new(SystemEpochClock),
            nano_clock: Arc::new(SystemNanoClock::new()),
            idle_strategy: None,
            keep_alive_interval_ns: KEEPALIVE_INTERVAL_NS,
            // Zero means "not set by the user": concluded from the CnC
            // client liveness timeout.
            inter_service_timeout_ns: 0,
            publication_connection_timeout_ms: PUBLICATION_CONNECTION_TIMEOUT_MS,
            image_map_mode: ImageMapMode::default(),
            thread_factory: default_thread_factory(),
            error_handler: default_error_handler(),
            available_image_handler: None,
            unavailable_image_handler: None,
        }
    }

    /// Directory containing the driver's CnC file.
    ///
    /// Default: `maestro-<user>` under `/dev/shm`, or the system temp
    /// directory where `/dev/shm` does not exist.
    #[must_use]
    pub fn driver_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.driver_dir = dir.into();
        self
    }

    /// Bound in milliseconds on every driver observable during bootstrap
    /// and liveness checks. Default 10 s.
    #[must_use]
    pub fn driver_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.driver_timeout_ms = timeout_ms;
        self
    }

    /// Run the conductor from an embedded [`crate::AgentInvoker`] ticked by
    /// the application instead of a dedicated thread. Default false.
    #[must_use]
    pub fn use_conductor_agent_invoker(mut self, use_invoker: bool) -> Self {
        self.use_conductor_agent_invoker = use_invoker;
        self
    }

    /// Wall clock used for driver deadlines. Default: the system clock.
    #[must_use]
    pub fn epoch_clock(mut self, clock: Arc<dyn EpochClock>) -> Self {
        self.epoch_clock = clock;
        self
    }

    /// Monotonic clock pacing the duty cycle. Default: the system clock.
    #[must_use]
    pub fn nano_clock(mut self, clock: Arc<dyn NanoClock>) -> Self {
        self.nano_clock = clock;
        self
    }

    /// Idle strategy for the conductor thread. Default: sleep 16 ms.
    #[must_use]
    pub fn idle_strategy(mut self, strategy: Box<dyn IdleStrategy + Send>) -> Self {
        self.idle_strategy = Some(strategy);
        self
    }

    /// Interval between keepalives to the driver. Default 500 ms.
    #[must_use]
    pub fn keep_alive_interval_ns(mut self, interval_ns: i64) -> Self {
        self.keep_alive_interval_ns = interval_ns;
        self
    }

    /// Maximum tolerated gap between conductor duty cycles before the
    /// client declares itself a zombie and closes.
    ///
    /// Default: the client liveness timeout from the CnC metadata, or 10 s
    /// when the metadata carries none. An explicitly set value wins.
    #[must_use]
    pub fn inter_service_timeout_ns(mut self, timeout_ns: i64) -> Self {
        self.inter_service_timeout_ns = timeout_ns;
        self
    }

    /// Timeout for deciding a publication has no connected subscribers.
    /// Default 5 s.
    #[must_use]
    pub fn publication_connection_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.publication_connection_timeout_ms = timeout_ms;
        self
    }

    /// Mapping mode for image log buffers. Default read-only.
    #[must_use]
    pub fn image_map_mode(mut self, mode: ImageMapMode) -> Self {
        self.image_map_mode = mode;
        self
    }

    /// Factory for the conductor thread. Default: a plain named thread.
    #[must_use]
    pub fn thread_factory(mut self, factory: ThreadFactory) -> Self {
        self.thread_factory = factory;
        self
    }

    /// Handler for errors the conductor cannot attribute to a specific
    /// call. Default: [`default_error_handler`], which exits the process
    /// on a driver timeout.
    #[must_use]
    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = handler;
        self
    }

    /// Default callback for images becoming available. Default: none.
    #[must_use]
    pub fn available_image_handler(mut self, handler: ImageHandler) -> Self {
        self.available_image_handler = Some(handler);
        self
    }

    /// Default callback for images going away. Default: none.
    #[must_use]
    pub fn unavailable_image_handler(mut self, handler: ImageHandler) -> Self {
        self.unavailable_image_handler = Some(handler);
        self
    }

    /// Finalises the configuration: fills defaults, performs the driver
    /// handshake, and allocates this client's id.
    ///
    /// # Errors
    ///
    /// Handshake failures per [`connect_to_driver`]; all mappings are
    /// released before the error propagates.
    pub fn conclude(self) -> Result<ConcludedContext> {
        let bindings =
            connect_to_driver(&self.driver_dir, self.driver_timeout_ms, &*self.epoch_clock)?;

        let inter_service_timeout_ns = if self.inter_service_timeout_ns != 0 {
            self.inter_service_timeout_ns
        } else if bindings.client_liveness_timeout_ns > 0 {
            bindings.client_liveness_timeout_ns
        } else {
            INTER_SERVICE_TIMEOUT_NS
        };

        let client_id = bindings.to_driver.next_correlation_id();

        Ok(ConcludedContext {
            cnc: bindings.cnc,
            to_driver: bindings.to_driver,
            to_clients: bindings.to_clients,
            counters_metadata: bindings.counters_metadata,
            counters_values: bindings.counters_values,
            client_id,
            driver_timeout_ms: self.driver_timeout_ms,
            use_conductor_agent_invoker: self.use_conductor_agent_invoker,
            epoch_clock: self.epoch_clock,
            nano_clock: self.nano_clock,
            idle_strategy: self
                .idle_strategy
                .unwrap_or_else(|| Box::new(SleepingIdleStrategy::default())),
            keep_alive_interval_ns: self.keep_alive_interval_ns,
            inter_service_timeout_ns,
            publication_connection_timeout_ms: self.publication_connection_timeout_ms,
            image_map_mode: self.image_map_mode,
            thread_factory: self.thread_factory,
            error_handler: self.error_handler,
            available_image_handler: self.available_image_handler,
            unavailable_image_handler: self.unavailable_image_handler,
        })
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("driver_dir", &self.driver_dir)
            .field("driver_timeout_ms", &self.driver_timeout_ms)
            .field(
                "use_conductor_agent_invoker",
                &self.use_conductor_agent_invoker,
            )
            .finish_non_exhaustive()
    }
}

/// A finalised configuration bound to a live driver.
///
/// Owns the mapped CnC file; dropping it (with any derived handles)
/// releases the mapping. Consumed by [`crate::Client::connect`].
pub struct ConcludedContext {
    pub(crate) cnc: Arc<CncFile>,
    pub(crate) to_driver: CommandRing,
    pub(crate) to_clients: CopyBroadcastReceiver,
    pub(crate) counters_metadata: Region,
    pub(crate) counters_values: Region,
    pub(crate) client_id: i64,
    pub(crate) driver_timeout_ms: u64,
    pub(crate) use_conductor_agent_invoker: bool,
    pub(crate) epoch_clock: Arc<dyn EpochClock>,
    pub(crate) nano_clock: Arc<dyn NanoClock>,
    pub(crate) idle_strategy: Box<dyn IdleStrategy + Send>,
    pub(crate) keep_alive_interval_ns: i64,
    pub(crate) inter_service_timeout_ns: i64,
    pub(crate) publication_connection_timeout_ms: i64,
    pub(crate) image_map_mode: ImageMapMode,
    pub(crate) thread_factory: ThreadFactory,
    pub(crate) error_handler: ErrorHandler,
    pub(crate) available_image_handler: Option<ImageHandler>,
    pub(crate) unavailable_image_handler: Option<ImageHandler>,
}

impl ConcludedContext {
    /// The client id allocated from the driver-wide correlation counter.
    #[must_use]
    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    /// The concluded inter-service timeout in nanoseconds.
    #[must_use]
    pub fn inter_service_timeout_ns(&self) -> i64 {
        self.inter_service_timeout_ns
    }

    /// The publication connection timeout in milliseconds.
    #[must_use]
    pub fn publication_connection_timeout_ms(&self) -> i64 {
        self.publication_connection_timeout_ms
    }

    /// The mapping mode for image log buffers.
    #[must_use]
    pub fn image_map_mode(&self) -> ImageMapMode {
        self.image_map_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cnc::layout::{
        self, CLIENT_LIVENESS_TIMEOUT_OFFSET, CNC_FILE_NAME, CNC_VERSION, CncMetadata,
        COUNTERS_METADATA_BUFFER_LENGTH_OFFSET, COUNTERS_VALUES_BUFFER_LENGTH_OFFSET,
        ERROR_LOG_BUFFER_LENGTH_OFFSET, TO_CLIENTS_BUFFER_LENGTH_OFFSET,
        TO_DRIVER_BUFFER_LENGTH_OFFSET, VERSION_FIELD_OFFSET, compute_cnc_file_length,
    };
    use crate::ipc::broadcast::BROADCAST_TRAILER_LENGTH;
    use crate::ipc::ring::RING_TRAILER_LENGTH;
    use tempfile::TempDir;

    const TO_DRIVER_LENGTH: usize = 1024 + RING_TRAILER_LENGTH;
    const TO_CLIENTS_LENGTH: usize = 1024 + BROADCAST_TRAILER_LENGTH;

    /// Authors a CnC file with a fresh heartbeat so `conclude()` attaches.
    fn write_cnc_file(dir: &Path, liveness_timeout_ns: i64) -> Arc<CncFile> {
        let len = compute_cnc_file_length(TO_DRIVER_LENGTH, TO_CLIENTS_LENGTH, 256, 128, 64);
        let cnc = Arc::new(CncFile::create(&dir.join(CNC_FILE_NAME), len).unwrap());
        let file = cnc.region();
        file.put_i32(TO_DRIVER_BUFFER_LENGTH_OFFSET, TO_DRIVER_LENGTH as i32);
        file.put_i32(TO_CLIENTS_BUFFER_LENGTH_OFFSET, TO_CLIENTS_LENGTH as i32);
        file.put_i32(COUNTERS_METADATA_BUFFER_LENGTH_OFFSET, 256);
        file.put_i32(COUNTERS_VALUES_BUFFER_LENGTH_OFFSET, 128);
        file.put_i32(ERROR_LOG_BUFFER_LENGTH_OFFSET, 64);
        file.put_i64(CLIENT_LIVENESS_TIMEOUT_OFFSET, liveness_timeout_ns);
        file.put_i32_ordered(VERSION_FIELD_OFFSET, CNC_VERSION);

        let metadata = CncMetadata::new(file).unwrap();
        let ring = CommandRing::new(
            Arc::clone(&cnc),
            layout::to_driver_buffer(file, &metadata).unwrap(),
        )
        .unwrap();
        ring.update_consumer_heartbeat(SystemEpochClock.time_ms());
        cnc
    }

    #[test]
    fn inter_service_timeout_defaults_to_cnc_liveness() {
        let dir = TempDir::new().unwrap();
        let _cnc = write_cnc_file(dir.path(), 7_000_000_000);

        let concluded = Context::new()
            .driver_dir(dir.path())
            .driver_timeout_ms(1_000)
            .conclude()
            .unwrap();

        assert_eq!(concluded.inter_service_timeout_ns(), 7_000_000_000);
    }

    #[test]
    fn explicit_inter_service_timeout_wins_over_cnc_liveness() {
        let dir = TempDir::new().unwrap();
        let _cnc = write_cnc_file(dir.path(), 7_000_000_000);

        let concluded = Context::new()
            .driver_dir(dir.path())
            .driver_timeout_ms(1_000)
            .inter_service_timeout_ns(3_000_000_000)
            .conclude()
            .unwrap();

        assert_eq!(concluded.inter_service_timeout_ns(), 3_000_000_000);
    }

    #[test]
    fn inter_service_timeout_falls_back_to_constant_without_liveness() {
        let dir = TempDir::new().unwrap();
        let _cnc = write_cnc_file(dir.path(), 0);

        let concluded = Context::new()
            .driver_dir(dir.path())
            .driver_timeout_ms(1_000)
            .conclude()
            .unwrap();

        assert_eq!(
            concluded.inter_service_timeout_ns(),
            INTER_SERVICE_TIMEOUT_NS
        );
    }
}
