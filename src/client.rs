//! The top-level client: construction, public operations, and teardown.
//!
//! A [`Client`] owns the conductor behind the single client-wide lock, the
//! harness driving it, and the mapped CnC file. Every public operation
//! locks, delegates to the conductor, and releases in a guaranteed scope;
//! operations awaiting a driver response hold the lock only for one short
//! poll quantum at a time. In dedicated-thread mode waiting threads park
//! on a condvar the conductor agent signals after productive duty cycles;
//! in invoker mode the waiting thread drives the duty cycle itself.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::agent::{Agent, AgentInvoker, AgentRunner};
use crate::cnc::mapped::CncFile;
use crate::conductor::{
    ClientConductor, CompletedRegistration, ConductorSettings, Publication, Subscription,
    fire_deferred,
};
use crate::context::{ConcludedContext, Context, ErrorHandler, ImageHandler, ImageMapMode};
use crate::error::{ClientError, Result};
use crate::ipc::counters::CountersReader;
use crate::ipc::region::Region;
use crate::proxy::DriverProxy;
use crate::time::EpochClock;
use crate::trace::{debug, info};

/// How long a waiting thread parks before re-checking its deadline.
const AWAIT_QUANTUM: Duration = Duration::from_millis(1);

struct ConductorShared {
    conductor: Mutex<ClientConductor>,
    signal: Condvar,
}

impl ConductorShared {
    fn lock(&self) -> MutexGuard<'_, ClientConductor> {
        self.conductor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Agent adapter running the shared conductor under the client lock.
///
/// Callback work the conductor queued while locked is fired after the lock
/// is released, so user callbacks never run under it.
pub struct ConductorAgent {
    shared: Arc<ConductorShared>,
    error_handler: ErrorHandler,
}

impl Agent for ConductorAgent {
    fn on_start(&mut self) -> Result<()> {
        self.shared.lock().on_start();
        Ok(())
    }

    fn do_work(&mut self) -> Result<usize> {
        let (result, deferred) = {
            let mut conductor = self.shared.lock();
            let result = conductor.do_work();
            (result, conductor.drain_deferred())
        };

        if !matches!(result, Ok(0)) || !deferred.is_empty() {
            self.shared.signal.notify_all();
        }
        fire_deferred(deferred, &self.error_handler);
        result
    }

    fn on_close(&mut self) {
        let deferred = {
            let mut conductor = self.shared.lock();
            conductor.close();
            conductor.drain_deferred()
        };
        self.shared.signal.notify_all();
        fire_deferred(deferred, &self.error_handler);
    }

    fn role_name(&self) -> &str {
        "client-conductor"
    }
}

enum Harness {
    Runner(AgentRunner),
    Invoker(AgentInvoker<ConductorAgent>),
}

/// Entry point for talking to the media driver.
///
/// One `Client` per driver per application is the expected shape. Dropping
/// the client closes it.
pub struct Client {
    shared: Option<Arc<ConductorShared>>,
    harness: Option<Harness>,
    cnc: Option<Arc<CncFile>>,
    counters_metadata: Region,
    counters_values: Region,
    client_id: i64,
    use_invoker: bool,
    driver_timeout_ms: u64,
    publication_connection_timeout_ms: i64,
    image_map_mode: ImageMapMode,
    epoch_clock: Arc<dyn EpochClock>,
    error_handler: ErrorHandler,
}

impl Client {
    /// Connects to the media driver described by `ctx`.
    ///
    /// Concludes the context (performing the CnC handshake), constructs
    /// the conductor, and starts the configured harness. On any failure
    /// every acquired resource, the CnC mapping included, is released
    /// before the error propagates.
    ///
    /// # Errors
    ///
    /// Handshake errors per [`Context::conclude`]; [`ClientError::Thread`]
    /// if the conductor thread cannot be started.
    pub fn connect(ctx: Context) -> Result<Self> {
        let concluded = ctx.conclude()?;
        Self::from_concluded(concluded)
    }

    fn from_concluded(concluded: ConcludedContext) -> Result<Self> {
        let ConcludedContext {
            cnc,
            to_driver,
            to_clients,
            counters_metadata,
            counters_values,
            client_id,
            driver_timeout_ms,
            use_conductor_agent_invoker,
            epoch_clock,
            nano_clock,
            idle_strategy,
            keep_alive_interval_ns,
            inter_service_timeout_ns,
            publication_connection_timeout_ms,
            image_map_mode,
            thread_factory,
            error_handler,
            available_image_handler,
            unavailable_image_handler,
        } = concluded;

        let conductor = ClientConductor::new(ConductorSettings {
            proxy: DriverProxy::new(to_driver.clone(), client_id),
            to_driver,
            to_clients,
            epoch_clock: Arc::clone(&epoch_clock),
            nano_clock,
            keep_alive_interval_ns,
            inter_service_timeout_ns,
            driver_timeout_ms,
            available_image_handler,
            unavailable_image_handler,
        });

        let shared = Arc::new(ConductorShared {
            conductor: Mutex::new(conductor),
            signal: Condvar::new(),
        });
        let agent = ConductorAgent {
            shared: Arc::clone(&shared),
            error_handler: Arc::clone(&error_handler),
        };

        // A failure from here on drops the conductor and with it the CnC
        // mapping, so connect never leaks a region.
        let harness = if use_conductor_agent_invoker {
            let mut invoker = AgentInvoker::new(agent, Arc::clone(&error_handler));
            invoker.start()?;
            Harness::Invoker(invoker)
        } else {
            Harness::Runner(AgentRunner::start(
                agent,
                idle_strategy,
                Arc::clone(&error_handler),
                &thread_factory,
            )?)
        };

        info!(client_id, invoker = use_conductor_agent_invoker, "client connected");

        Ok(Self {
            shared: Some(shared),
            harness: Some(harness),
            cnc: Some(cnc),
            counters_metadata,
            counters_values,
            client_id,
            use_invoker: use_conductor_agent_invoker,
            driver_timeout_ms,
            publication_connection_timeout_ms,
            image_map_mode,
            epoch_clock,
            error_handler,
        })
    }

    /// The identity this client presents to the driver.
    #[must_use]
    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    /// Timeout for deciding a publication has no connected subscribers.
    #[must_use]
    pub fn publication_connection_timeout_ms(&self) -> i64 {
        self.publication_connection_timeout_ms
    }

    /// Mapping mode for image log buffers handed to layers above.
    #[must_use]
    pub fn image_map_mode(&self) -> ImageMapMode {
        self.image_map_mode
    }

    /// Whether the client or its conductor has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match &self.shared {
            Some(shared) => shared.lock().is_closed(),
            None => true,
        }
    }

    /// The embedded invoker, when configured with
    /// [`Context::use_conductor_agent_invoker`]. The application must tick
    /// it for the conductor to make progress.
    pub fn conductor_agent_invoker(&mut self) -> Option<&mut AgentInvoker<ConductorAgent>> {
        match self.harness.as_mut() {
            Some(Harness::Invoker(invoker)) => Some(invoker),
            _ => None,
        }
    }

    /// Registers a publication on `channel`/`stream_id`, waiting for the
    /// driver's response.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Registration`] if the driver rejected the request
    /// - [`ClientError::DriverTimeout`] if no response arrived in time
    /// - [`ClientError::ClientClosed`] after close
    pub fn add_publication(&self, channel: &str, stream_id: i32) -> Result<Publication> {
        match self.await_registration(|c| c.add_publication(channel, stream_id))? {
            CompletedRegistration::Publication(publication) => Ok(publication),
            other => Err(unexpected_outcome(&other)),
        }
    }

    /// Registers an exclusive (single-writer) publication.
    ///
    /// # Errors
    ///
    /// As for [`Client::add_publication`].
    pub fn add_exclusive_publication(&self, channel: &str, stream_id: i32) -> Result<Publication> {
        match self.await_registration(|c| c.add_exclusive_publication(channel, stream_id))? {
            CompletedRegistration::Publication(publication) => Ok(publication),
            other => Err(unexpected_outcome(&other)),
        }
    }

    /// Registers a subscription using the context-wide image handlers.
    ///
    /// # Errors
    ///
    /// As for [`Client::add_publication`].
    pub fn add_subscription(&self, channel: &str, stream_id: i32) -> Result<Subscription> {
        self.add_subscription_with_handlers(channel, stream_id, None, None)
    }

    /// Registers a subscription with its own image handlers, overriding
    /// the context-wide defaults. `None` keeps the default.
    ///
    /// # Errors
    ///
    /// As for [`Client::add_publication`].
    pub fn add_subscription_with_handlers(
        &self,
        channel: &str,
        stream_id: i32,
        on_available: Option<ImageHandler>,
        on_unavailable: Option<ImageHandler>,
    ) -> Result<Subscription> {
        let outcome = self.await_registration(|c| {
            c.add_subscription(
                channel,
                stream_id,
                on_available.clone(),
                on_unavailable.clone(),
            )
        })?;
        match outcome {
            CompletedRegistration::Subscription(subscription) => Ok(subscription),
            other => Err(unexpected_outcome(&other)),
        }
    }

    /// Releases a publication, waiting for the driver to acknowledge.
    ///
    /// # Errors
    ///
    /// As for [`Client::add_publication`].
    pub fn release_publication(&self, publication: Publication) -> Result<()> {
        match self.await_registration(|c| c.release_publication(publication.registration_id))? {
            CompletedRegistration::Removed => Ok(()),
            other => Err(unexpected_outcome(&other)),
        }
    }

    /// Releases a subscription, waiting for the driver to acknowledge.
    /// Images still live on it become unavailable.
    ///
    /// # Errors
    ///
    /// As for [`Client::add_publication`].
    pub fn release_subscription(&self, subscription: Subscription) -> Result<()> {
        match self.await_registration(|c| c.release_subscription(subscription.registration_id))? {
            CompletedRegistration::Removed => Ok(()),
            other => Err(unexpected_outcome(&other)),
        }
    }

    /// Allocates a correlation id unique across every client of this
    /// driver. Useful for application-level request/response pairing.
    ///
    /// # Errors
    ///
    /// [`ClientError::ClientClosed`] after close.
    pub fn next_correlation_id(&self) -> Result<i64> {
        self.shared()?.lock().next_correlation_id()
    }

    /// A reader over the driver's counters.
    ///
    /// The reader holds the CnC mapping alive until dropped, even across
    /// [`Client::close`].
    ///
    /// # Errors
    ///
    /// [`ClientError::ClientClosed`] after close.
    pub fn counters_reader(&self) -> Result<CountersReader> {
        let shared = self.shared()?;
        if shared.lock().is_closed() {
            return Err(ClientError::ClientClosed);
        }
        let cnc = self.cnc.as_ref().ok_or(ClientError::ClientClosed)?;
        Ok(CountersReader::new(
            Arc::clone(cnc),
            self.counters_metadata,
            self.counters_values,
        ))
    }

    /// Shuts the harness down, closes the conductor, and releases the CnC
    /// mapping. Safe to call repeatedly; later public operations fail with
    /// [`ClientError::ClientClosed`].
    pub fn close(&mut self) {
        if let Some(harness) = self.harness.as_mut() {
            match harness {
                Harness::Runner(runner) => runner.close(),
                Harness::Invoker(invoker) => invoker.close(),
            }
        }
        self.harness = None;
        self.shared = None;
        self.cnc = None;
        debug!(client_id = self.client_id, "client closed");
    }

    fn shared(&self) -> Result<&Arc<ConductorShared>> {
        self.shared.as_ref().ok_or(ClientError::ClientClosed)
    }

    /// Submits a command under the lock, then cooperatively waits for its
    /// response, bounded by the driver timeout. Ring backpressure on
    /// submission is retried each quantum.
    fn await_registration<F>(&self, mut submit: F) -> Result<CompletedRegistration>
    where
        F: FnMut(&mut ClientConductor) -> Result<i64>,
    {
        let shared = Arc::clone(self.shared()?);
        let deadline_ms = self.epoch_clock.time_ms() + self.driver_timeout_ms as i64;
        let mut guard = shared.lock();

        let correlation_id = loop {
            match submit(&mut guard) {
                Ok(correlation_id) => break correlation_id,
                Err(ClientError::Backpressure) => {
                    if self.epoch_clock.time_ms() > deadline_ms {
                        return Err(ClientError::DriverTimeout(
                            "command ring remained full past the driver timeout".to_string(),
                        ));
                    }
                    guard = self.await_tick(&shared, guard)?;
                }
                Err(error) => return Err(error),
            }
        };

        loop {
            if let Some(outcome) = guard.take_registration(correlation_id) {
                return outcome;
            }
            if self.epoch_clock.time_ms() > deadline_ms {
                guard.abandon_registration(correlation_id);
                return Err(ClientError::DriverTimeout(format!(
                    "no response from driver within {} ms",
                    self.driver_timeout_ms
                )));
            }
            guard = self.await_tick(&shared, guard)?;
        }
    }

    /// One wait quantum. In invoker mode the waiting thread drives the
    /// duty cycle directly; in dedicated-thread mode it parks on the
    /// conductor's signal. The lock is released for the duration of any
    /// sleep.
    fn await_tick<'a>(
        &self,
        shared: &'a ConductorShared,
        guard: MutexGuard<'a, ClientConductor>,
    ) -> Result<MutexGuard<'a, ClientConductor>> {
        if self.use_invoker {
            let mut guard = guard;
            let work = guard.do_work();
            let deferred = guard.drain_deferred();
            drop(guard);
            fire_deferred(deferred, &self.error_handler);
            match work {
                Ok(0) => std::thread::sleep(AWAIT_QUANTUM),
                Ok(_) => {}
                Err(error) => return Err(error),
            }
            Ok(shared.lock())
        } else {
            let (guard, _timed_out) = shared
                .signal
                .wait_timeout(guard, AWAIT_QUANTUM)
                .unwrap_or_else(PoisonError::into_inner);
            Ok(guard)
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

fn unexpected_outcome(outcome: &CompletedRegistration) -> ClientError {
    ClientError::Protocol(format!(
        "driver acknowledged a different registration kind: {outcome:?}"
    ))
}
