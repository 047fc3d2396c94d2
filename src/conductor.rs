//! The client conductor: the single-threaded cooperative agent running the
//! client half of the client/driver protocol.
//!
//! The conductor advances only inside [`ClientConductor::do_work`]. One
//! duty cycle enforces the inter-service timeout, drains the driver's
//! response broadcast, and emits keepalives (checking the driver's own
//! heartbeat while it is at it). Application threads reach the typed entry
//! points under the client-wide lock held by the facade; they never drive
//! the duty cycle themselves in dedicated-thread mode.
//!
//! User callbacks and error-handler invocations are queued as deferred
//! events while the lock is held; the harness and facade drain the queue
//! and fire the callbacks after releasing it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::command::{DriverResponse, decode_response};
use crate::context::{ErrorHandler, ImageHandler};
use crate::error::{ClientError, Result};
use crate::ipc::broadcast::CopyBroadcastReceiver;
use crate::ipc::ring::CommandRing;
use crate::proxy::DriverProxy;
use crate::time::{EpochClock, NanoClock};
use crate::trace::{debug, warn};

/// Handle to a publication registered with the driver.
///
/// The registration id equals the correlation id of the command that
/// created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    /// Channel the publication was registered on.
    pub channel: String,
    /// Stream id within the channel.
    pub stream_id: i32,
    /// Driver-wide registration id.
    pub registration_id: i64,
}

/// Handle to a subscription registered with the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Channel the subscription was registered on.
    pub channel: String,
    /// Stream id within the channel.
    pub stream_id: i32,
    /// Driver-wide registration id.
    pub registration_id: i64,
}

/// A source image that appeared on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Driver-assigned id of the image itself.
    pub correlation_id: i64,
    /// Session id of the publisher behind the image.
    pub session_id: i32,
    /// Stream id the image carries.
    pub stream_id: i32,
    /// Registration id of the owning subscription.
    pub subscription_registration_id: i64,
    /// Driver-reported description of the source.
    pub source_identity: String,
}

/// Outcome of an awaited registration command.
#[derive(Debug, Clone)]
pub enum CompletedRegistration {
    /// An `add_publication` / `add_exclusive_publication` completed.
    Publication(Publication),
    /// An `add_subscription` completed.
    Subscription(Subscription),
    /// A remove command completed.
    Removed,
}

/// Callback work queued under the client lock, fired after releasing it.
pub(crate) enum DeferredEvent {
    Error(ClientError),
    AvailableImage {
        handler: Option<ImageHandler>,
        image: Image,
    },
    UnavailableImage {
        handler: Option<ImageHandler>,
        image: Image,
    },
}

/// Fires drained deferred events. Callers must not hold the client lock.
pub(crate) fn fire_deferred(events: Vec<DeferredEvent>, error_handler: &ErrorHandler) {
    for event in events {
        match event {
            DeferredEvent::Error(error) => error_handler(&error),
            DeferredEvent::AvailableImage { handler, image } => {
                if let Some(handler) = handler {
                    handler(&image);
                }
            }
            DeferredEvent::UnavailableImage { handler, image } => {
                if let Some(handler) = handler {
                    handler(&image);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConductorState {
    Running,
    Closed,
}

enum PendingKind {
    Publication {
        channel: String,
        stream_id: i32,
    },
    Subscription {
        channel: String,
        stream_id: i32,
        on_available: Option<ImageHandler>,
        on_unavailable: Option<ImageHandler>,
    },
    Remove,
}

enum PendingState {
    Awaiting,
    Ready,
    Failed(ClientError),
}

struct PendingRegistration {
    kind: PendingKind,
    state: PendingState,
}

struct SubscriptionFields {
    on_available: Option<ImageHandler>,
    on_unavailable: Option<ImageHandler>,
}

/// Everything the conductor needs at construction.
pub(crate) struct ConductorSettings {
    pub(crate) proxy: DriverProxy,
    pub(crate) to_driver: CommandRing,
    pub(crate) to_clients: CopyBroadcastReceiver,
    pub(crate) epoch_clock: Arc<dyn EpochClock>,
    pub(crate) nano_clock: Arc<dyn NanoClock>,
    pub(crate) keep_alive_interval_ns: i64,
    pub(crate) inter_service_timeout_ns: i64,
    pub(crate) driver_timeout_ms: u64,
    pub(crate) available_image_handler: Option<ImageHandler>,
    pub(crate) unavailable_image_handler: Option<ImageHandler>,
}

/// The cooperative agent running the client/driver protocol.
pub struct ClientConductor {
    proxy: DriverProxy,
    to_driver: CommandRing,
    to_clients: CopyBroadcastReceiver,
    epoch_clock: Arc<dyn EpochClock>,
    nano_clock: Arc<dyn NanoClock>,
    keep_alive_interval_ns: i64,
    inter_service_timeout_ns: i64,
    driver_timeout_ms: u64,
    last_keepalive_ns: i64,
    last_service_ns: i64,
    state: ConductorState,
    pending: HashMap<i64, PendingRegistration>,
    publications: HashSet<i64>,
    subscriptions: HashMap<i64, SubscriptionFields>,
    images: HashMap<i64, Image>,
    default_available_image_handler: Option<ImageHandler>,
    default_unavailable_image_handler: Option<ImageHandler>,
    deferred: Vec<DeferredEvent>,
}

impl ClientConductor {
    pub(crate) fn new(settings: ConductorSettings) -> Self {
        let now_ns = settings.nano_clock.nanos();
        Self {
            proxy: settings.proxy,
            to_driver: settings.to_driver,
            to_clients: settings.to_clients,
            epoch_clock: settings.epoch_clock,
            nano_clock: settings.nano_clock,
            keep_alive_interval_ns: settings.keep_alive_interval_ns,
            inter_service_timeout_ns: settings.inter_service_timeout_ns,
            driver_timeout_ms: settings.driver_timeout_ms,
            last_keepalive_ns: now_ns,
            last_service_ns: now_ns,
            state: ConductorState::Running,
            pending: HashMap::new(),
            publications: HashSet::new(),
            subscriptions: HashMap::new(),
            images: HashMap::new(),
            default_available_image_handler: settings.available_image_handler,
            default_unavailable_image_handler: settings.unavailable_image_handler,
            deferred: Vec::new(),
        }
    }

    /// Re-anchors the duty-cycle timestamps. Called by the harness just
    /// before the first duty cycle so construction-to-start delay does not
    /// count against the inter-service timeout.
    pub(crate) fn on_start(&mut self) {
        let now_ns = self.nano_clock.nanos();
        self.last_service_ns = now_ns;
        self.last_keepalive_ns = now_ns;
    }

    /// Whether the conductor has reached its terminal state.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == ConductorState::Closed
    }

    /// The client id stamped on outbound commands.
    #[must_use]
    pub fn client_id(&self) -> i64 {
        self.proxy.client_id()
    }

    /// Allocates the next driver-wide correlation id.
    ///
    /// # Errors
    ///
    /// [`ClientError::ClientClosed`] after close.
    pub fn next_correlation_id(&self) -> Result<i64> {
        self.ensure_open()?;
        Ok(self.to_driver.next_correlation_id())
    }

    /// One duty cycle. Returns the number of units of work performed.
    ///
    /// # Errors
    ///
    /// [`ClientError::DriverTimeout`] when the driver's heartbeat has gone
    /// stale; the conductor closes itself first. Other conditions are
    /// reported through the deferred event queue instead.
    pub fn do_work(&mut self) -> Result<usize> {
        if self.state == ConductorState::Closed {
            return Ok(0);
        }

        let now_ns = self.nano_clock.nanos();
        if now_ns > self.last_service_ns.saturating_add(self.inter_service_timeout_ns) {
            let service_interval_ns = now_ns - self.last_service_ns;
            warn!(service_interval_ns, "duty cycle starved, closing");
            self.force_close();
            self.deferred
                .push(DeferredEvent::Error(ClientError::InterServiceTimeout {
                    service_interval_ns,
                    timeout_ns: self.inter_service_timeout_ns,
                }));
            return Ok(0);
        }
        self.last_service_ns = now_ns;

        let mut work_count = self.drain_broadcast();
        work_count += self.on_check_timeouts(now_ns)?;
        Ok(work_count)
    }

    /// Closes the conductor, failing outstanding waits and releasing every
    /// registration. Idempotent.
    pub(crate) fn close(&mut self) {
        self.force_close();
    }

    /// Takes queued callback work to be fired off-lock.
    pub(crate) fn drain_deferred(&mut self) -> Vec<DeferredEvent> {
        std::mem::take(&mut self.deferred)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == ConductorState::Closed {
            return Err(ClientError::ClientClosed);
        }
        Ok(())
    }

    /// Submits an add-publication command. Returns the correlation id the
    /// caller must await via [`ClientConductor::take_registration`].
    ///
    /// # Errors
    ///
    /// [`ClientError::ClientClosed`] after close;
    /// [`ClientError::Backpressure`] if the command ring is full (retry).
    pub fn add_publication(&mut self, channel: &str, stream_id: i32) -> Result<i64> {
        self.ensure_open()?;
        let correlation_id = self.proxy.add_publication(channel, stream_id)?;
        self.pending.insert(
            correlation_id,
            PendingRegistration {
                kind: PendingKind::Publication {
                    channel: channel.to_string(),
                    stream_id,
                },
                state: PendingState::Awaiting,
            },
        );
        Ok(correlation_id)
    }

    /// Submits an add-exclusive-publication command.
    ///
    /// # Errors
    ///
    /// As for [`ClientConductor::add_publication`].
    pub fn add_exclusive_publication(&mut self, channel: &str, stream_id: i32) -> Result<i64> {
        self.ensure_open()?;
        let correlation_id = self.proxy.add_exclusive_publication(channel, stream_id)?;
        self.pending.insert(
            correlation_id,
            PendingRegistration {
                kind: PendingKind::Publication {
                    channel: channel.to_string(),
                    stream_id,
                },
                state: PendingState::Awaiting,
            },
        );
        Ok(correlation_id)
    }

    /// Submits an add-subscription command. Image handlers override the
    /// context-wide defaults when set.
    ///
    /// # Errors
    ///
    /// As for [`ClientConductor::add_publication`].
    pub fn add_subscription(
        &mut self,
        channel: &str,
        stream_id: i32,
        on_available: Option<ImageHandler>,
        on_unavailable: Option<ImageHandler>,
    ) -> Result<i64> {
        self.ensure_open()?;
        let correlation_id = self.proxy.add_subscription(channel, stream_id)?;
        self.pending.insert(
            correlation_id,
            PendingRegistration {
                kind: PendingKind::Subscription {
                    channel: channel.to_string(),
                    stream_id,
                    on_available,
                    on_unavailable,
                },
                state: PendingState::Awaiting,
            },
        );
        Ok(correlation_id)
    }

    /// Submits removal of a publication registered by this client.
    ///
    /// # Errors
    ///
    /// [`ClientError::Registration`] if the id is not a live publication;
    /// otherwise as for [`ClientConductor::add_publication`].
    pub fn release_publication(&mut self, registration_id: i64) -> Result<i64> {
        self.ensure_open()?;
        if !self.publications.contains(&registration_id) {
            return Err(ClientError::Registration {
                code: crate::command::ERROR_CODE_UNKNOWN_PUBLICATION,
                message: format!("unknown publication registration id {registration_id}"),
            });
        }
        let correlation_id = self.proxy.remove_publication(registration_id)?;
        self.publications.remove(&registration_id);
        self.pending.insert(
            correlation_id,
            PendingRegistration {
                kind: PendingKind::Remove,
                state: PendingState::Awaiting,
            },
        );
        Ok(correlation_id)
    }

    /// Submits removal of a subscription registered by this client. Images
    /// still live on the subscription become unavailable.
    ///
    /// # Errors
    ///
    /// [`ClientError::Registration`] if the id is not a live subscription;
    /// otherwise as for [`ClientConductor::add_publication`].
    pub fn release_subscription(&mut self, registration_id: i64) -> Result<i64> {
        self.ensure_open()?;
        if !self.subscriptions.contains_key(&registration_id) {
            return Err(ClientError::Registration {
                code: crate::command::ERROR_CODE_UNKNOWN_SUBSCRIPTION,
                message: format!("unknown subscription registration id {registration_id}"),
            });
        }
        let correlation_id = self.proxy.remove_subscription(registration_id)?;
        if let Some(fields) = self.subscriptions.remove(&registration_id) {
            self.drop_images_of_subscription(registration_id, &fields);
        }
        self.pending.insert(
            correlation_id,
            PendingRegistration {
                kind: PendingKind::Remove,
                state: PendingState::Awaiting,
            },
        );
        Ok(correlation_id)
    }

    /// Polls the outcome of an awaited command, consuming it when decided.
    ///
    /// Returns `None` while the response is still outstanding.
    pub fn take_registration(
        &mut self,
        correlation_id: i64,
    ) -> Option<Result<CompletedRegistration>> {
        match self.pending.get(&correlation_id)?.state {
            PendingState::Awaiting => None,
            _ => {
                let pending = self.pending.remove(&correlation_id)?;
                Some(match pending.state {
                    PendingState::Awaiting => unreachable!("checked above"),
                    PendingState::Failed(error) => Err(error),
                    PendingState::Ready => Ok(match pending.kind {
                        PendingKind::Publication { channel, stream_id } => {
                            CompletedRegistration::Publication(Publication {
                                channel,
                                stream_id,
                                registration_id: correlation_id,
                            })
                        }
                        PendingKind::Subscription {
                            channel, stream_id, ..
                        } => CompletedRegistration::Subscription(Subscription {
                            channel,
                            stream_id,
                            registration_id: correlation_id,
                        }),
                        PendingKind::Remove => CompletedRegistration::Removed,
                    }),
                })
            }
        }
    }

    /// Abandons an awaited command after the caller gave up on it.
    ///
    /// A late response for the correlation id will be ignored.
    pub fn abandon_registration(&mut self, correlation_id: i64) {
        self.pending.remove(&correlation_id);
    }

    fn drain_broadcast(&mut self) -> usize {
        let mut responses: Vec<Result<DriverResponse>> = Vec::new();
        let receive_result = self
            .to_clients
            .receive(&mut |msg_type, bytes| responses.push(decode_response(msg_type, bytes)));

        let mut work_count = 0;
        for response in responses {
            work_count += 1;
            match response {
                Ok(response) => self.on_response(response),
                Err(error) => self.deferred.push(DeferredEvent::Error(error)),
            }
        }
        if let Err(error) = receive_result {
            self.deferred.push(DeferredEvent::Error(error));
            work_count += 1;
        }
        work_count
    }

    fn on_response(&mut self, response: DriverResponse) {
        match response {
            DriverResponse::OperationSuccess { correlation_id } => {
                let Some(pending) = self.pending.get_mut(&correlation_id) else {
                    // Response for another client sharing the broadcast.
                    return;
                };
                match &pending.kind {
                    PendingKind::Publication { .. } => {
                        self.publications.insert(correlation_id);
                    }
                    PendingKind::Subscription {
                        on_available,
                        on_unavailable,
                        ..
                    } => {
                        self.subscriptions.insert(
                            correlation_id,
                            SubscriptionFields {
                                on_available: on_available.clone(),
                                on_unavailable: on_unavailable.clone(),
                            },
                        );
                    }
                    PendingKind::Remove => {}
                }
                pending.state = PendingState::Ready;
                debug!(correlation_id, "registration acknowledged");
            }
            DriverResponse::Error {
                offending_correlation_id,
                code,
                message,
            } => {
                if let Some(pending) = self.pending.get_mut(&offending_correlation_id) {
                    pending.state =
                        PendingState::Failed(ClientError::Registration { code, message });
                }
                // Errors for other clients are not ours to report.
            }
            DriverResponse::AvailableImage {
                correlation_id,
                subscription_registration_id,
                session_id,
                stream_id,
                source_identity,
            } => {
                if let Some(subscription) =
                    self.subscriptions.get(&subscription_registration_id)
                {
                    let image = Image {
                        correlation_id,
                        session_id,
                        stream_id,
                        subscription_registration_id,
                        source_identity,
                    };
                    let handler = subscription
                        .on_available
                        .clone()
                        .or_else(|| self.default_available_image_handler.clone());
                    self.images.insert(correlation_id, image.clone());
                    self.deferred
                        .push(DeferredEvent::AvailableImage { handler, image });
                }
            }
            DriverResponse::UnavailableImage { correlation_id, .. } => {
                if let Some(image) = self.images.remove(&correlation_id) {
                    let handler = self
                        .subscriptions
                        .get(&image.subscription_registration_id)
                        .and_then(|s| s.on_unavailable.clone())
                        .or_else(|| self.default_unavailable_image_handler.clone());
                    self.deferred
                        .push(DeferredEvent::UnavailableImage { handler, image });
                }
            }
            DriverResponse::CounterReady { correlation_id, .. }
            | DriverResponse::CounterUnavailable { correlation_id, .. } => {
                // No counter commands originate from this client;
                // informational for counters the driver manages itself.
                debug!(correlation_id, "counter lifecycle event");
            }
        }
    }

    fn on_check_timeouts(&mut self, now_ns: i64) -> Result<usize> {
        if now_ns - self.last_keepalive_ns < self.keep_alive_interval_ns {
            return Ok(0);
        }

        let now_ms = self.epoch_clock.time_ms();
        let last_driver_heartbeat_ms = self.to_driver.consumer_heartbeat_time();
        if now_ms > last_driver_heartbeat_ms.saturating_add(self.driver_timeout_ms as i64) {
            self.force_close();
            return Err(ClientError::DriverTimeout(format!(
                "media driver has been inactive for over {} ms",
                self.driver_timeout_ms
            )));
        }

        match self.proxy.send_client_keepalive() {
            Ok(()) => {
                self.last_keepalive_ns = now_ns;
                Ok(1)
            }
            // Ring full: retry on the next duty cycle.
            Err(ClientError::Backpressure) => Ok(0),
            Err(error) => {
                self.deferred.push(DeferredEvent::Error(error));
                Ok(0)
            }
        }
    }

    fn drop_images_of_subscription(
        &mut self,
        subscription_registration_id: i64,
        fields: &SubscriptionFields,
    ) {
        let removed: Vec<Image> = {
            let mut removed = Vec::new();
            self.images.retain(|_, image| {
                if image.subscription_registration_id == subscription_registration_id {
                    removed.push(image.clone());
                    false
                } else {
                    true
                }
            });
            removed
        };
        for image in removed {
            let handler = fields
                .on_unavailable
                .clone()
                .or_else(|| self.default_unavailable_image_handler.clone());
            self.deferred
                .push(DeferredEvent::UnavailableImage { handler, image });
        }
    }

    fn force_close(&mut self) {
        if self.state == ConductorState::Closed {
            return;
        }
        self.state = ConductorState::Closed;

        for pending in self.pending.values_mut() {
            if matches!(pending.state, PendingState::Awaiting) {
                pending.state = PendingState::Failed(ClientError::ClientClosed);
            }
        }

        let images: Vec<Image> = self.images.drain().map(|(_, image)| image).collect();
        for image in images {
            let handler = self
                .subscriptions
                .get(&image.subscription_registration_id)
                .and_then(|s| s.on_unavailable.clone())
                .or_else(|| self.default_unavailable_image_handler.clone());
            self.deferred
                .push(DeferredEvent::UnavailableImage { handler, image });
        }

        self.publications.clear();
        self.subscriptions.clear();
    }
}
