//! Synchronous, in-process domain event bus (§4.8).
//!
//! Grounded on the teacher's worker-pool discipline (§5: transport
//! callbacks never run application logic inline) but the bus itself
//! dispatches synchronously on the emitter's thread, exactly as
//! specified -- it is the emitter's job to have already hopped onto a
//! worker task before calling `emit`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// The minimum set of domain events from §6, plus the rotation triggers
/// from §4.3/§4.4 threaded through as event payloads.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    CaCertificateChainChanged,
    CaConfigurationChanged,
    ConnectivityConfigurationChanged,
    ConnectivityChanged { hosts: Vec<String> },
    /// A real transport-level network UP/DOWN transition (§4.10) --
    /// distinct from `ConnectivityConfigurationChanged`, which fires on
    /// a `connectivity.hostAddresses` *configuration* change (§6).
    NetworkStateChanged { up: bool },
    SecurityConfigurationChanged { trust_duration_minutes: u64 },
    MetricsConfigurationChanged,
    SessionCreationSuccess { session_id: String },
    SessionCreationFailure { reason: String },
    AuthorizeClientDeviceActionSuccess,
    AuthorizeClientDeviceActionFail,
    GetClientDeviceAuthTokenSuccess,
    GetClientDeviceAuthTokenFailure,
    CertificateSubscriptionSuccess,
    CertificateSubscriptionFail,
}

impl DomainEvent {
    /// The dispatch class: listeners register against this discriminant,
    /// not the event's payload.
    pub fn class(&self) -> DomainEventClass {
        match self {
            DomainEvent::CaCertificateChainChanged => DomainEventClass::CaCertificateChainChanged,
            DomainEvent::CaConfigurationChanged => DomainEventClass::CaConfigurationChanged,
            DomainEvent::ConnectivityConfigurationChanged => {
                DomainEventClass::ConnectivityConfigurationChanged
            }
            DomainEvent::ConnectivityChanged { .. } => DomainEventClass::ConnectivityChanged,
            DomainEvent::NetworkStateChanged { .. } => DomainEventClass::NetworkStateChanged,
            DomainEvent::SecurityConfigurationChanged { .. } => {
                DomainEventClass::SecurityConfigurationChanged
            }
            DomainEvent::MetricsConfigurationChanged => DomainEventClass::MetricsConfigurationChanged,
            DomainEvent::SessionCreationSuccess { .. } | DomainEvent::SessionCreationFailure { .. } => {
                DomainEventClass::SessionCreation
            }
            DomainEvent::AuthorizeClientDeviceActionSuccess
            | DomainEvent::AuthorizeClientDeviceActionFail => {
                DomainEventClass::AuthorizeClientDeviceAction
            }
            DomainEvent::GetClientDeviceAuthTokenSuccess
            | DomainEvent::GetClientDeviceAuthTokenFailure => {
                DomainEventClass::GetClientDeviceAuthToken
            }
            DomainEvent::CertificateSubscriptionSuccess | DomainEvent::CertificateSubscriptionFail => {
                DomainEventClass::CertificateSubscription
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainEventClass {
    CaCertificateChainChanged,
    CaConfigurationChanged,
    ConnectivityConfigurationChanged,
    ConnectivityChanged,
    NetworkStateChanged,
    SecurityConfigurationChanged,
    MetricsConfigurationChanged,
    SessionCreation,
    AuthorizeClientDeviceAction,
    GetClientDeviceAuthToken,
    CertificateSubscription,
}

#[derive(Debug)]
pub struct ListenerError(pub String);

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for ListenerError {}

pub trait EventListener: Send + Sync {
    fn handle(&self, event: &DomainEvent) -> Result<(), ListenerError>;

    /// Identity used for the set-semantics of `register` -- defaults to
    /// the listener's address, which is unique per `Arc` allocation.
    fn identity(&self) -> usize {
        self as *const Self as *const () as usize
    }
}

pub type ErrorHandler = Arc<dyn Fn(DomainEventClass, ListenerError) + Send + Sync>;

/// Single-producer-multi-consumer event router.
///
/// Listener lists are stored behind a `RwLock` and cloned out before
/// dispatch (copy-on-write snapshot, §5) so that a listener registering
/// or unregistering during dispatch never observes -- or corrupts -- an
/// in-progress emission.
pub struct DomainEventBus {
    listeners: RwLock<HashMap<DomainEventClass, Vec<(usize, Arc<dyn EventListener>)>>>,
    error_handler: RwLock<Option<ErrorHandler>>,
}

impl Default for DomainEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl DomainEventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            error_handler: RwLock::new(None),
        }
    }

    pub fn set_error_handler(&self, handler: ErrorHandler) {
        *self.error_handler.write().unwrap() = Some(handler);
    }

    /// Register a listener for `class`. A no-op if an equal-identity
    /// listener is already registered (set semantics).
    pub fn register(&self, class: DomainEventClass, listener: Arc<dyn EventListener>) {
        let id = listener.identity();
        let mut listeners = self.listeners.write().unwrap();
        let entries = listeners.entry(class).or_default();
        if !entries.iter().any(|(existing_id, _)| *existing_id == id) {
            entries.push((id, listener));
        }
    }

    pub fn unregister(&self, class: DomainEventClass, listener: &Arc<dyn EventListener>) {
        let id = listener.identity();
        let mut listeners = self.listeners.write().unwrap();
        if let Some(entries) = listeners.get_mut(&class) {
            entries.retain(|(existing_id, _)| *existing_id != id);
        }
    }

    /// Dispatch synchronously, in registration order, to every listener
    /// registered for `event.class()`. Listener errors are forwarded to
    /// the error handler (if any) but never abort the dispatch chain.
    pub fn emit(&self, event: DomainEvent) {
        let class = event.class();
        let snapshot: Vec<Arc<dyn EventListener>> = {
            let listeners = self.listeners.read().unwrap();
            listeners
                .get(&class)
                .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default()
        };
        for listener in snapshot {
            if let Err(err) = listener.handle(&event) {
                tracing::warn!(?class, error = %err, "event listener returned an error");
                let handler = self.error_handler.read().unwrap().clone();
                if let Some(handler) = handler {
                    handler(class, err);
                }
            }
        }
    }
}
