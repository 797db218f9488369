pub mod attributes_cache;
pub mod ca;
pub mod certmanager;
pub mod certregistry;
pub mod certstore;
pub mod cloud;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod logging;
pub mod network;
pub mod policy;
pub mod session;
pub mod thing;
pub mod transport;
pub mod types;
pub mod usecase;

pub use attributes_cache::ThingAttributesCache;
pub use ca::{CaKeyPair, IssuedLeaf, KeyAlgorithm, LeafKind};
pub use certmanager::{CertificateManager, IssuedMaterial, SubscribeRequest, SubscriptionHandle};
pub use certregistry::CertificateRegistry;
pub use certstore::CertificateStore;
pub use cloud::{CloudIdentityClient, MockCloudIdentityClient, ThingAttributes, ThingDescription, VerifyOutcome};
pub use config::CdaConfig;
pub use connectivity::ConnectivityTracker;
pub use error::*;
pub use events::{DomainEvent, DomainEventBus, DomainEventClass, EventListener};
pub use logging::{initialize_default_logging, initialize_logging, LogFormat, LoggingConfig};
pub use network::{ConnectivityConfigTracker, NetworkStateTracker};
pub use policy::{Permission, Policy, PolicyEvaluator};
pub use session::{AttributeNamespace, Credentials, MqttSessionFactory, Session, SessionFactory, SessionManager};
pub use thing::{
    AttachmentDecision, AttachmentSource, Thing, ThingRegistry, VerifyAttachedInput,
    VerifyThingAttachedToCertificate, VerifyThingAttachedUseCase,
};
pub use transport::{InboundMessage, MockMqttTransport, MqttTransport, NetworkState, QoS};
pub use types::*;
pub use usecase::{Scope, UseCase, UseCaseRegistry};
