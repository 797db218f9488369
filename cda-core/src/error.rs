use thiserror::Error;

/// Top-level error type for the client-device-auth core.
///
/// Mirrors the per-subsystem split the rest of this crate uses: each
/// component gets its own error enum, composed here via `#[from]`.
#[derive(Debug, Error)]
pub enum CdaError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("keystore error: {0}")]
    Keystore(#[from] KeystoreError),

    #[error("certificate authority error: {0}")]
    Ca(#[from] CaError),

    #[error("certificate manager error: {0}")]
    CertManager(#[from] CertManagerError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("cloud service error: {0}")]
    Cloud(#[from] CloudError),

    #[error("authentication error: {0}")]
    Authentication(#[from] AuthenticationError),

    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("thing error: {0}")]
    Thing(#[from] ThingError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CdaResult<T> = Result<T, CdaError>;

/// A required configuration value was missing or ill-typed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration key: {0}")]
    Missing(String),

    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

/// Persistent I/O failures on the CA keystore, or a `NotFound` on an
/// absent device certificate.
#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("keystore unavailable: {0}")]
    Unavailable(String),

    #[error("device certificate not found: {0}")]
    NotFound(String),

    #[error("keystore io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("keystore encryption error: {0}")]
    Crypto(String),
}

/// X.509 generation failures from the CA.
#[derive(Debug, Error)]
pub enum CaError {
    #[error("certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("invalid host or IP in SAN list: {0}")]
    InvalidSanEntry(String),
}

/// Rotation/subscription failures from the certificate manager. Transient
/// by design: the prior leaf remains in force on any of these.
#[derive(Debug, Error)]
pub enum CertManagerError {
    #[error(transparent)]
    Ca(#[from] CaError),

    #[error("unknown subscription handle")]
    UnknownSubscription,
}

/// Errors from the (external) MQTT transport collaborator.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),
}

/// Errors from the (external) cloud identity collaborator. `Validation`
/// and `NotFound` are definite negatives and must never be retried or
/// cached as positive; `Unavailable`/`Throttled` are transient.
#[derive(Debug, Error, Clone)]
pub enum CloudError {
    #[error("cloud service unavailable: {0}")]
    Unavailable(String),

    #[error("cloud service throttled: {0}")]
    Throttled(String),

    #[error("validation rejected by cloud: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cancelled")]
    Interrupted,
}

impl CloudError {
    /// A definite negative: the cloud answered, the answer is "no", and
    /// the result must never be cached as a positive outcome.
    pub fn is_definite_negative(&self) -> bool {
        matches!(self, CloudError::Validation(_) | CloudError::NotFound(_))
    }
}

#[derive(Debug, Error, Clone)]
pub enum AuthenticationError {
    #[error("unknown credential type: {0}")]
    UnknownCredentialType(String),

    #[error("certificate not recognized")]
    CertificateNotRecognized,

    #[error("thing not attached to certificate")]
    NotAttached,

    #[error("cloud service interaction failed: {0}")]
    CloudServiceInteraction(#[from] CloudError),
}

/// A `thingName` failed the `[A-Za-z0-9_:\-]+` validation rule (§3).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ThingError {
    #[error("invalid thing name: {0}")]
    InvalidName(String),
}

/// Policy/variable evaluation failures. Per §4.7, any `PolicyError`
/// during evaluation is treated as `DENY` plus a logged error -- it is
/// never a silent allow.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("rule expression parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("unresolved policy variable: ${{{namespace}:{path}}}")]
    UnresolvedVariable { namespace: String, path: String },
}
