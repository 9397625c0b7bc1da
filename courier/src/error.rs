use std::fmt;
use std::time::Duration;

use crate::service::ServiceState;

/// Failures reported by a [`BrokerClient`](crate::BrokerClient).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The receive stream for a subscription is closed for good.
    #[error("subscription {0:?} closed")]
    Closed(String),

    #[error("internal broker error: {0}")]
    Internal(String),
}

impl BrokerError {
    pub fn topic_not_found(name: &str) -> Self {
        BrokerError::NotFound {
            kind: "topic",
            name: name.to_owned(),
        }
    }

    pub fn subscription_not_found(name: &str) -> Self {
        BrokerError::NotFound {
            kind: "subscription",
            name: name.to_owned(),
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, BrokerError::AlreadyExists { .. })
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        BrokerError::Unavailable(err.to_string())
    }
}

/// Which setup step failed before any traffic flowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    CreateTopic,
    GetTopic,
    CreateSubscription,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupStage::CreateTopic => write!(f, "create topic"),
            SetupStage::GetTopic => write!(f, "get topic"),
            SetupStage::CreateSubscription => write!(f, "create subscription"),
        }
    }
}

/// One way a finished run differs from what was expected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    Count { expected: u64, actual: u64 },
    Payload { expected: Vec<u8>, actual: Option<Vec<u8>> },
    Attributes { expected: crate::Attributes, actual: Option<crate::Attributes> },
    PayloadSet { missing: Vec<Vec<u8>>, unexpected: Vec<Vec<u8>> },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::Count { expected, actual } => {
                write!(f, "expected {} messages, received {}", expected, actual)
            }
            Mismatch::Payload { expected, actual } => write!(
                f,
                "expected last payload {:?}, received {:?}",
                String::from_utf8_lossy(expected),
                actual.as_ref().map(|p| String::from_utf8_lossy(p).into_owned())
            ),
            Mismatch::Attributes { expected, actual } => write!(
                f,
                "expected last attributes {:?}, received {:?}",
                expected, actual
            ),
            Mismatch::PayloadSet {
                missing,
                unexpected,
            } => write!(
                f,
                "received payloads differ from published ({} missing, {} unexpected)",
                missing.len(),
                unexpected.len()
            ),
        }
    }
}

/// The single error type for harness operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Topic/subscription creation or lookup failed. Nothing was published.
    #[error("setup failed during {stage}: {source}")]
    Setup {
        stage: SetupStage,
        #[source]
        source: BrokerError,
    },

    /// One or more publish calls failed after setup succeeded.
    #[error("{} publish call(s) failed", .0.len())]
    Publish(Vec<(usize, BrokerError)>),

    #[error("subscription service cannot run from state {0:?}")]
    ServiceState(ServiceState),

    /// The subscription loop did not return within the scenario bound.
    #[error("subscription loop still running after {0:?}")]
    HangTimeout(Duration),

    #[error("delivery mismatch: {}", join_mismatches(.0))]
    DeliveryMismatch(Vec<Mismatch>),

    /// A background worker panicked or was cancelled.
    #[error("background worker failed: {0}")]
    Worker(String),

    #[error("health check timed out after {0:?}")]
    HealthTimeout(Duration),
}

fn join_mismatches(mismatches: &[Mismatch]) -> String {
    mismatches
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub(crate) fn setup(stage: SetupStage, source: BrokerError) -> Self {
        Error::Setup { stage, source }
    }

    pub fn is_setup(&self) -> bool {
        matches!(self, Error::Setup { .. })
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Worker(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
