use std::time::Duration;

use thiserror::Error;

use crate::exchange_spec::ParseError;

/// Errors that can occur while talking to the broker
#[derive(Error, Debug, Clone)]
pub enum WarrenError {
    /// Malformed exchange spec string
    #[error("invalid exchange spec: {0}")]
    Parse(#[from] ParseError),

    /// A Writer, Reader or Supervisor could not be constructed
    #[error("construction failed: {0}")]
    Construction(#[source] Box<WarrenError>),

    /// Network-level failure; recovered by the supervisor
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The initial connection attempt did not finish in time
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Authentication or permission failure
    #[error("access refused: {0}")]
    AccessRefused(String),

    /// Protocol negotiation failure
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Exchange still has bindings or consumers
    #[error("exchange {0} is in use")]
    ExchangeInUse(String),

    /// Exchange does not exist
    #[error("exchange {0} not found")]
    NotFound(String),

    /// Exchange exists with different kind or flags
    #[error("exchange {name} conflicts with an existing declaration: {details}")]
    SpecConflict { name: String, details: String },

    /// Operation attempted after close
    #[error("closed")]
    Closed,

    /// Supervisor gave up after a fatal reconnect failure
    #[error("session terminated: {0}")]
    Terminated(String),

    /// Background task already running
    #[error("already started")]
    AlreadyStarted,

    /// Rejected configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Any other broker-reported failure
    #[error("broker error: {0}")]
    Broker(String),
}

impl WarrenError {
    /// True for failures the supervisor recovers from by reconnecting.
    pub fn is_transient(&self) -> bool {
        matches!(self, WarrenError::ConnectionLost(_))
    }

    /// True for authentication/permission failures.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, WarrenError::AccessRefused(_))
    }

    pub(crate) fn construction(self) -> Self {
        match self {
            WarrenError::Construction(_) => self,
            other => WarrenError::Construction(Box::new(other)),
        }
    }
}

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, WarrenError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_classification() {
        // ---
        assert!(WarrenError::ConnectionLost("reset".into()).is_transient());
        assert!(!WarrenError::AccessRefused("guest".into()).is_transient());
        assert!(WarrenError::AccessRefused("guest".into()).is_auth_failure());
        assert!(!WarrenError::Closed.is_auth_failure());
    }

    #[test]
    fn test_construction_does_not_nest() {
        // ---
        let err = WarrenError::NotFound("x".into()).construction().construction();
        match err {
            WarrenError::Construction(inner) => {
                assert!(matches!(*inner, WarrenError::NotFound(_)))
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
