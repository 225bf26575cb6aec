//! Error taxonomy shared by every pipeline stage.

use thiserror::Error;

use crate::pipeline::port::PortDirection;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Allocation failure. Fatal to setup; setup may be retried.
    #[error("insufficient resources: {0}")]
    ResourceExhausted(String),

    /// The hardware reported a failure.
    #[error("device error: {0}")]
    Device(String),

    /// Framing or start-code failure for a single unit.
    #[error("malformed unit: {0}")]
    MalformedUnit(String),

    /// A buffer or request that does not belong to this component.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Nothing to do yet; retry on the next scheduling quantum.
    #[error("not ready")]
    NotReady,

    #[error("pixel conversion failed: {0}")]
    Conversion(String),

    #[error("{port} port: invalid state for {op}")]
    InvalidState { port: PortDirection, op: &'static str },

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// `NotReady` is a scheduling signal, not a failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NotReady)
    }

    /// Whether the stream can continue after this error was reported.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::ResourceExhausted(_) | Error::Config(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::ResourceExhausted(e.to_string())
    }
}
