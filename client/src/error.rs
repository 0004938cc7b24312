use lockwire_crypto::PairingError;
use lockwire_protocol::ValidationError;
use lockwire_transport::TransportError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockdownError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Pairing record: {0}")]
    Pairing(#[from] PairingError),

    #[error("StartSession rejected: {0}")]
    SessionRejected(String),

    #[error("Session failed earlier: {0}")]
    SessionFailed(String),

    #[error("Operation needs a {expected} session, current state is {actual}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Response out of step with request: {0}")]
    Desync(#[from] ValidationError),

    #[error("Service {0} is not available on this device")]
    ServiceUnavailable(String),

    #[error("StartService {service} failed: {reason}")]
    ServiceFailed { service: String, reason: String },

    #[error("Pairing record carries no EscrowBag")]
    MissingEscrowBag,

    #[error("Service handle for {0} outlived the lockdown session that issued it")]
    StaleHandle(String),
}
