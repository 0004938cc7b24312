//! Lockdown session - handshake state machine
//!
//! Connected -> (QueryType) -> StartSession -> (in-place TLS) -> Ready.
//! Any transport fault or out-of-step reply moves the session to `Failed`,
//! which is terminal: a new connection and handshake is the only way back.

use crate::config::LockdownConfig;
use crate::error::LockdownError;
use lockwire_crypto::PairingRecord;
use lockwire_protocol::{LockdownRequest, Response};
use lockwire_transport::TransportSession;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    TypeQueried,
    SessionStarted,
    TlsUpgraded,
    Ready,
    Failed(String),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connected => write!(f, "connected"),
            SessionState::TypeQueried => write!(f, "type-queried"),
            SessionState::SessionStarted => write!(f, "session-started"),
            SessionState::TlsUpgraded => write!(f, "tls-upgraded"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Client for the lockdown daemon on one device.
///
/// Holds the single lockdown connection for the session's lifetime. Requests
/// are strictly sequential; every method takes `&mut self`.
pub struct LockdownClient {
    transport: TransportSession,
    pairing: Arc<PairingRecord>,
    config: LockdownConfig,
    state: SessionState,
    session_id: Option<String>,
    device_type: Option<String>,
    // Service handles hold a Weak to this; dropping the client invalidates them
    liveness: Arc<()>,
}

impl LockdownClient {
    /// Open a TCP connection to the lockdown port
    pub fn connect(
        addr: SocketAddr,
        pairing: Arc<PairingRecord>,
        config: LockdownConfig,
    ) -> Result<Self, LockdownError> {
        let transport = TransportSession::connect(addr, &config.transport())?;
        info!("Connected to lockdown at {}", addr);
        Ok(Self::new(transport, pairing, config))
    }

    /// Wrap an already-connected transport
    pub fn new(
        transport: TransportSession,
        pairing: Arc<PairingRecord>,
        config: LockdownConfig,
    ) -> Self {
        Self {
            transport,
            pairing,
            config,
            state: SessionState::Connected,
            session_id: None,
            device_type: None,
            liveness: Arc::new(()),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Session identifier returned by StartSession
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Device type reported by QueryType
    pub fn device_type(&self) -> Option<&str> {
        self.device_type.as_deref()
    }

    /// Whether the lockdown connection now runs inside TLS
    pub fn is_upgraded(&self) -> bool {
        self.transport.is_upgraded()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.transport.peer_addr()
    }

    pub fn config(&self) -> &LockdownConfig {
        &self.config
    }

    pub fn pairing(&self) -> &PairingRecord {
        &self.pairing
    }

    /// Run the full handshake: optional QueryType, then StartSession
    pub fn handshake(&mut self) -> Result<(), LockdownError> {
        if self.config.query_type {
            self.query_type()?;
        }
        self.start_session()
    }

    /// Ask the daemon to identify itself.
    ///
    /// An `Error` reply is logged and ignored. Transport faults still fail
    /// the session since the connection is gone.
    pub fn query_type(&mut self) -> Result<Option<String>, LockdownError> {
        let response = self.exchange(&LockdownRequest::QueryType)?;

        if let Some(error) = response.error() {
            warn!("QueryType returned error {}, continuing", error);
            return Ok(None);
        }

        self.device_type = response.device_type().map(str::to_string);
        if self.state == SessionState::Connected {
            self.state = SessionState::TypeQueried;
        }
        debug!("Lockdown type: {:?}", self.device_type);

        Ok(self.device_type.clone())
    }

    /// Authenticate with the pairing identity and, when the device asks for
    /// it, upgrade the connection to TLS before anything else is sent.
    pub fn start_session(&mut self) -> Result<(), LockdownError> {
        match &self.state {
            SessionState::Connected | SessionState::TypeQueried => {}
            SessionState::Failed(reason) => return Err(LockdownError::SessionFailed(reason.clone())),
            other => {
                return Err(LockdownError::InvalidState {
                    expected: "connected",
                    actual: other.to_string(),
                })
            }
        }

        let request = LockdownRequest::StartSession {
            host_id: self.pairing.host_id().to_string(),
            system_buid: self.pairing.system_buid().to_string(),
        };
        let response = self.exchange(&request)?;

        if let Some(error) = response.error() {
            return Err(self.fail(LockdownError::SessionRejected(error.to_string())));
        }

        let Some(session_id) = response.session_id() else {
            return Err(self.fail(LockdownError::Protocol(
                "StartSession reply carries no SessionID".into(),
            )));
        };
        self.session_id = Some(session_id.to_string());
        self.state = SessionState::SessionStarted;
        info!("Lockdown session {} started", session_id);

        if response.enable_session_ssl() {
            if let Err(e) = self.transport.upgrade_tls(&self.pairing) {
                return Err(self.fail(e.into()));
            }
            self.state = SessionState::TlsUpgraded;
        }

        self.state = SessionState::Ready;
        Ok(())
    }

    /// End the session on the device. No-op without an active session.
    pub fn stop_session(&mut self) -> Result<(), LockdownError> {
        let Some(session_id) = self.session_id.take() else {
            return Ok(());
        };

        let response = self.exchange(&LockdownRequest::StopSession {
            session_id: session_id.clone(),
        })?;
        if let Some(error) = response.error() {
            warn!("StopSession {} returned error {}", session_id, error);
        } else {
            debug!("Lockdown session {} stopped", session_id);
        }

        Ok(())
    }

    /// Stop the session if one is active and close the connection.
    ///
    /// Every service handle issued by this client becomes stale.
    pub fn close(mut self) {
        if self.is_ready() {
            if let Err(e) = self.stop_session() {
                debug!("StopSession during close failed: {}", e);
            }
        }
        self.transport.close();
    }

    /// Send one request and read its reply.
    ///
    /// The reply's `Request` echo must match. Any failure here leaves the
    /// stream position unknown, so the session is failed and the socket
    /// dropped.
    pub(crate) fn exchange(&mut self, request: &LockdownRequest) -> Result<Response, LockdownError> {
        if let SessionState::Failed(reason) = &self.state {
            return Err(LockdownError::SessionFailed(reason.clone()));
        }

        let dict = request.to_dictionary(&self.config.label);
        trace!("-> {}", request.name());

        let response = match self.transport.request(&dict) {
            Ok(reply) => Response::from(reply),
            Err(e) => return Err(self.fail(e.into())),
        };

        if let Err(e) = response.validate_for(request) {
            return Err(self.fail(e.into()));
        }
        trace!("<- {} ({} keys)", request.name(), response.as_dictionary().len());

        Ok(response)
    }

    pub(crate) fn require_ready(&self) -> Result<(), LockdownError> {
        match &self.state {
            SessionState::Ready => Ok(()),
            SessionState::Failed(reason) => Err(LockdownError::SessionFailed(reason.clone())),
            other => Err(LockdownError::InvalidState {
                expected: "ready",
                actual: other.to_string(),
            }),
        }
    }

    pub(crate) fn liveness(&self) -> Weak<()> {
        Arc::downgrade(&self.liveness)
    }

    fn fail(&mut self, error: LockdownError) -> LockdownError {
        warn!("Lockdown session with {} failed: {}", self.peer_addr(), error);
        self.state = SessionState::Failed(error.to_string());
        self.transport.close();
        error
    }
}
