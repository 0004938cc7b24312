//! Service bootstrap
//!
//! StartService asks lockdown to launch a named service and returns the port
//! it listens on. Connecting to that port is a separate TCP connection to the
//! same device, upgraded to TLS only when the StartService reply asked for it.

use crate::error::LockdownError;
use crate::lockdown::LockdownClient;
use lockwire_protocol::LockdownRequest;
use lockwire_transport::TransportSession;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Weak;
use tracing::{debug, info, warn};

/// A started service, valid while the issuing lockdown client lives
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHandle {
    pub name: String,
    pub port: u16,
    pub requires_ssl: bool,
    #[serde(skip_serializing)]
    owner: Weak<()>,
}

impl ServiceHandle {
    /// Whether the issuing lockdown client is still alive
    pub fn is_live(&self) -> bool {
        self.owner.strong_count() > 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceFailure {
    pub service: String,
    pub reason: String,
}

/// Outcome of a service sweep. Every candidate tried lands in exactly one list.
#[derive(Debug, Default, Serialize)]
pub struct ServiceSweep {
    pub started: Vec<ServiceHandle>,
    pub unavailable: Vec<String>,
    pub failed: Vec<ServiceFailure>,
    /// The fault that ended the sweep early, if any
    #[serde(skip)]
    pub aborted: Option<LockdownError>,
}

impl ServiceSweep {
    pub fn len(&self) -> usize {
        self.started.len() + self.unavailable.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every candidate was tried
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }
}

impl LockdownClient {
    /// Start a service by name. Requires a ready session.
    pub fn start_service(&mut self, name: &str) -> Result<ServiceHandle, LockdownError> {
        self.request_service(name, None)
    }

    /// Start a service, attaching the pairing record's EscrowBag
    pub fn start_service_with_escrow(&mut self, name: &str) -> Result<ServiceHandle, LockdownError> {
        let bag = self
            .pairing()
            .escrow_bag()
            .map(<[u8]>::to_vec)
            .ok_or(LockdownError::MissingEscrowBag)?;
        self.request_service(name, Some(bag))
    }

    fn request_service(
        &mut self,
        name: &str,
        escrow_bag: Option<Vec<u8>>,
    ) -> Result<ServiceHandle, LockdownError> {
        self.require_ready()?;

        let response = self.exchange(&LockdownRequest::StartService {
            service: name.to_string(),
            escrow_bag,
        })?;

        if let Some(error) = response.error() {
            if self.config().is_unavailable_error(error) {
                return Err(LockdownError::ServiceUnavailable(name.to_string()));
            }
            return Err(LockdownError::ServiceFailed {
                service: name.to_string(),
                reason: error.to_string(),
            });
        }

        let port = response
            .port()
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                LockdownError::Protocol(format!("StartService {name} reply has no usable Port"))
            })?;

        let handle = ServiceHandle {
            name: name.to_string(),
            port,
            requires_ssl: response.enable_service_ssl(),
            owner: self.liveness(),
        };
        debug!(
            "Service {} on port {} (ssl: {})",
            handle.name, handle.port, handle.requires_ssl
        );

        Ok(handle)
    }

    /// Open a new connection to a started service.
    ///
    /// TLS is applied iff the handle says so. Refuses handles issued by
    /// another client or one that has since been closed.
    pub fn connect_service(&self, handle: &ServiceHandle) -> Result<TransportSession, LockdownError> {
        if !handle.owner.ptr_eq(&self.liveness()) || !handle.is_live() {
            return Err(LockdownError::StaleHandle(handle.name.clone()));
        }
        self.require_ready()?;

        let addr = SocketAddr::new(self.peer_addr().ip(), handle.port);
        let mut session = TransportSession::connect(addr, &self.config().transport())?;
        if handle.requires_ssl {
            session.upgrade_tls(self.pairing())?;
        }

        info!(
            "Connected to {} at {}{}",
            handle.name,
            addr,
            if handle.requires_ssl { " over TLS" } else { "" }
        );
        Ok(session)
    }

    /// Try to start every candidate service in order.
    ///
    /// "Not present" and other per-service errors are recorded and the sweep
    /// continues. A fault that fails the session ends the sweep, keeping the
    /// candidates classified so far.
    pub fn sweep_services<S: AsRef<str>>(&mut self, names: &[S]) -> ServiceSweep {
        let mut sweep = ServiceSweep::default();

        for name in names {
            let name = name.as_ref();
            match self.start_service(name) {
                Ok(handle) => sweep.started.push(handle),
                Err(LockdownError::ServiceUnavailable(_)) => {
                    debug!("Service {} not present", name);
                    sweep.unavailable.push(name.to_string());
                }
                Err(LockdownError::ServiceFailed { service, reason }) => {
                    warn!("Service {} failed to start: {}", service, reason);
                    sweep.failed.push(ServiceFailure { service, reason });
                }
                Err(LockdownError::Protocol(reason)) => {
                    warn!("Service {}: {}", name, reason);
                    sweep.failed.push(ServiceFailure {
                        service: name.to_string(),
                        reason,
                    });
                }
                Err(e) => {
                    warn!("Service sweep aborted at {}: {}", name, e);
                    sweep.aborted = Some(e);
                    break;
                }
            }
        }

        info!(
            "Service sweep: {} started, {} unavailable, {} failed",
            sweep.started.len(),
            sweep.unavailable.len(),
            sweep.failed.len()
        );
        sweep
    }
}
