//! TransportSession - one framed connection to the device

use crate::stream::Stream;
use lockwire_crypto::{client_config, PairingRecord, TlsError};
use lockwire_protocol::{CodecError, Dictionary, FrameCodec, WireFormat, MAX_FRAME_LEN};
use rustls::pki_types::ServerName;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Read timed out")]
    Timeout,

    #[error("Frame error: {0}")]
    Codec(CodecError),

    #[error("TLS upgrade failed: {0}")]
    Tls(String),

    #[error(transparent)]
    Credentials(#[from] TlsError),

    #[error("Session already upgraded to TLS")]
    AlreadyUpgraded,

    #[error("Session discarded after an earlier transport fault")]
    Poisoned,

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<CodecError> for TransportError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Closed => TransportError::Closed,
            CodecError::Timeout => TransportError::Timeout,
            CodecError::Io(e) => TransportError::Io(e),
            other => TransportError::Codec(other),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        CodecError::from(e).into()
    }
}

impl TransportError {
    pub(crate) fn from_handshake(e: io::Error) -> Self {
        match TransportError::from(e) {
            TransportError::Io(e) => TransportError::Tls(e.to_string()),
            other => other,
        }
    }
}

/// Socket and framing settings shared by lockdown and service connections
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,

    /// Bound on every blocking read; `None` blocks forever
    pub read_timeout: Option<Duration>,

    /// Bound on every blocking write
    pub write_timeout: Option<Duration>,

    /// Largest frame body accepted or produced
    pub max_frame_len: usize,

    /// Encoding for outgoing payloads
    pub format: WireFormat,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Some(Duration::from_secs(12)),
            write_timeout: Some(Duration::from_secs(12)),
            max_frame_len: MAX_FRAME_LEN,
            format: WireFormat::Binary,
        }
    }
}

impl TransportConfig {
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.max_frame_len, self.format)
    }
}

/// A connected socket exchanging framed dictionaries.
///
/// Owns its socket exclusively. The protocol has no request IDs, so callers
/// must read each response before sending the next request.
pub struct TransportSession {
    stream: Option<Stream>,
    codec: FrameCodec,
    peer: SocketAddr,
}

impl TransportSession {
    /// Open a TCP connection to `addr`
    pub fn connect(addr: SocketAddr, config: &TransportConfig) -> Result<Self, TransportError> {
        debug!("Connecting to {}", addr);
        let tcp = TcpStream::connect_timeout(&addr, config.connect_timeout)
            .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?;
        Self::from_stream(tcp, config)
    }

    /// Adopt an already-connected socket
    pub fn from_stream(tcp: TcpStream, config: &TransportConfig) -> Result<Self, TransportError> {
        tcp.set_read_timeout(config.read_timeout)?;
        tcp.set_write_timeout(config.write_timeout)?;
        tcp.set_nodelay(true)?;
        let peer = tcp.peer_addr()?;

        Ok(Self {
            stream: Some(Stream::Plain(tcp)),
            codec: config.codec(),
            peer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the socket is still usable
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_upgraded(&self) -> bool {
        self.stream.as_ref().is_some_and(Stream::is_tls)
    }

    /// Send one framed dictionary
    pub fn send(&mut self, dict: &Dictionary) -> Result<(), TransportError> {
        // Encoding failures leave the socket untouched
        let frame = self.codec.encode(dict)?;

        let stream = self.stream.as_mut().ok_or(TransportError::Poisoned)?;
        let result = stream.write_all(&frame).and_then(|()| stream.flush());

        result.map_err(|e| self.discard(e.into()))
    }

    /// Receive one framed dictionary
    pub fn recv(&mut self) -> Result<Dictionary, TransportError> {
        let codec = self.codec;
        let stream = self.stream.as_mut().ok_or(TransportError::Poisoned)?;
        let result = codec.decode(stream);

        result.map_err(|e| self.discard(e.into()))
    }

    /// Send a request and wait for its response
    pub fn request(&mut self, dict: &Dictionary) -> Result<Dictionary, TransportError> {
        self.send(dict)?;
        self.recv()
    }

    /// Upgrade this connection to TLS in place.
    ///
    /// Authenticates with the pairing record's host certificate and key;
    /// the device certificate is not chain-validated. Every frame after a
    /// successful upgrade travels inside TLS. Allowed once per connection.
    pub fn upgrade_tls(&mut self, pairing: &PairingRecord) -> Result<(), TransportError> {
        if self.is_upgraded() {
            return Err(TransportError::AlreadyUpgraded);
        }

        let config = client_config(pairing)?;

        let tcp = match self.stream.take() {
            Some(Stream::Plain(tcp)) => tcp,
            Some(tls @ Stream::Tls(_)) => {
                self.stream = Some(tls);
                return Err(TransportError::AlreadyUpgraded);
            }
            None => return Err(TransportError::Poisoned),
        };

        let server_name = ServerName::from(self.peer.ip());
        match Stream::into_tls(tcp, config, server_name) {
            Ok(stream) => {
                self.stream = Some(stream);
                info!("Upgraded connection to {} to TLS", self.peer);
                Ok(())
            }
            Err(e) => {
                warn!("TLS upgrade with {} failed: {}", self.peer, e);
                Err(e)
            }
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!("Closing connection to {}", self.peer);
            stream.shutdown();
        }
    }

    fn discard(&mut self, error: TransportError) -> TransportError {
        if self.stream.take().is_some() {
            warn!("Discarding connection to {}: {}", self.peer, error);
        }
        error
    }
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("peer", &self.peer)
            .field("is_open", &self.is_open())
            .field("is_upgraded", &self.is_upgraded())
            .finish()
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Raw byte access for services that do not speak framed dictionaries
impl Read for TransportSession {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let result = stream.read(buf);
        if matches!(&result, Err(e) if e.kind() != io::ErrorKind::Interrupted) {
            self.stream = None;
        }
        result
    }
}

impl Write for TransportSession {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let result = stream.write(buf);
        if matches!(&result, Err(e) if e.kind() != io::ErrorKind::Interrupted) {
            self.stream = None;
        }
        result
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => stream.flush(),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }
}
