//! Plain or TLS-wrapped device socket

use crate::session::TransportError;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use tracing::trace;

pub(crate) enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Stream {
    /// Wrap an already-connected socket in TLS and finish the handshake.
    ///
    /// No new TCP connection is made. On failure the socket is dropped.
    pub(crate) fn into_tls(
        mut tcp: TcpStream,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<Self, TransportError> {
        let mut conn = ClientConnection::new(config, server_name)
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        while conn.is_handshaking() {
            let (rd, wr) = conn
                .complete_io(&mut tcp)
                .map_err(TransportError::from_handshake)?;
            trace!("TLS handshake progress: {} bytes in, {} bytes out", rd, wr);
        }

        Ok(Stream::Tls(Box::new(StreamOwned::new(conn, tcp))))
    }

    pub(crate) fn is_tls(&self) -> bool {
        matches!(self, Stream::Tls(_))
    }

    /// Best-effort close: TLS close_notify, then TCP shutdown
    pub(crate) fn shutdown(self) {
        match self {
            Stream::Plain(tcp) => {
                let _ = tcp.shutdown(Shutdown::Both);
            }
            Stream::Tls(mut tls) => {
                tls.conn.send_close_notify();
                let _ = tls.conn.complete_io(&mut tls.sock);
                let _ = tls.sock.shutdown(Shutdown::Both);
            }
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(tcp) => tcp.read(buf),
            Stream::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(tcp) => tcp.write(buf),
            Stream::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(tcp) => tcp.flush(),
            Stream::Tls(tls) => tls.flush(),
        }
    }
}
