//! Lockwire Transport - Framed sessions over a device socket
//!
//! This crate provides:
//! - `TransportSession`: one TCP connection speaking length-prefixed
//!   property-list frames, strictly one request then one response
//! - In-place TLS upgrade of that same connection using pairing credentials
//!
//! Any I/O fault discards the socket. A late reply arriving after a timeout
//! would otherwise be read as the answer to the next request.

mod session;
mod stream;

pub use session::*;
