//! Lockwire Crypto - Pairing credentials and TLS configuration
//!
//! This crate provides:
//! - `PairingRecord`: host identifiers and the paired certificate/key bundle
//! - TLS client configuration that authenticates with the pairing keypair
//!   and does not validate the device's certificate chain

mod pairing;
mod tls;

pub use pairing::*;
pub use tls::*;
