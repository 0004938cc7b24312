//! Lockwire Client Library
//!
//! Talks to the lockdown daemon on a paired device: session handshake with
//! optional in-place TLS, read-only value queries, and service bootstrap.

pub mod config;
mod error;
pub mod lockdown;
pub mod query;
pub mod services;

pub use config::{LockdownConfig, ProbeConfig, ValueProbe, LOCKDOWN_PORT};
pub use error::LockdownError;
pub use lockdown::{LockdownClient, SessionState};
pub use query::{Decoded, QueryResult, Scalar, ValueSweep};
pub use services::{ServiceFailure, ServiceHandle, ServiceSweep};
