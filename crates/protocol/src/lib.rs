//! Lockwire Protocol - Frame definitions and serialization
//!
//! This crate defines the wire format spoken by the lockdown daemon:
//! - `FrameCodec`: 4-byte big-endian length prefix + property-list dictionary
//! - `LockdownRequest`/`Response`: the request vocabulary and reply accessors
//! - Validation of frame lengths and request/response pairing
//!
//! Payloads are `plist::Dictionary` values; binary encoding is the default,
//! decoding accepts binary and XML alike.

mod frame;
mod message;
mod validation;

pub use frame::*;
pub use message::*;
pub use validation::*;

pub use plist::{Dictionary, Value};
