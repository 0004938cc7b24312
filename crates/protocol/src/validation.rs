//! Frame validation utilities

use crate::message::keys;
use plist::Dictionary;
use thiserror::Error;

/// Validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Response for {received} received while awaiting {expected}")]
    RequestMismatch { expected: String, received: String },
}

/// Maximum allowed frame body (64MB)
pub const MAX_FRAME_LEN: usize = 64 << 20;

/// Check a declared or encoded body length against the configured ceiling.
///
/// The length prefix is a `u32`, so anything above `u32::MAX` is rejected
/// regardless of `max`.
pub fn validate_frame_len(len: usize, max: usize) -> Result<(), ValidationError> {
    let max = max.min(u32::MAX as usize);
    if len > max {
        return Err(ValidationError::FrameTooLarge { size: len, max });
    }
    Ok(())
}

/// Validate that a response belongs to the request just sent.
///
/// The daemon echoes `Request` on most replies. There are no request IDs,
/// so an echo naming a different request means the stream is out of step.
/// Replies without an echo are accepted.
pub fn validate_response(expected: &str, response: &Dictionary) -> Result<(), ValidationError> {
    match response.get(keys::REQUEST).and_then(|v| v.as_string()) {
        Some(received) if received != expected => Err(ValidationError::RequestMismatch {
            expected: expected.to_string(),
            received: received.to_string(),
        }),
        _ => Ok(()),
    }
}
