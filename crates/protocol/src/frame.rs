//! FrameCodec - length-prefixed property-list frames
//!
//! Every message on a lockdown (or service) connection is a 4-byte unsigned
//! big-endian length `N` followed by exactly `N` bytes of a serialized
//! property-list dictionary.

use crate::validation::{validate_frame_len, ValidationError, MAX_FRAME_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use plist::{Dictionary, Value};
use serde::Deserialize;
use std::io::{self, Cursor, Read, Write};
use thiserror::Error;
use tracing::trace;

/// Size of the big-endian length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Connection closed")]
    Closed,

    #[error("Read timed out")]
    Timeout,

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Frame payload is not a dictionary")]
    NotADictionary,

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => CodecError::Closed,
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => CodecError::Timeout,
            _ => CodecError::Io(e),
        }
    }
}

/// Property-list flavour used for outgoing payloads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// `bplist00` binary encoding
    #[default]
    Binary,
    /// XML encoding, as some host tools emit
    Xml,
}

/// Frame codec for encoding/decoding lockdown dictionaries
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_len: usize,
    format: WireFormat,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN, WireFormat::Binary)
    }
}

impl FrameCodec {
    /// Create a codec with the given body limit and outgoing format
    pub fn new(max_frame_len: usize, format: WireFormat) -> Self {
        Self {
            max_frame_len,
            format,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode a dictionary into a complete frame (prefix + body)
    pub fn encode(&self, dict: &Dictionary) -> Result<Bytes, CodecError> {
        let value = Value::Dictionary(dict.clone());
        let mut payload = Vec::new();
        let written = match self.format {
            WireFormat::Binary => value.to_writer_binary(&mut payload),
            WireFormat::Xml => value.to_writer_xml(&mut payload),
        };
        written.map_err(|e| CodecError::SerializationFailed(e.to_string()))?;

        validate_frame_len(payload.len(), self.max_frame_len)?;

        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(&payload);

        trace!("Encoded frame: {} byte body", payload.len());

        Ok(frame.freeze())
    }

    /// Read exactly one frame from `reader` and parse its dictionary.
    ///
    /// EOF anywhere inside the prefix or the body yields `CodecError::Closed`;
    /// a truncated body is never parsed. An oversized declared length is
    /// rejected before the body is allocated or read.
    pub fn decode<R: Read + ?Sized>(&self, reader: &mut R) -> Result<Dictionary, CodecError> {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        reader.read_exact(&mut prefix)?;

        let len = u32::from_be_bytes(prefix) as usize;
        validate_frame_len(len, self.max_frame_len)?;

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;

        trace!("Decoded frame: {} byte body", len);

        Self::parse_body(&body)
    }

    /// Encode and write one frame, flushing the writer
    pub fn write_frame<W: Write + ?Sized>(
        &self,
        writer: &mut W,
        dict: &Dictionary,
    ) -> Result<(), CodecError> {
        let frame = self.encode(dict)?;
        writer.write_all(&frame)?;
        writer.flush()?;
        Ok(())
    }

    fn parse_body(body: &[u8]) -> Result<Dictionary, CodecError> {
        let value = Value::from_reader(Cursor::new(body))
            .map_err(|e| CodecError::DeserializationFailed(e.to_string()))?;

        value.into_dictionary().ok_or(CodecError::NotADictionary)
    }
}
