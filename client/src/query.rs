//! Device value queries
//!
//! GetValue replies are normalized into a closed set of shapes. Binary
//! leaves that themselves hold a property list are decoded in place, up to
//! `MAX_NESTED_DEPTH` levels; anything else stays opaque bytes.

use crate::config::ValueProbe;
use crate::error::LockdownError;
use crate::lockdown::LockdownClient;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use lockwire_protocol::{LockdownRequest, Response, Value};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::io::Cursor;
use tracing::{debug, trace, warn};

/// Nested property-list decoding stops at this depth
pub const MAX_NESTED_DEPTH: usize = 16;

/// Device error meaning "no value under this domain/key"
const MISSING_VALUE_ERROR: &str = "MissingValue";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    String(String),
    Integer(i64),
    Unsigned(u64),
    Real(f64),
    Boolean(bool),
    /// RFC 3339 timestamp
    Date(String),
    Uid(u64),
}

impl Scalar {
    /// Convert a non-container plist value
    fn from_value(value: Value) -> Self {
        match value {
            Value::String(s) => Scalar::String(s),
            Value::Boolean(b) => Scalar::Boolean(b),
            Value::Real(r) => Scalar::Real(r),
            Value::Integer(i) => match (i.as_signed(), i.as_unsigned()) {
                (Some(n), _) => Scalar::Integer(n),
                (None, Some(n)) => Scalar::Unsigned(n),
                (None, None) => Scalar::String(format!("{i:?}")),
            },
            Value::Date(d) => Scalar::Date(d.to_xml_format()),
            Value::Uid(u) => Scalar::Uid(u.get()),
            other => Scalar::String(format!("{other:?}")),
        }
    }
}

/// A normalized value tree
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Decoded {
    Scalar(Scalar),
    Dictionary(BTreeMap<String, Decoded>),
    Array(Vec<Decoded>),
    Opaque(#[serde(serialize_with = "as_base64")] Vec<u8>),
}

/// Outcome of one GetValue
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum QueryResult {
    /// No value: absent field, empty domain, or `MissingValue`
    Missing,
    Scalar(Scalar),
    /// Dictionary or array, nested property lists decoded
    Structured(Decoded),
    /// Binary data that is not a decodable property list
    Opaque(#[serde(serialize_with = "as_base64")] Vec<u8>),
    /// Device-reported error; the session remains usable
    Error(String),
}

impl QueryResult {
    pub fn from_response(mut response: Response) -> Self {
        if let Some(error) = response.error() {
            if error == MISSING_VALUE_ERROR {
                return QueryResult::Missing;
            }
            return QueryResult::Error(error.to_string());
        }

        match response.take_value() {
            Some(value) => Self::from_value(value),
            None => QueryResult::Missing,
        }
    }

    pub fn from_value(value: Value) -> Self {
        match normalize(value) {
            Decoded::Scalar(scalar) => QueryResult::Scalar(scalar),
            Decoded::Opaque(bytes) => QueryResult::Opaque(bytes),
            Decoded::Dictionary(dict) if dict.is_empty() => QueryResult::Missing,
            structured => QueryResult::Structured(structured),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, QueryResult::Missing)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, QueryResult::Error(_))
    }
}

/// Normalize a plist value, decoding nested property lists
pub fn normalize(value: Value) -> Decoded {
    normalize_at(value, 0)
}

fn normalize_at(value: Value, depth: usize) -> Decoded {
    match value {
        Value::Dictionary(dict) => Decoded::Dictionary(
            dict.into_iter()
                .map(|(k, v)| (k, normalize_at(v, depth)))
                .collect(),
        ),
        Value::Array(items) => {
            Decoded::Array(items.into_iter().map(|v| normalize_at(v, depth)).collect())
        }
        Value::Data(bytes) => decode_nested(bytes, depth),
        other => Decoded::Scalar(Scalar::from_value(other)),
    }
}

fn decode_nested(bytes: Vec<u8>, depth: usize) -> Decoded {
    if depth >= MAX_NESTED_DEPTH || !looks_like_plist(&bytes) {
        return Decoded::Opaque(bytes);
    }

    match Value::from_reader(Cursor::new(&bytes)) {
        Ok(inner @ (Value::Dictionary(_) | Value::Array(_))) => normalize_at(inner, depth + 1),
        Ok(_) => Decoded::Opaque(bytes),
        Err(e) => {
            trace!("Embedded property list did not decode: {}", e);
            Decoded::Opaque(bytes)
        }
    }
}

/// Binary (`bplist00`) or XML property-list signature
pub fn looks_like_plist(bytes: &[u8]) -> bool {
    if bytes.starts_with(b"bplist00") {
        return true;
    }
    let text = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let start = text
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(text.len());
    let text = &text[start..];
    text.starts_with(b"<?xml") || text.starts_with(b"<plist")
}

fn as_base64<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: AsRef<[u8]>,
    S: Serializer,
{
    serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
}

/// Outcome of a value sweep, in probe order
#[derive(Debug, Default)]
pub struct ValueSweep {
    pub results: Vec<(ValueProbe, QueryResult)>,
    /// The fault that ended the sweep early, if any
    pub aborted: Option<LockdownError>,
}

impl ValueSweep {
    /// Every probe was asked
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }

    /// Probes that came back with a value
    pub fn answered(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, r)| !r.is_missing() && !r.is_error())
            .count()
    }
}

impl LockdownClient {
    /// Read one value. Either or both of `domain` and `key` may be omitted.
    ///
    /// A device-reported error comes back as `QueryResult::Error` and leaves
    /// the session usable. Transport faults fail the session.
    pub fn get_value(
        &mut self,
        domain: Option<&str>,
        key: Option<&str>,
    ) -> Result<QueryResult, LockdownError> {
        let request = LockdownRequest::GetValue {
            domain: domain.map(str::to_string),
            key: key.map(str::to_string),
        };
        let response = self.exchange(&request)?;
        let result = QueryResult::from_response(response);

        if let QueryResult::Error(error) = &result {
            debug!("GetValue {:?}/{:?}: {}", domain, key, error);
        }
        Ok(result)
    }

    /// Query every probe in order.
    ///
    /// Per-key device errors are recorded and the sweep continues. The first
    /// fault that fails the session ends the sweep; results gathered before
    /// it are kept alongside the fault.
    pub fn sweep_values(&mut self, probes: &[ValueProbe]) -> ValueSweep {
        let mut sweep = ValueSweep {
            results: Vec::with_capacity(probes.len()),
            aborted: None,
        };

        for probe in probes {
            match self.get_value(probe.domain.as_deref(), probe.key.as_deref()) {
                Ok(result) => sweep.results.push((probe.clone(), result)),
                Err(e) => {
                    warn!(
                        "Value sweep aborted after {} of {} probes: {}",
                        sweep.results.len(),
                        probes.len(),
                        e
                    );
                    sweep.aborted = Some(e);
                    break;
                }
            }
        }

        debug!("Value sweep: {}/{} answered", sweep.answered(), probes.len());
        sweep
    }
}
