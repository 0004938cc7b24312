//! Pairing record - host identity and the paired certificate/key bundle
//!
//! A pairing record is produced out of band by a pairing component and is
//! only ever read here. It is normally stored as a property list with the
//! PEM material held in `Data` entries.

use plist::{Dictionary, Value};
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum PairingError {
    #[error("Failed to read pairing record: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed pairing record: {0}")]
    Malformed(String),

    #[error("Pairing record is missing {0}")]
    MissingField(&'static str),
}

/// Credentials proving prior pairing with one device
#[derive(Clone)]
pub struct PairingRecord {
    host_id: String,
    system_buid: String,
    host_certificate: Vec<u8>,
    host_private_key: Zeroizing<Vec<u8>>,
    root_certificate: Option<Vec<u8>>,
    device_certificate: Option<Vec<u8>>,
    wifi_mac_address: Option<String>,
    escrow_bag: Option<Vec<u8>>,
}

impl PairingRecord {
    /// Create a record from its four mandatory parts
    pub fn new(
        host_id: impl Into<String>,
        system_buid: impl Into<String>,
        host_certificate: impl Into<Vec<u8>>,
        host_private_key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            host_id: host_id.into(),
            system_buid: system_buid.into(),
            host_certificate: host_certificate.into(),
            host_private_key: Zeroizing::new(host_private_key.into()),
            root_certificate: None,
            device_certificate: None,
            wifi_mac_address: None,
            escrow_bag: None,
        }
    }

    /// Attach the escrow bag some services require at StartService time
    pub fn with_escrow_bag(mut self, escrow_bag: impl Into<Vec<u8>>) -> Self {
        self.escrow_bag = Some(escrow_bag.into());
        self
    }

    /// Parse a pairing record from property-list bytes (binary or XML)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PairingError> {
        let value = Value::from_reader(Cursor::new(bytes))
            .map_err(|e| PairingError::Malformed(e.to_string()))?;
        let mut dict = value
            .into_dictionary()
            .ok_or_else(|| PairingError::Malformed("top level is not a dictionary".into()))?;

        Self::from_dictionary(&mut dict)
    }

    /// Load a pairing record file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PairingError> {
        let path = path.as_ref();
        let bytes = Zeroizing::new(std::fs::read(path)?);
        let record = Self::from_bytes(&bytes)?;
        debug!("Loaded pairing record from {}", path.display());
        Ok(record)
    }

    fn from_dictionary(dict: &mut Dictionary) -> Result<Self, PairingError> {
        // Moved out first so no copy of the key outlives the parse
        let host_private_key =
            take_private_key(dict).ok_or(PairingError::MissingField("HostPrivateKey"))?;
        let dict = &*dict;

        let host_id = required_string(dict, "HostID")?;
        let system_buid = required_string(dict, "SystemBUID")?;
        let host_certificate =
            pem_field(dict, "HostCertificate").ok_or(PairingError::MissingField("HostCertificate"))?;

        Ok(Self {
            host_id,
            system_buid,
            host_certificate,
            host_private_key,
            root_certificate: pem_field(dict, "RootCertificate"),
            device_certificate: pem_field(dict, "DeviceCertificate"),
            wifi_mac_address: dict
                .get("WiFiMACAddress")
                .and_then(|v| v.as_string())
                .map(str::to_string),
            escrow_bag: dict
                .get("EscrowBag")
                .and_then(|v| v.as_data())
                .map(<[u8]>::to_vec),
        })
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn system_buid(&self) -> &str {
        &self.system_buid
    }

    /// Host certificate (PEM)
    pub fn host_certificate(&self) -> &[u8] {
        &self.host_certificate
    }

    /// Host private key (PEM)
    pub fn host_private_key(&self) -> &[u8] {
        &self.host_private_key
    }

    pub fn root_certificate(&self) -> Option<&[u8]> {
        self.root_certificate.as_deref()
    }

    pub fn device_certificate(&self) -> Option<&[u8]> {
        self.device_certificate.as_deref()
    }

    pub fn wifi_mac_address(&self) -> Option<&str> {
        self.wifi_mac_address.as_deref()
    }

    pub fn escrow_bag(&self) -> Option<&[u8]> {
        self.escrow_bag.as_deref()
    }
}

impl fmt::Debug for PairingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingRecord")
            .field("host_id", &self.host_id)
            .field("system_buid", &self.system_buid)
            .field("host_certificate", &format_args!("{} bytes", self.host_certificate.len()))
            .field("host_private_key", &"<redacted>")
            .field("wifi_mac_address", &self.wifi_mac_address)
            .field("escrow_bag", &self.escrow_bag.is_some())
            .finish()
    }
}

fn required_string(dict: &Dictionary, key: &'static str) -> Result<String, PairingError> {
    dict.get(key)
        .and_then(|v| v.as_string())
        .map(str::to_string)
        .ok_or(PairingError::MissingField(key))
}

/// PEM entries are `Data` in records written by device tooling, but some
/// hand-edited records carry them as strings.
fn pem_field(dict: &Dictionary, key: &str) -> Option<Vec<u8>> {
    match dict.get(key)? {
        Value::Data(data) => Some(data.clone()),
        Value::String(text) => Some(text.as_bytes().to_vec()),
        _ => None,
    }
}

/// Remove the private key entry, taking ownership of its buffer
fn take_private_key(dict: &mut Dictionary) -> Option<Zeroizing<Vec<u8>>> {
    match dict.remove("HostPrivateKey")? {
        Value::Data(data) => Some(Zeroizing::new(data)),
        Value::String(text) => Some(Zeroizing::new(text.into_bytes())),
        _ => None,
    }
}
