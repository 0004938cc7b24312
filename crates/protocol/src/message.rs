//! Lockdown request vocabulary and response accessors

use crate::validation::{validate_response, ValidationError};
use plist::{Dictionary, Value};

/// Well-known dictionary keys
pub mod keys {
    pub const REQUEST: &str = "Request";
    pub const LABEL: &str = "Label";
    pub const DOMAIN: &str = "Domain";
    pub const KEY: &str = "Key";
    pub const VALUE: &str = "Value";
    pub const ERROR: &str = "Error";
    pub const TYPE: &str = "Type";
    pub const HOST_ID: &str = "HostID";
    pub const SYSTEM_BUID: &str = "SystemBUID";
    pub const SESSION_ID: &str = "SessionID";
    pub const ENABLE_SESSION_SSL: &str = "EnableSessionSSL";
    pub const SERVICE: &str = "Service";
    pub const PORT: &str = "Port";
    pub const ENABLE_SERVICE_SSL: &str = "EnableServiceSSL";
    pub const ESCROW_BAG: &str = "EscrowBag";
}

/// Requests issued on the lockdown connection.
///
/// Only read-only and session-management requests exist here; nothing that
/// mutates device state.
#[derive(Debug, Clone, PartialEq)]
pub enum LockdownRequest {
    QueryType,
    StartSession {
        host_id: String,
        system_buid: String,
    },
    StopSession {
        session_id: String,
    },
    GetValue {
        domain: Option<String>,
        key: Option<String>,
    },
    StartService {
        service: String,
        escrow_bag: Option<Vec<u8>>,
    },
}

impl LockdownRequest {
    /// Value of the `Request` field
    pub fn name(&self) -> &'static str {
        match self {
            LockdownRequest::QueryType => "QueryType",
            LockdownRequest::StartSession { .. } => "StartSession",
            LockdownRequest::StopSession { .. } => "StopSession",
            LockdownRequest::GetValue { .. } => "GetValue",
            LockdownRequest::StartService { .. } => "StartService",
        }
    }

    /// Build the wire dictionary, tagging it with the client `label`
    pub fn to_dictionary(&self, label: &str) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert(keys::REQUEST.to_string(), Value::from(self.name()));
        dict.insert(keys::LABEL.to_string(), Value::from(label));

        match self {
            LockdownRequest::QueryType => {}
            LockdownRequest::StartSession {
                host_id,
                system_buid,
            } => {
                dict.insert(keys::HOST_ID.to_string(), Value::from(host_id.as_str()));
                dict.insert(
                    keys::SYSTEM_BUID.to_string(),
                    Value::from(system_buid.as_str()),
                );
            }
            LockdownRequest::StopSession { session_id } => {
                dict.insert(
                    keys::SESSION_ID.to_string(),
                    Value::from(session_id.as_str()),
                );
            }
            LockdownRequest::GetValue { domain, key } => {
                if let Some(domain) = domain {
                    dict.insert(keys::DOMAIN.to_string(), Value::from(domain.as_str()));
                }
                if let Some(key) = key {
                    dict.insert(keys::KEY.to_string(), Value::from(key.as_str()));
                }
            }
            LockdownRequest::StartService {
                service,
                escrow_bag,
            } => {
                dict.insert(keys::SERVICE.to_string(), Value::from(service.as_str()));
                if let Some(bag) = escrow_bag {
                    dict.insert(keys::ESCROW_BAG.to_string(), Value::Data(bag.clone()));
                }
            }
        }

        dict
    }
}

/// A reply dictionary from the lockdown daemon
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response(Dictionary);

impl From<Dictionary> for Response {
    fn from(dict: Dictionary) -> Self {
        Self(dict)
    }
}

impl Response {
    pub fn as_dictionary(&self) -> &Dictionary {
        &self.0
    }

    pub fn into_dictionary(self) -> Dictionary {
        self.0
    }

    /// Check the `Request` echo against the request that was sent
    pub fn validate_for(&self, request: &LockdownRequest) -> Result<(), ValidationError> {
        validate_response(request.name(), &self.0)
    }

    fn string(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_string())
    }

    fn flag(&self, key: &str) -> bool {
        self.0
            .get(key)
            .and_then(|v| v.as_boolean())
            .unwrap_or(false)
    }

    pub fn request(&self) -> Option<&str> {
        self.string(keys::REQUEST)
    }

    /// Device-reported error string, if any
    pub fn error(&self) -> Option<&str> {
        self.string(keys::ERROR)
    }

    pub fn device_type(&self) -> Option<&str> {
        self.string(keys::TYPE)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.string(keys::SESSION_ID)
    }

    pub fn enable_session_ssl(&self) -> bool {
        self.flag(keys::ENABLE_SESSION_SSL)
    }

    /// Raw `Port` value; range checking is left to the caller
    pub fn port(&self) -> Option<u64> {
        self.0.get(keys::PORT).and_then(|v| v.as_unsigned_integer())
    }

    pub fn enable_service_ssl(&self) -> bool {
        self.flag(keys::ENABLE_SERVICE_SSL)
    }

    pub fn value(&self) -> Option<&Value> {
        self.0.get(keys::VALUE)
    }

    /// Move the `Value` entry out of the response
    pub fn take_value(&mut self) -> Option<Value> {
        self.0.remove(keys::VALUE)
    }
}
