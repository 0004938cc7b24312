//! Integration Test Harness
#![allow(dead_code)]
//!
//! An in-process fake lockdown daemon. It speaks the framed property-list
//! protocol on a loopback port, upgrades to TLS after StartSession when
//! asked to, verifies the host certificate against a generated pairing
//! root, and launches echo listeners for started services. Every raw byte
//! it receives is tapped so tests can inspect what crossed the wire.

use anyhow::Result;
use lockwire_client::{LockdownClient, LockdownConfig};
use lockwire_crypto::{crypto_provider, PairingRecord};
use lockwire_protocol::{Dictionary, FrameCodec, Value};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, ServerConnection, StreamOwned};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

pub const FAKE_SESSION_ID: &str = "FAKE-SESSION-0001";
pub const DEVICE_TYPE: &str = "com.apple.mobile.lockdown";

/// Pairing credentials plus the device side of the trust relationship
pub struct Identity {
    pub record: Arc<PairingRecord>,
    pub device_tls: Arc<ServerConfig>,
}

impl Identity {
    /// Generate a pairing root, a host certificate (client auth) and a
    /// device certificate, both issued by the root.
    pub fn generate() -> Result<Self> {
        let root_key = KeyPair::generate()?;
        let mut root_params = CertificateParams::new(Vec::<String>::new())?;
        root_params
            .distinguished_name
            .push(DnType::CommonName, "Lockwire Pairing Root");
        root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        root_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let root_cert = root_params.self_signed(&root_key)?;

        let host_key = KeyPair::generate()?;
        let mut host_params = CertificateParams::new(Vec::<String>::new())?;
        host_params
            .distinguished_name
            .push(DnType::CommonName, "Lockwire Host");
        host_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let host_cert = host_params.signed_by(&host_key, &root_cert, &root_key)?;

        let device_key = KeyPair::generate()?;
        let mut device_params = CertificateParams::new(vec!["device.lockwire".to_string()])?;
        device_params
            .distinguished_name
            .push(DnType::CommonName, "Lockwire Device");
        let device_cert = device_params.signed_by(&device_key, &root_cert, &root_key)?;

        let mut roots = RootCertStore::empty();
        roots.add(root_cert.der().clone())?;

        let provider = crypto_provider();
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone()).build()?;

        let device_tls = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(
                vec![device_cert.der().clone()],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(device_key.serialize_der())),
            )?;

        let record = PairingRecord::new(
            "HOST-7F3A",
            "BUID-19C2",
            host_cert.pem().into_bytes(),
            host_key.serialize_pem().into_bytes(),
        )
        .with_escrow_bag(b"escrow-bag-bytes".to_vec());

        Ok(Self {
            record: Arc::new(record),
            device_tls: Arc::new(device_tls),
        })
    }
}

/// How the fake device answers one GetValue
#[derive(Clone, Debug)]
pub enum ValueReply {
    Value(Value),
    Error(String),
    /// Reply carries another request's echo
    WrongEcho,
    /// Length prefix far beyond the frame limit
    Oversized,
    /// Never answer
    Silent,
}

#[derive(Clone, Debug)]
pub enum ServiceBehavior {
    Plain,
    /// Plaintext service whose reply leaves out EnableServiceSSL
    PlainUnflagged,
    Tls,
    Error(String),
    NoPort,
    /// Never answer
    Silent,
}

#[derive(Clone, Debug, Default)]
pub struct DeviceProfile {
    pub session_ssl: bool,
    pub session_error: Option<String>,
    pub query_type_error: bool,
    values: Vec<(Option<String>, Option<String>, ValueReply)>,
    services: Vec<(String, ServiceBehavior)>,
}

impl DeviceProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ssl(mut self) -> Self {
        self.session_ssl = true;
        self
    }

    pub fn with_query_type_error(mut self) -> Self {
        self.query_type_error = true;
        self
    }

    pub fn rejecting_session(mut self, error: &str) -> Self {
        self.session_error = Some(error.to_string());
        self
    }

    pub fn value(mut self, domain: Option<&str>, key: Option<&str>, reply: ValueReply) -> Self {
        self.values.push((
            domain.map(str::to_string),
            key.map(str::to_string),
            reply,
        ));
        self
    }

    pub fn service(mut self, name: &str, behavior: ServiceBehavior) -> Self {
        self.services.push((name.to_string(), behavior));
        self
    }

    fn lookup_value(&self, domain: Option<&str>, key: Option<&str>) -> Option<&ValueReply> {
        self.values
            .iter()
            .find(|(d, k, _)| d.as_deref() == domain && k.as_deref() == key)
            .map(|(_, _, reply)| reply)
    }

    fn lookup_service(&self, name: &str) -> Option<&ServiceBehavior> {
        self.services
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, behavior)| behavior)
    }
}

/// Raw inbound bytes and the offset where TLS began
#[derive(Default)]
pub struct Tap {
    pub inbound: Vec<u8>,
    pub tls_from: Option<usize>,
}

struct TapStream {
    inner: TcpStream,
    tap: Arc<Mutex<Tap>>,
}

impl Read for TapStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.tap.lock().unwrap().inbound.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

impl Write for TapStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

enum DeviceStream {
    Plain(TapStream),
    Tls(Box<StreamOwned<ServerConnection, TapStream>>),
}

impl Read for DeviceStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DeviceStream::Plain(s) => s.read(buf),
            DeviceStream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for DeviceStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            DeviceStream::Plain(s) => s.write(buf),
            DeviceStream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            DeviceStream::Plain(s) => s.flush(),
            DeviceStream::Tls(s) => s.flush(),
        }
    }
}

/// A fake device serving one lockdown connection
pub struct FakeDevice {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Dictionary>>>,
    tap: Arc<Mutex<Tap>>,
    host_authenticated: Arc<AtomicBool>,
}

impl FakeDevice {
    pub fn spawn(profile: DeviceProfile, identity: &Identity) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let device = Self {
            addr,
            requests: Arc::new(Mutex::new(Vec::new())),
            tap: Arc::new(Mutex::new(Tap::default())),
            host_authenticated: Arc::new(AtomicBool::new(false)),
        };

        let ctx = DeviceContext {
            profile,
            tls: identity.device_tls.clone(),
            requests: device.requests.clone(),
            tap: device.tap.clone(),
            host_authenticated: device.host_authenticated.clone(),
        };
        thread::spawn(move || {
            if let Ok((sock, _)) = listener.accept() {
                ctx.serve(sock);
            }
        });

        device
    }

    /// Every request dictionary received, in order
    pub fn requests(&self) -> Vec<Dictionary> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_names(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|r| r.get("Request").and_then(Value::as_string).map(str::to_string))
            .collect()
    }

    /// Raw bytes received after the TLS switch, if one happened
    pub fn raw_after_upgrade(&self) -> Option<Vec<u8>> {
        let tap = self.tap.lock().unwrap();
        tap.tls_from.map(|offset| tap.inbound[offset..].to_vec())
    }

    pub fn raw_inbound(&self) -> Vec<u8> {
        self.tap.lock().unwrap().inbound.clone()
    }

    /// Whether the host presented a certificate the device accepted
    pub fn host_authenticated(&self) -> bool {
        self.host_authenticated.load(Ordering::SeqCst)
    }
}

struct DeviceContext {
    profile: DeviceProfile,
    tls: Arc<ServerConfig>,
    requests: Arc<Mutex<Vec<Dictionary>>>,
    tap: Arc<Mutex<Tap>>,
    host_authenticated: Arc<AtomicBool>,
}

impl DeviceContext {
    fn serve(self, sock: TcpStream) {
        let codec = FrameCodec::default();
        let mut stream = DeviceStream::Plain(TapStream {
            inner: sock,
            tap: self.tap.clone(),
        });

        loop {
            let Ok(request) = codec.decode(&mut stream) else {
                return;
            };
            if let DeviceStream::Tls(tls) = &stream {
                if tls.conn.peer_certificates().is_some() {
                    self.host_authenticated.store(true, Ordering::SeqCst);
                }
            }
            self.requests.lock().unwrap().push(request.clone());

            let name = request
                .get("Request")
                .and_then(Value::as_string)
                .unwrap_or_default()
                .to_string();

            let reply = match name.as_str() {
                "QueryType" => self.query_type(),
                "StartSession" => self.start_session(),
                "StopSession" => reply(&name, vec![]),
                "GetValue" => match self.get_value(&request) {
                    Some(ValueReply::Silent) => continue,
                    Some(ValueReply::Oversized) => {
                        let _ = stream.write_all(&u32::MAX.to_be_bytes());
                        let _ = stream.flush();
                        continue;
                    }
                    Some(ValueReply::WrongEcho) => reply("StartService", vec![]),
                    Some(ValueReply::Value(value)) => reply(&name, vec![("Value", value)]),
                    Some(ValueReply::Error(error)) => reply(&name, vec![("Error", error.into())]),
                    None => reply(&name, vec![("Error", "MissingValue".into())]),
                },
                "StartService" => match self.start_service(&request) {
                    Some(response) => response,
                    None => continue,
                },
                _ => reply(&name, vec![("Error", "InvalidRequest".into())]),
            };

            if codec.write_frame(&mut stream, &reply).is_err() {
                return;
            }

            let upgrade = name == "StartSession"
                && self.profile.session_ssl
                && self.profile.session_error.is_none();
            if upgrade {
                stream = match stream {
                    DeviceStream::Plain(tap_stream) => {
                        {
                            let mut tap = self.tap.lock().unwrap();
                            tap.tls_from = Some(tap.inbound.len());
                        }
                        let conn = ServerConnection::new(self.tls.clone()).unwrap();
                        DeviceStream::Tls(Box::new(StreamOwned::new(conn, tap_stream)))
                    }
                    tls => tls,
                };
            }
        }
    }

    fn query_type(&self) -> Dictionary {
        if self.profile.query_type_error {
            reply("QueryType", vec![("Error", "NotSupported".into())])
        } else {
            reply("QueryType", vec![("Type", DEVICE_TYPE.into())])
        }
    }

    fn start_session(&self) -> Dictionary {
        match &self.profile.session_error {
            Some(error) => reply("StartSession", vec![("Error", error.as_str().into())]),
            None => reply(
                "StartSession",
                vec![
                    ("SessionID", FAKE_SESSION_ID.into()),
                    ("EnableSessionSSL", self.profile.session_ssl.into()),
                ],
            ),
        }
    }

    fn get_value(&self, request: &Dictionary) -> Option<ValueReply> {
        let domain = request.get("Domain").and_then(Value::as_string);
        let key = request.get("Key").and_then(Value::as_string);
        self.profile.lookup_value(domain, key).cloned()
    }

    fn start_service(&self, request: &Dictionary) -> Option<Dictionary> {
        let service = request
            .get("Service")
            .and_then(Value::as_string)
            .unwrap_or_default();

        let response = match self.profile.lookup_service(service) {
            None => reply("StartService", vec![("Error", "InvalidService".into())]),
            Some(ServiceBehavior::Silent) => return None,
            Some(ServiceBehavior::Error(error)) => {
                reply("StartService", vec![("Error", error.as_str().into())])
            }
            Some(ServiceBehavior::NoPort) => reply("StartService", vec![]),
            Some(ServiceBehavior::Plain) => {
                let port = spawn_echo(None);
                reply(
                    "StartService",
                    vec![("Port", u64::from(port).into()), ("EnableServiceSSL", false.into())],
                )
            }
            Some(ServiceBehavior::PlainUnflagged) => {
                let port = spawn_echo(None);
                reply("StartService", vec![("Port", u64::from(port).into())])
            }
            Some(ServiceBehavior::Tls) => {
                let port = spawn_echo(Some(self.tls.clone()));
                reply(
                    "StartService",
                    vec![("Port", u64::from(port).into()), ("EnableServiceSSL", true.into())],
                )
            }
        };
        Some(response)
    }
}

fn reply(request: &str, fields: Vec<(&str, Value)>) -> Dictionary {
    let mut dict = Dictionary::new();
    dict.insert("Request".to_string(), request.into());
    for (key, value) in fields {
        dict.insert(key.to_string(), value);
    }
    dict
}

/// Listen on a fresh port and echo the first connection back to itself
fn spawn_echo(tls: Option<Arc<ServerConfig>>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        let Ok((sock, _)) = listener.accept() else {
            return;
        };
        match tls {
            None => echo(sock),
            Some(config) => {
                let conn = ServerConnection::new(config).unwrap();
                echo(StreamOwned::new(conn, sock));
            }
        }
    });

    port
}

fn echo<S: Read + Write>(mut stream: S) {
    let mut buf = [0u8; 256];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if stream.write_all(&buf[..n]).and_then(|()| stream.flush()).is_err() {
                    return;
                }
            }
        }
    }
}

/// Lockdown settings with short timeouts for tests
pub fn test_config() -> LockdownConfig {
    LockdownConfig {
        connect_timeout_ms: 2_000,
        io_timeout_ms: 2_000,
        ..LockdownConfig::default()
    }
}

/// Connect a client to `device` without running the handshake
pub fn connect(device: &FakeDevice, identity: &Identity, config: LockdownConfig) -> LockdownClient {
    LockdownClient::connect(device.addr, identity.record.clone(), config).unwrap()
}

/// Connect and complete the handshake
pub fn ready_client(device: &FakeDevice, identity: &Identity) -> LockdownClient {
    let mut client = connect(device, identity, test_config());
    client.handshake().unwrap();
    client
}

/// Whether `needle` occurs anywhere in `haystack`
pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        assert!(contains(b"xxGetValuexx", b"GetValue"));
        assert!(!contains(b"GetVal", b"GetValue"));
    }
}
