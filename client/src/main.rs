//! Lockwire
//!
//! Probes a paired device over its lockdown port and prints a JSON report.

use anyhow::{Context, Result};
use clap::Parser;
use lockwire_client::{
    LockdownClient, ProbeConfig, QueryResult, ServiceHandle, ServiceSweep, ValueProbe,
};
use lockwire_crypto::PairingRecord;
use serde::Serialize;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Lockwire - read-only lockdown probe
#[derive(Parser, Debug)]
#[command(name = "lockwire")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "lockwire.toml")]
    config: String,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,

    /// Device address, overrides the configuration file
    #[arg(long)]
    device: Option<IpAddr>,

    /// Pairing record path, overrides the configuration file
    #[arg(long)]
    pairing: Option<PathBuf>,

    /// Write the report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Serialize)]
struct ProbeReport {
    device: SocketAddr,
    device_type: Option<String>,
    tls: bool,
    values: Vec<ValueReport>,
    services: ServiceSweep,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    connections: Vec<ConnectionReport>,
    /// Why the probe stopped early. The report holds everything gathered
    /// before that point.
    #[serde(skip_serializing_if = "Option::is_none")]
    aborted: Option<String>,
}

#[derive(Serialize)]
struct ValueReport {
    #[serde(flatten)]
    probe: ValueProbe,
    result: QueryResult,
}

#[derive(Serialize)]
struct ConnectionReport {
    service: String,
    connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the report
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.verbose { "debug" } else { "info" }));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Lockwire v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ProbeConfig::load(&args.config)?;
    info!("Loaded configuration from {}", args.config);

    if let Some(device) = args.device {
        config.device.address = device;
    }
    if let Some(pairing) = args.pairing {
        config.device.pairing_record = pairing;
    }

    let pairing = PairingRecord::load(&config.device.pairing_record).with_context(|| {
        format!(
            "loading pairing record {}",
            config.device.pairing_record.display()
        )
    })?;

    let report = probe(&config, Arc::new(pairing))?;

    let json = serde_json::to_string_pretty(&report)?;
    match args.output {
        Some(path) => {
            std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
            info!("Report written to {}", path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{json}")?;
        }
    }

    if let Some(reason) = report.aborted {
        anyhow::bail!("probe aborted: {reason}");
    }
    Ok(())
}

fn probe(config: &ProbeConfig, pairing: Arc<PairingRecord>) -> Result<ProbeReport> {
    let addr = SocketAddr::new(config.device.address, config.device.port);

    let mut client = LockdownClient::connect(addr, pairing, config.lockdown.clone())?;
    client.handshake().context("lockdown handshake")?;

    let value_sweep = client.sweep_values(&config.catalog.values);
    let mut aborted = value_sweep.aborted.map(|e| format!("value sweep: {e}"));
    let values = value_sweep
        .results
        .into_iter()
        .map(|(probe, result)| ValueReport { probe, result })
        .collect();

    // A failed session refuses further requests, so skip the service sweep
    let services = if aborted.is_none() {
        client.sweep_services(&config.catalog.services)
    } else {
        ServiceSweep::default()
    };
    if let Some(e) = &services.aborted {
        aborted = Some(format!("service sweep: {e}"));
    }

    let connections = if config.catalog.connect_services {
        services
            .started
            .iter()
            .map(|handle| connect_once(&client, handle))
            .collect()
    } else {
        Vec::new()
    };

    let report = ProbeReport {
        device: addr,
        device_type: client.device_type().map(str::to_string),
        tls: client.is_upgraded(),
        values,
        services,
        connections,
        aborted,
    };

    client.close();
    Ok(report)
}

fn connect_once(client: &LockdownClient, handle: &ServiceHandle) -> ConnectionReport {
    match client.connect_service(handle) {
        Ok(mut session) => {
            session.close();
            ConnectionReport {
                service: handle.name.clone(),
                connected: true,
                error: None,
            }
        }
        Err(e) => {
            warn!("Connecting to {} failed: {}", handle.name, e);
            ConnectionReport {
                service: handle.name.clone(),
                connected: false,
                error: Some(e.to_string()),
            }
        }
    }
}
