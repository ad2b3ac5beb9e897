//! IPVS table access via the `ipvsadm` binary.
//!
//! Domain values are translated to `ipvsadm` arguments on the way in and
//! parsed back from the numeric listing (`ipvsadm -L -n`) on the way out.
//! The translation only maps fields; no values are derived or defaulted.

use std::net::SocketAddr;
use std::process::Command;
use tracing::{debug, info};

use super::{IpvsError, IpvsTable, Result};
use crate::types::{Destination, ForwardMode, Protocol, Service, ServiceEntry};

const MODPROBE: &str = "modprobe";
const IPVS_MODULE: &str = "ip_vs";

/// [`IpvsTable`] backed by `ipvsadm`.
#[derive(Debug, Clone)]
pub struct IpvsAdm {
    program: String,
}

impl IpvsAdm {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[String]) -> Result<String> {
        debug!(program = %self.program, args = ?args, "Running ipvsadm");

        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|source| IpvsError::Command {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&self.program, stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for IpvsAdm {
    fn default() -> Self {
        Self::new("ipvsadm")
    }
}

impl IpvsTable for IpvsAdm {
    fn init(&mut self) -> Result<()> {
        // modprobe succeeds when the module is already loaded
        let output = Command::new(MODPROBE)
            .arg(IPVS_MODULE)
            .output()
            .map_err(|e| IpvsError::ModuleLoad(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(IpvsError::ModuleLoad(stderr.trim().to_string()));
        }

        self.run(&list_args(None))?;
        info!(module = IPVS_MODULE, "IPVS facility available");
        Ok(())
    }

    fn add_service(&mut self, service: &Service) -> Result<()> {
        self.run(&add_service_args(service)).map(drop)
    }

    fn delete_service(&mut self, service: &Service) -> Result<()> {
        self.run(&delete_service_args(service)).map(drop)
    }

    fn add_destination(&mut self, service: &Service, destination: &Destination) -> Result<()> {
        self.run(&add_destination_args(service, destination))
            .map(drop)
    }

    fn delete_destination(&mut self, service: &Service, destination: &Destination) -> Result<()> {
        self.run(&delete_destination_args(service, destination))
            .map(drop)
    }

    fn list_services(&mut self) -> Result<Vec<Service>> {
        let stdout = self.run(&list_args(None))?;
        Ok(parse_listing(&stdout)?
            .into_iter()
            .map(|entry| entry.service)
            .collect())
    }

    fn get_service(&mut self, service: &Service) -> Result<ServiceEntry> {
        let stdout = self.run(&list_args(Some(service)))?;
        parse_listing(&stdout)?
            .into_iter()
            .find(|entry| entry.service.endpoint() == service.endpoint())
            .ok_or_else(|| IpvsError::NotFound(service.to_string()))
    }

    fn flush(&mut self) -> Result<()> {
        self.run(&["-C".to_string()]).map(drop)
    }
}

/// Map an `ipvsadm` failure message to an error variant.
fn classify_failure(program: &str, stderr: &str) -> IpvsError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("already exists") {
        IpvsError::AlreadyExists(stderr.to_string())
    } else if lower.contains("no such") {
        IpvsError::NotFound(stderr.to_string())
    } else {
        IpvsError::Failed {
            program: program.to_string(),
            stderr: stderr.to_string(),
        }
    }
}

fn protocol_flag(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Tcp => "--tcp-service",
        Protocol::Udp => "--udp-service",
        Protocol::Sctp => "--sctp-service",
    }
}

fn forward_flag(mode: ForwardMode) -> &'static str {
    match mode {
        ForwardMode::Nat => "--masquerading",
        ForwardMode::Route => "--gatewaying",
        ForwardMode::Tunnel => "--ipip",
        // The kernel selects local delivery on its own
        ForwardMode::Local => "--gatewaying",
    }
}

fn service_target(service: &Service) -> [String; 2] {
    [
        protocol_flag(service.protocol).to_string(),
        service.addr().to_string(),
    ]
}

pub fn add_service_args(service: &Service) -> Vec<String> {
    let mut args = vec!["-A".to_string()];
    args.extend(service_target(service));
    args.extend(["--scheduler".to_string(), service.scheduler.clone()]);
    args
}

pub fn delete_service_args(service: &Service) -> Vec<String> {
    let mut args = vec!["-D".to_string()];
    args.extend(service_target(service));
    args
}

pub fn add_destination_args(service: &Service, destination: &Destination) -> Vec<String> {
    let mut args = vec!["-a".to_string()];
    args.extend(service_target(service));
    args.extend([
        "--real-server".to_string(),
        destination.endpoint().to_string(),
        forward_flag(destination.mode).to_string(),
        "--weight".to_string(),
        destination.weight.to_string(),
    ]);
    args
}

pub fn delete_destination_args(service: &Service, destination: &Destination) -> Vec<String> {
    let mut args = vec!["-d".to_string()];
    args.extend(service_target(service));
    args.extend([
        "--real-server".to_string(),
        destination.endpoint().to_string(),
    ]);
    args
}

fn list_args(service: Option<&Service>) -> Vec<String> {
    let mut args = vec!["-L".to_string(), "-n".to_string()];
    if let Some(service) = service {
        args.extend(service_target(service));
    }
    args
}

/// Parse the numeric listing produced by `ipvsadm -L -n`.
///
/// Example:
/// ```text
/// IP Virtual Server version 1.2.1 (size=4096)
/// Prot LocalAddress:Port Scheduler Flags
///   -> RemoteAddress:Port           Forward Weight ActiveConn InActConn
/// TCP  10.8.0.1:80 rr
///   -> 10.0.0.1:8080                Masq    1      0          0
/// ```
///
/// Firewall-mark services are not managed here and are skipped together with
/// their destinations.
pub fn parse_listing(output: &str) -> Result<Vec<ServiceEntry>> {
    let mut entries: Vec<ServiceEntry> = Vec::new();
    let mut in_fwmark = false;

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty()
            || line.starts_with("IP Virtual Server")
            || line.starts_with("Prot ")
            || line.starts_with("-> RemoteAddress")
        {
            continue;
        }

        if let Some(rest) = line.strip_prefix("->") {
            if in_fwmark {
                continue;
            }
            let entry = entries
                .last_mut()
                .ok_or_else(|| IpvsError::Parse(format!("destination before service: {line}")))?;
            entry.destinations.push(parse_destination(rest)?);
            continue;
        }

        let mut fields = line.split_whitespace();
        let protocol = match fields.next() {
            Some("TCP") => Protocol::Tcp,
            Some("UDP") => Protocol::Udp,
            Some("SCTP") => Protocol::Sctp,
            Some("FWM") => {
                in_fwmark = true;
                continue;
            }
            _ => return Err(IpvsError::Parse(format!("unknown service line: {line}"))),
        };
        in_fwmark = false;

        let addr = parse_addr(fields.next(), line)?;
        let scheduler = fields
            .next()
            .ok_or_else(|| IpvsError::Parse(format!("missing scheduler: {line}")))?;

        entries.push(ServiceEntry::new(
            Service::new(addr.ip(), addr.port(), protocol, scheduler),
            Vec::new(),
        ));
    }

    Ok(entries)
}

fn parse_destination(line: &str) -> Result<Destination> {
    let mut fields = line.split_whitespace();
    let addr = parse_addr(fields.next(), line)?;

    let mode = match fields.next() {
        Some("Masq") => ForwardMode::Nat,
        Some("Route") => ForwardMode::Route,
        Some("Local") => ForwardMode::Local,
        Some("Tunnel") => ForwardMode::Tunnel,
        other => {
            return Err(IpvsError::Parse(format!(
                "unknown forward method {other:?}: {line}"
            )));
        }
    };

    let weight = fields
        .next()
        .and_then(|w| w.parse().ok())
        .ok_or_else(|| IpvsError::Parse(format!("invalid weight: {line}")))?;

    Ok(Destination::new(addr.ip(), addr.port(), weight, mode))
}

fn parse_addr(field: Option<&str>, line: &str) -> Result<SocketAddr> {
    field
        .ok_or_else(|| IpvsError::Parse(format!("missing address: {line}")))?
        .parse()
        .map_err(|e| IpvsError::Parse(format!("{e}: {line}")))
}
