//! Connection model
//!
//! A [`Connection`] is created by the capture layer when a new flow shows up,
//! mutated by deciders (verdict) and inspectors (flags) while it is active, and
//! evicted by the capture layer when the flow ends.

use crate::error::{WardenError, WardenResult};
use crate::verdict::{Decision, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// IP protocol numbers used by the core
pub mod ip_protocol {
    /// ICMP
    pub const ICMP: u8 = 1;
    /// TCP
    pub const TCP: u8 = 6;
    /// UDP
    pub const UDP: u8 = 17;
    /// ICMPv6
    pub const ICMPV6: u8 = 58;
}

/// Flow direction relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Initiated by a remote peer
    Inbound,
    /// Initiated by a local process
    Outbound,
}

/// Local side of the flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Address
    pub ip: IpAddr,
    /// Port, 0 for port-less protocols
    pub port: u16,
}

/// Remote side of the flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Address
    pub ip: IpAddr,
    /// Port, 0 for port-less protocols
    pub port: u16,
    /// Domain the address was resolved from, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Process owning the local socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Process ID
    pub pid: u32,
    /// Path of the executable as reported by the OS
    pub binary_path: PathBuf,
    /// Process name
    #[serde(default)]
    pub name: String,
}

/// One network flow under evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Connection ID assigned by the capture layer
    pub id: String,
    /// Direction
    pub direction: Direction,
    /// IP protocol number
    pub protocol: u8,
    /// Local endpoint
    pub local: Endpoint,
    /// Remote entity
    pub entity: Entity,
    /// Owning process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessInfo>,
    /// Traffic is known to be encrypted
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    verdict: Verdict,
    #[serde(default)]
    reason: String,
    /// When the flow was first seen
    pub started: DateTime<Utc>,
    #[serde(skip)]
    save_requested: bool,
}

impl Connection {
    /// Create new outbound connection
    pub fn outbound(id: impl Into<String>, protocol: u8, local: Endpoint, entity: Entity) -> Self {
        Self::new(id, Direction::Outbound, protocol, local, entity)
    }

    /// Create new inbound connection
    pub fn inbound(id: impl Into<String>, protocol: u8, local: Endpoint, entity: Entity) -> Self {
        Self::new(id, Direction::Inbound, protocol, local, entity)
    }

    fn new(
        id: impl Into<String>,
        direction: Direction,
        protocol: u8,
        local: Endpoint,
        entity: Entity,
    ) -> Self {
        Self {
            id: id.into(),
            direction,
            protocol,
            local,
            entity,
            process: None,
            encrypted: false,
            verdict: Verdict::Undecided,
            reason: String::new(),
            started: Utc::now(),
            save_requested: false,
        }
    }

    /// Attach process attribution
    pub fn with_process(mut self, process: ProcessInfo) -> Self {
        self.process = Some(process);
        self
    }

    /// Attach the domain the remote address was resolved from
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.entity.domain = Some(domain.into());
        self
    }

    /// Whether the flow was initiated remotely
    #[inline]
    pub fn is_inbound(&self) -> bool {
        self.direction == Direction::Inbound
    }

    /// Executable path of the owning process
    pub fn binary_path(&self) -> Option<&Path> {
        self.process.as_ref().map(|p| p.binary_path.as_path())
    }

    /// Current verdict
    #[inline]
    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    /// Reason for the current verdict
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Current verdict and reason
    pub fn decision(&self) -> Decision {
        Decision::new(self.verdict, self.reason.clone())
    }

    /// Whether a terminal verdict is set
    #[inline]
    pub fn is_final(&self) -> bool {
        self.verdict.is_terminal()
    }

    /// Set the verdict unless a terminal one is already in place
    pub fn set_verdict(&mut self, verdict: Verdict, reason: impl Into<String>) -> WardenResult<()> {
        if self.is_final() {
            return Err(WardenError::VerdictFinal(self.id.clone()));
        }
        self.verdict = verdict;
        self.reason = reason.into();
        Ok(())
    }

    /// Replace the verdict as part of an explicit re-evaluation
    pub fn reevaluate(&mut self, verdict: Verdict, reason: impl Into<String>) {
        self.verdict = verdict;
        self.reason = reason.into();
    }

    /// Ask the host to persist this connection
    pub fn request_save(&mut self) {
        self.save_requested = true;
    }

    /// Consume a pending save request
    pub fn take_save_request(&mut self) -> bool {
        std::mem::take(&mut self.save_requested)
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.direction {
            Direction::Inbound => "<-",
            Direction::Outbound => "->",
        };
        write!(
            f,
            "{} {}:{} {} {}:{}",
            self.id, self.local.ip, self.local.port, arrow, self.entity.ip, self.entity.port
        )
    }
}
