//! Verdict types shared by deciders, inspectors and plugins
//!
//! The numeric wire values are part of the plugin schema and must never be
//! reassigned. New verdicts get new numbers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of evaluating a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Verdict {
    /// No evaluator has looked at the connection yet
    #[default]
    Undecided = 0,
    /// The evaluator has no opinion
    Undeterminable = 1,
    /// The evaluator could not render a safe opinion
    Failed = 2,
    /// Allow the connection
    Accept = 3,
    /// Silently drop the connection
    Drop = 4,
    /// Block the connection and notify the peer
    Block = 5,
    /// Redirect DNS traffic to the local nameserver
    RerouteToNameserver = 6,
    /// Redirect traffic into the tunnel
    RerouteToTunnel = 7,
}

impl Verdict {
    /// Every verdict, in wire order
    pub const ALL: [Verdict; 8] = [
        Verdict::Undecided,
        Verdict::Undeterminable,
        Verdict::Failed,
        Verdict::Accept,
        Verdict::Drop,
        Verdict::Block,
        Verdict::RerouteToNameserver,
        Verdict::RerouteToTunnel,
    ];

    /// Stable wire number
    #[inline]
    pub const fn wire_value(self) -> u8 {
        self as u8
    }

    /// Decode a wire number
    pub fn from_wire(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// Whether evaluation stops at this verdict
    #[inline]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Verdict::Undecided | Verdict::Undeterminable)
    }

    /// Whether packets of a connection with this verdict still flow
    #[inline]
    pub const fn passes_traffic(self) -> bool {
        !matches!(self, Verdict::Block | Verdict::Drop)
    }

    /// Short lowercase name for logs
    pub const fn as_str(self) -> &'static str {
        match self {
            Verdict::Undecided => "undecided",
            Verdict::Undeterminable => "undeterminable",
            Verdict::Failed => "failed",
            Verdict::Accept => "accept",
            Verdict::Drop => "drop",
            Verdict::Block => "block",
            Verdict::RerouteToNameserver => "reroute-to-nameserver",
            Verdict::RerouteToTunnel => "reroute-to-tunnel",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Verdict> for u8 {
    fn from(verdict: Verdict) -> Self {
        verdict.wire_value()
    }
}

impl TryFrom<u8> for Verdict {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Verdict::from_wire(value).ok_or_else(|| format!("unknown verdict wire value {}", value))
    }
}

/// A verdict together with the human readable reason for it
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Decision {
    /// Verdict
    pub verdict: Verdict,
    /// Reason, empty when the evaluator abstained
    #[serde(default)]
    pub reason: String,
}

impl Decision {
    /// Create decision
    pub fn new(verdict: Verdict, reason: impl Into<String>) -> Self {
        Self {
            verdict,
            reason: reason.into(),
        }
    }

    /// Abstain with `Undecided`
    pub fn undecided() -> Self {
        Self::default()
    }

    /// Abstain with `Undeterminable`
    pub fn undeterminable() -> Self {
        Self::new(Verdict::Undeterminable, "")
    }

    /// Accept with reason
    pub fn accept(reason: impl Into<String>) -> Self {
        Self::new(Verdict::Accept, reason)
    }

    /// Block with reason
    pub fn block(reason: impl Into<String>) -> Self {
        Self::new(Verdict::Block, reason)
    }

    /// Whether the verdict is terminal
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.verdict.is_terminal()
    }
}
