//! DNS question and response types for the resolver capability

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Common record types
pub mod record_type {
    /// IPv4 address
    pub const A: u16 = 1;
    /// Canonical name
    pub const CNAME: u16 = 5;
    /// Text
    pub const TXT: u16 = 16;
    /// IPv6 address
    pub const AAAA: u16 = 28;
}

/// Internet class
pub const CLASS_IN: u16 = 1;

/// A DNS question asked by a local process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsQuestion {
    /// Fully qualified name
    pub name: String,
    /// Record type
    pub qtype: u16,
    /// Record class
    #[serde(default = "default_class")]
    pub class: u16,
}

fn default_class() -> u16 {
    CLASS_IN
}

impl DnsQuestion {
    /// Create IN-class question
    pub fn new(name: impl Into<String>, qtype: u16) -> Self {
        Self {
            name: name.into(),
            qtype,
            class: CLASS_IN,
        }
    }

    /// Name without the trailing root dot, lowercased
    pub fn normalized_name(&self) -> String {
        self.name.trim_end_matches('.').to_ascii_lowercase()
    }
}

/// Response code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseCode {
    /// No error
    #[default]
    NoError,
    /// Server failure
    ServFail,
    /// Name does not exist
    NxDomain,
    /// Query refused
    Refused,
}

/// A resource record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    /// Owner name
    pub name: String,
    /// Record type
    pub rtype: u16,
    /// Time to live in seconds
    pub ttl: u32,
    /// Presentation format data
    pub data: String,
}

/// Answer provided by a resolver
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DnsResponse {
    /// Response code
    pub rcode: ResponseCode,
    /// Answer records
    #[serde(default)]
    pub records: Vec<DnsRecord>,
}

impl DnsResponse {
    /// Answer a question with a single address record
    pub fn address(question: &DnsQuestion, ip: IpAddr, ttl: u32) -> Self {
        let rtype = match ip {
            IpAddr::V4(_) => record_type::A,
            IpAddr::V6(_) => record_type::AAAA,
        };
        Self {
            rcode: ResponseCode::NoError,
            records: vec![DnsRecord {
                name: question.name.clone(),
                rtype,
                ttl,
                data: ip.to_string(),
            }],
        }
    }

    /// NXDOMAIN without records
    pub fn nx_domain() -> Self {
        Self {
            rcode: ResponseCode::NxDomain,
            records: Vec::new(),
        }
    }

    /// Smallest TTL of all records
    pub fn min_ttl(&self) -> Option<u32> {
        self.records.iter().map(|r| r.ttl).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_address_answer() {
        let q = DnsQuestion::new("Ads.Example.", record_type::A);
        assert_eq!(q.normalized_name(), "ads.example");

        let resp = DnsResponse::address(&q, IpAddr::V4(Ipv4Addr::UNSPECIFIED), 60);
        assert_eq!(resp.records[0].rtype, record_type::A);
        assert_eq!(resp.records[0].data, "0.0.0.0");
        assert_eq!(resp.min_ttl(), Some(60));
        assert_eq!(DnsResponse::nx_domain().min_ttl(), None);
    }
}
