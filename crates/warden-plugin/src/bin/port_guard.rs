//! Warden Port Guard - reference plugin
//!
//! Blocks configured remote ports, logs reported connections and sinkholes
//! configured domains. Settings arrive with the handshake:
//!
//! ```json
//! { "blocked_ports": [23, 445], "sinkhole_domains": ["ads.example.com"] }
//! ```
//!
//! stdout carries the RPC stream, so logs go to stderr.

use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warden_common::{
    record_type, DeciderFn, Decision, DnsResponse, ReporterFn, ResolverFn,
};
use warden_plugin::PluginServer;

const SINKHOLE_TTL: u32 = 60;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GuardSettings {
    blocked_ports: HashSet<u16>,
    sinkhole_domains: Vec<String>,
}

impl GuardSettings {
    fn sinkholes(&self, name: &str) -> bool {
        self.sinkhole_domains.iter().any(|domain| {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            name == domain || name.ends_with(&format!(".{}", domain))
        })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Warden Port Guard v{}", env!("CARGO_PKG_VERSION"));

    let settings = Arc::new(RwLock::new(GuardSettings::default()));

    let configure = {
        let settings = Arc::clone(&settings);
        move |value: &serde_json::Value| {
            if value.is_null() {
                return Ok(());
            }
            let parsed: GuardSettings =
                serde_json::from_value(value.clone()).map_err(|e| format!("bad settings: {}", e))?;
            tracing::info!(
                blocked_ports = parsed.blocked_ports.len(),
                sinkhole_domains = parsed.sinkhole_domains.len(),
                "settings applied"
            );
            *settings.write() = parsed;
            Ok(())
        }
    };

    let decider = {
        let settings = Arc::clone(&settings);
        DeciderFn::new(move |_, conn| {
            let port = conn.entity.port;
            if settings.read().blocked_ports.contains(&port) {
                Ok(Decision::block(format!("port {} is blocked", port)))
            } else {
                Ok(Decision::undecided())
            }
        })
    };

    let reporter = ReporterFn::new(|_, conn| {
        tracing::info!(conn = %conn, verdict = %conn.verdict(), reason = %conn.reason(), "connection reported");
        Ok(())
    });

    let resolver = {
        let settings = Arc::clone(&settings);
        ResolverFn::new(move |_, question, _| {
            let name = question.normalized_name();
            if !settings.read().sinkholes(&name) {
                return Ok(None);
            }
            let ip = match question.qtype {
                record_type::A => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                record_type::AAAA => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                _ => return Ok(Some(DnsResponse::nx_domain())),
            };
            tracing::debug!(%name, "sinkholed");
            Ok(Some(DnsResponse::address(question, ip, SINKHOLE_TTL)))
        })
    };

    let server = PluginServer::new("port-guard")
        .decider(decider)
        .reporter(reporter)
        .resolver(resolver)
        .on_configure(configure);

    if let Err(e) = server.serve_stdio().await {
        tracing::error!(error = %e, "port guard stopped");
        std::process::exit(1);
    }
}
