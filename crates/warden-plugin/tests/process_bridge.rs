//! Launches the port guard binary as a real child process

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use warden_common::{
    record_type, CallContext, Capability, Connection, Decider, DnsQuestion, Endpoint, Entity,
    PluginConfig, Reporter, Resolver, Verdict, WardenError,
};
use warden_plugin::{PluginError, PluginHandle};

fn port_guard() -> PluginConfig {
    PluginConfig::new("port-guard", env!("CARGO_BIN_EXE_warden-port-guard")).with_settings(json!({
        "blocked_ports": [23],
        "sinkhole_domains": ["ads.example.com"],
    }))
}

fn conn(port: u16) -> Connection {
    Connection::outbound(
        "it-1",
        6,
        Endpoint {
            ip: "192.168.1.10".parse().unwrap(),
            port: 51000,
        },
        Entity {
            ip: "203.0.113.7".parse().unwrap(),
            port,
            domain: None,
        },
    )
}

#[tokio::test]
async fn test_port_guard_round_trip() {
    let handle = Arc::new(PluginHandle::launch(&port_guard()).await.unwrap());
    assert!(handle.pid().is_some());
    assert!(handle.is_alive());
    for capability in [Capability::Decider, Capability::Reporter, Capability::Resolver] {
        assert!(handle.capabilities().contains(capability));
    }

    let ctx = CallContext::background();
    let blocked = handle.decide(&ctx, &conn(23)).await.unwrap();
    assert_eq!(blocked.verdict, Verdict::Block);
    assert_eq!(blocked.reason, "port 23 is blocked");

    let open = handle.decide(&ctx, &conn(443)).await.unwrap();
    assert_eq!(open.verdict, Verdict::Undecided);

    handle.report(&ctx, &conn(443)).await.unwrap();

    let sinkholed = handle
        .resolve(&ctx, &DnsQuestion::new("tracker.ads.example.com.", record_type::A), &conn(53))
        .await
        .unwrap()
        .expect("domain should be sinkholed");
    assert_eq!(sinkholed.records[0].data, "0.0.0.0");

    let passthrough = handle
        .resolve(&ctx, &DnsQuestion::new("example.org", record_type::A), &conn(53))
        .await
        .unwrap();
    assert!(passthrough.is_none());

    let decider = handle.as_decider().expect("decider advertised");
    assert_eq!(
        decider.decide(&ctx, &conn(23)).await.unwrap().verdict,
        Verdict::Block
    );

    handle.shutdown().await.unwrap();
    assert!(!handle.is_alive());

    let after = handle.decide(&ctx, &conn(23)).await.unwrap_err();
    assert_eq!(after.verdict, Verdict::Undeterminable);
}

#[cfg(unix)]
#[tokio::test]
async fn test_killed_plugin_is_detected() {
    let handle = PluginHandle::launch(&port_guard()).await.unwrap();
    let pid = handle.pid().expect("launched plugin has a pid");

    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    for _ in 0..100 {
        if !handle.is_alive() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!handle.is_alive());

    let err = handle
        .decide(&CallContext::background(), &conn(23))
        .await
        .unwrap_err();
    assert_eq!(err.verdict, Verdict::Undeterminable);
    assert_eq!(err.reason, "");
    assert!(matches!(err.source, WardenError::Transport(_)));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bad_settings_fail_launch() {
    let config = port_guard().with_settings(json!({ "blocked_ports": "all of them" }));
    let err = PluginHandle::launch(&config).await.unwrap_err();
    assert!(matches!(err, PluginError::Handshake { .. }));
}

#[tokio::test]
async fn test_missing_binary_fails_launch() {
    let config = PluginConfig::new("ghost", "/nonexistent/warden-plugin");
    let err = PluginHandle::launch(&config).await.unwrap_err();
    assert!(matches!(err, PluginError::Launch { .. }));
}
