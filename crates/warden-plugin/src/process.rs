//! Host-side handle for one plugin process
//!
//! ```text
//!  PluginHandle::launch(config)
//!      │ spawn child (stdin/stdout piped, stderr inherited)
//!      │ handshake: schema check, settings, capabilities
//!      ▼
//!  decide / report / resolve ──► RpcClient ──► child
//!      │
//!      └─ bounded by caller context AND per-plugin call timeout
//! ```
//!
//! The handle is the process's only owner. Dropping it kills the child.

use crate::error::{PluginError, Result};
use crate::protocol::{Call, Reply, SCHEMA_VERSION};
use crate::transport::RpcClient;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use warden_common::{
    AtomicCounter, CallContext, Capability, CapabilitySet, Connection, Decider, Decision,
    DecisionError, DecisionResult, DnsQuestion, DnsResponse, PluginConfig, Reporter, Resolver,
    WardenError, WardenResult,
};

/// Grace period for a plugin to exit after `shutdown`
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Per-plugin call counters
#[derive(Debug, Default)]
struct PluginStats {
    calls: AtomicCounter,
    errors: AtomicCounter,
    cancelled: AtomicCounter,
}

/// Point-in-time view of a plugin's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginStatsSnapshot {
    /// Calls issued
    pub calls: u64,
    /// Calls that failed, cancellations excluded
    pub errors: u64,
    /// Calls abandoned on cancellation or deadline
    pub cancelled: u64,
}

/// A launched (or attached) plugin
pub struct PluginHandle {
    name: String,
    client: RpcClient,
    capabilities: CapabilitySet,
    call_timeout: Duration,
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
    stopped: AtomicBool,
    stats: PluginStats,
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("pid", &self.pid)
            .finish()
    }
}

impl PluginHandle {
    /// Start the plugin executable and complete the handshake
    ///
    /// The child is killed if the handshake fails.
    pub async fn launch(config: &PluginConfig) -> Result<Self> {
        let launch_err = |reason: String| PluginError::Launch {
            name: config.name.clone(),
            reason,
        };

        let mut child = Command::new(&config.path)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| launch_err(format!("{}: {}", config.path.display(), e)))?;

        let stdin = child.stdin.take().ok_or_else(|| launch_err("stdin not captured".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| launch_err("stdout not captured".into()))?;
        let pid = child.id();

        match Self::attach(config.name.clone(), stdout, stdin, config).await {
            Ok(mut handle) => {
                handle.pid = pid;
                *handle.child.get_mut() = Some(child);
                info!(
                    plugin = %handle.name,
                    pid = ?pid,
                    capabilities = %handle.capabilities,
                    "plugin launched"
                );
                Ok(handle)
            }
            Err(err) => {
                warn!(plugin = %config.name, error = %err, "plugin rejected, killing process");
                if let Err(e) = child.kill().await {
                    debug!(plugin = %config.name, error = %e, "kill after failed handshake");
                }
                Err(err)
            }
        }
    }

    /// Handshake over an already established transport
    pub async fn attach<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        config: &PluginConfig,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let name = name.into();
        let client = RpcClient::connect(name.clone(), reader, writer);
        let handshake_err = |reason: String| PluginError::Handshake {
            name: name.clone(),
            reason,
        };

        let ctx = CallContext::with_timeout(config.handshake_timeout());
        let call = Call::Handshake {
            schema_version: SCHEMA_VERSION,
            config: config.settings.clone(),
        };
        let reply = client
            .call(&ctx, call)
            .await
            .map_err(|e| handshake_err(e.to_string()))?;

        let (remote_name, capabilities) = match reply {
            Reply::Handshake {
                name: remote_name,
                schema_version,
                capabilities,
            } => {
                if schema_version != SCHEMA_VERSION {
                    return Err(handshake_err(format!(
                        "plugin speaks schema {}, host speaks {}",
                        schema_version, SCHEMA_VERSION
                    )));
                }
                (remote_name, capabilities.into_iter().collect::<CapabilitySet>())
            }
            other => return Err(handshake_err(format!("unexpected reply {:?}", other))),
        };

        if capabilities.is_empty() {
            return Err(PluginError::NoCapabilities(name));
        }
        debug!(plugin = %name, %remote_name, %capabilities, "handshake complete");

        Ok(Self {
            name,
            client,
            capabilities,
            call_timeout: config.call_timeout(),
            child: Mutex::new(None),
            pid: None,
            stopped: AtomicBool::new(false),
            stats: PluginStats::default(),
        })
    }

    /// Configured plugin name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capabilities advertised at handshake
    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    /// OS process ID, `None` for attached transports
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the transport is up and the child has not exited
    pub fn is_alive(&self) -> bool {
        if self.stopped.load(Ordering::SeqCst) || self.client.is_closed() {
            return false;
        }
        match self.child.lock().as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> PluginStatsSnapshot {
        PluginStatsSnapshot {
            calls: self.stats.calls.get(),
            errors: self.stats.errors.get(),
            cancelled: self.stats.cancelled.get(),
        }
    }

    async fn invoke(&self, ctx: &CallContext, capability: Capability, call: Call) -> Result<Reply> {
        if !self.capabilities.contains(capability) {
            return Err(PluginError::Unimplemented {
                plugin: self.name.clone(),
                capability,
            });
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(PluginError::Closed(format!("plugin {} was shut down", self.name)));
        }

        self.stats.calls.inc();
        let ctx = ctx.child_with_timeout(self.call_timeout);
        let result = self.client.call(&ctx, call).await;
        match &result {
            Err(PluginError::Cancelled | PluginError::DeadlineExceeded) => {
                self.stats.cancelled.inc();
            }
            Err(err) => {
                self.stats.errors.inc();
                debug!(plugin = %self.name, %capability, error = %err, "plugin call failed");
            }
            Ok(_) => {}
        }
        result
    }

    fn unexpected(&self, reply: Reply) -> WardenError {
        WardenError::Protocol(format!("{}: unexpected reply {:?}", self.name, reply))
    }

    /// Stop the plugin: request shutdown, wait briefly, then kill
    ///
    /// Returns an error if the child could not be reaped or had to be
    /// killed. Stopping an already stopped handle is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.client.is_closed() {
            let ctx = CallContext::with_timeout(SHUTDOWN_GRACE);
            if let Err(e) = self.client.call(&ctx, Call::Shutdown).await {
                debug!(plugin = %self.name, error = %e, "shutdown request failed");
            }
        }

        let child = self.child.lock().take();
        match child {
            Some(mut child) => reap(&self.name, &mut child, SHUTDOWN_GRACE).await,
            None => {
                info!(plugin = %self.name, "plugin stopped");
                Ok(())
            }
        }
    }

    /// Share the handle as a decider, if the capability is advertised
    pub fn as_decider(self: &Arc<Self>) -> Option<Arc<dyn Decider>> {
        self.capabilities
            .contains(Capability::Decider)
            .then(|| Arc::clone(self) as Arc<dyn Decider>)
    }

    /// Share the handle as a reporter, if the capability is advertised
    pub fn as_reporter(self: &Arc<Self>) -> Option<Arc<dyn Reporter>> {
        self.capabilities
            .contains(Capability::Reporter)
            .then(|| Arc::clone(self) as Arc<dyn Reporter>)
    }

    /// Share the handle as a resolver, if the capability is advertised
    pub fn as_resolver(self: &Arc<Self>) -> Option<Arc<dyn Resolver>> {
        self.capabilities
            .contains(Capability::Resolver)
            .then(|| Arc::clone(self) as Arc<dyn Resolver>)
    }
}

/// Wait for the child to exit, killing it once `grace` runs out
async fn reap(name: &str, child: &mut Child, grace: Duration) -> Result<()> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(plugin = %name, %status, "plugin exited");
            Ok(())
        }
        Ok(Err(e)) => {
            warn!(plugin = %name, error = %e, "waiting for plugin failed");
            Err(PluginError::Io(format!("waiting for plugin {}: {}", name, e)))
        }
        Err(_) => {
            warn!(plugin = %name, "plugin ignored shutdown, killing");
            child
                .kill()
                .await
                .map_err(|e| PluginError::Io(format!("killing plugin {}: {}", name, e)))?;
            Err(PluginError::Unresponsive(name.to_string()))
        }
    }
}

#[async_trait]
impl Decider for PluginHandle {
    async fn decide(&self, ctx: &CallContext, conn: &Connection) -> DecisionResult {
        let call = Call::Decide {
            connection: conn.clone(),
        };
        let reply = self
            .invoke(ctx, Capability::Decider, call)
            .await
            .map_err(|e| DecisionError::from(e.into_warden(&self.name)))?;
        match reply {
            Reply::Decision { verdict, reason } => Ok(Decision::new(verdict, reason)),
            other => Err(self.unexpected(other).into()),
        }
    }
}

#[async_trait]
impl Reporter for PluginHandle {
    async fn report(&self, ctx: &CallContext, conn: &Connection) -> WardenResult<()> {
        let call = Call::Report {
            connection: conn.clone(),
        };
        match self
            .invoke(ctx, Capability::Reporter, call)
            .await
            .map_err(|e| e.into_warden(&self.name))?
        {
            Reply::Ack => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }
}

#[async_trait]
impl Resolver for PluginHandle {
    async fn resolve(
        &self,
        ctx: &CallContext,
        question: &DnsQuestion,
        conn: &Connection,
    ) -> WardenResult<Option<DnsResponse>> {
        let call = Call::Resolve {
            question: question.clone(),
            connection: conn.clone(),
        };
        match self
            .invoke(ctx, Capability::Resolver, call)
            .await
            .map_err(|e| e.into_warden(&self.name))?
        {
            Reply::Resolution { response } => Ok(response),
            other => Err(self.unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::PluginServer;
    use tokio::io::{duplex, split};
    use warden_common::{DeciderFn, Endpoint, Entity, ResolverFn, Verdict};

    fn conn(port: u16) -> Connection {
        Connection::outbound(
            "c1",
            6,
            Endpoint {
                ip: "10.0.0.2".parse().unwrap(),
                port: 50000,
            },
            Entity {
                ip: "93.184.216.34".parse().unwrap(),
                port,
                domain: None,
            },
        )
    }

    async fn attach_server(server: PluginServer, config: &PluginConfig) -> Result<PluginHandle> {
        let (host_io, plugin_io) = duplex(64 * 1024);
        let (pr, pw) = split(plugin_io);
        tokio::spawn(server.serve(pr, pw));
        let (hr, hw) = split(host_io);
        PluginHandle::attach(config.name.clone(), hr, hw, config).await
    }

    #[tokio::test]
    async fn test_decide_over_bridge() {
        let server = PluginServer::new("ports").decider(DeciderFn::new(|_, conn| {
            if conn.entity.port == 23 {
                Ok(Decision::block("telnet"))
            } else {
                Ok(Decision::undecided())
            }
        }));
        let handle = attach_server(server, &PluginConfig::new("ports", "unused"))
            .await
            .unwrap();
        assert_eq!(
            handle.capabilities(),
            CapabilitySet::empty().with(Capability::Decider)
        );

        let ctx = CallContext::background();
        let blocked = handle.decide(&ctx, &conn(23)).await.unwrap();
        assert_eq!(blocked, Decision::block("telnet"));
        let open = handle.decide(&ctx, &conn(80)).await.unwrap();
        assert_eq!(open.verdict, Verdict::Undecided);
        assert_eq!(handle.stats().calls, 2);
    }

    #[tokio::test]
    async fn test_unadvertised_capability_fails_locally() {
        let server = PluginServer::new("dns").resolver(ResolverFn::new(|_, _, _| Ok(None)));
        let handle = attach_server(server, &PluginConfig::new("dns", "unused"))
            .await
            .unwrap();

        let err = handle
            .decide(&CallContext::background(), &conn(80))
            .await
            .unwrap_err();
        assert_eq!(err.source, WardenError::Unimplemented("decider".into()));
        assert_eq!(err.verdict, Verdict::Undeterminable);
        assert_eq!(handle.stats().calls, 0);
        assert!(Arc::new(handle).as_decider().is_none());
    }

    #[tokio::test]
    async fn test_zero_capabilities_rejected() {
        let err = attach_server(PluginServer::new("empty"), &PluginConfig::new("empty", "unused"))
            .await
            .unwrap_err();
        assert_eq!(err, PluginError::NoCapabilities("empty".into()));
    }

    #[tokio::test]
    async fn test_configure_error_rejects_handshake() {
        let server = PluginServer::new("picky")
            .decider(DeciderFn::new(|_, _| Ok(Decision::undecided())))
            .on_configure(|settings| {
                if settings.get("required").is_some() {
                    Ok(())
                } else {
                    Err("missing required".to_string())
                }
            });
        let err = attach_server(server, &PluginConfig::new("picky", "unused"))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Handshake { .. }));
    }

    #[tokio::test]
    async fn test_plugin_error_keeps_connection_undeterminable() {
        let server = PluginServer::new("broken").decider(DeciderFn::new(|_, _| {
            Err(WardenError::Io("database unavailable".into()).into())
        }));
        let handle = attach_server(server, &PluginConfig::new("broken", "unused"))
            .await
            .unwrap();

        let err = handle
            .decide(&CallContext::background(), &conn(80))
            .await
            .unwrap_err();
        assert_eq!(err.verdict, Verdict::Undeterminable);
        assert!(matches!(err.source, WardenError::Remote { .. }));
        assert_eq!(handle.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_calls_and_is_idempotent() {
        let server = PluginServer::new("ports").decider(DeciderFn::new(|_, _| Ok(Decision::undecided())));
        let handle = attach_server(server, &PluginConfig::new("ports", "unused"))
            .await
            .unwrap();
        assert!(handle.is_alive());

        handle.shutdown().await.unwrap();
        handle.shutdown().await.unwrap();
        assert!(!handle.is_alive());
        let err = handle
            .decide(&CallContext::background(), &conn(80))
            .await
            .unwrap_err();
        assert!(matches!(err.source, WardenError::Transport(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reap_kills_child_that_ignores_shutdown() {
        let mut child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let err = reap("sleeper", &mut child, Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err, PluginError::Unresponsive("sleeper".into()));
        assert!(child.try_wait().unwrap().is_some());

        let mut quick = Command::new("true").spawn().unwrap();
        reap("quick", &mut quick, Duration::from_secs(5)).await.unwrap();
    }
}
