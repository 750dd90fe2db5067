//! Plugin-side framework
//!
//! A plugin binary builds a [`PluginServer`] from its capability
//! implementations and hands it stdin/stdout:
//!
//! ```no_run
//! use warden_common::{Decision, DeciderFn};
//! use warden_plugin::PluginServer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = PluginServer::new("allow-all")
//!         .decider(DeciderFn::new(|_, _| Ok(Decision::accept("allow-all"))));
//!     if let Err(e) = server.serve_stdio().await {
//!         eprintln!("plugin failed: {}", e);
//!     }
//! }
//! ```

use crate::error::Result;
use crate::protocol::{self, codes, Call, Outcome, RemoteError, Reply, Response, SCHEMA_VERSION};
use crate::transport::write_lines;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use warden_common::{
    CallContext, Capability, CapabilitySet, Decider, Reporter, Resolver,
};

type ConfigureFn = dyn Fn(&serde_json::Value) -> std::result::Result<(), String> + Send + Sync;

/// Serves capability implementations over the plugin protocol
#[derive(Clone)]
pub struct PluginServer {
    name: String,
    decider: Option<Arc<dyn Decider>>,
    reporter: Option<Arc<dyn Reporter>>,
    resolver: Option<Arc<dyn Resolver>>,
    configure: Option<Arc<ConfigureFn>>,
}

impl PluginServer {
    /// Create server without capabilities
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            decider: None,
            reporter: None,
            resolver: None,
            configure: None,
        }
    }

    /// Register the decider
    pub fn decider(mut self, decider: impl Decider + 'static) -> Self {
        self.decider = Some(Arc::new(decider));
        self
    }

    /// Register the reporter
    pub fn reporter(mut self, reporter: impl Reporter + 'static) -> Self {
        self.reporter = Some(Arc::new(reporter));
        self
    }

    /// Register the resolver
    pub fn resolver(mut self, resolver: impl Resolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Receive the host's plugin settings at handshake; an error rejects the handshake
    pub fn on_configure<F>(mut self, f: F) -> Self
    where
        F: Fn(&serde_json::Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.configure = Some(Arc::new(f));
        self
    }

    /// Capabilities advertised at handshake
    pub fn capabilities(&self) -> CapabilitySet {
        let mut set = CapabilitySet::empty();
        if self.decider.is_some() {
            set = set.with(Capability::Decider);
        }
        if self.reporter.is_some() {
            set = set.with(Capability::Reporter);
        }
        if self.resolver.is_some() {
            set = set.with(Capability::Resolver);
        }
        set
    }

    /// Serve on the process's stdin/stdout
    pub async fn serve_stdio(self) -> Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve requests until `shutdown` or end of input
    pub async fn serve<R, W>(self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let server = Arc::new(self);
        let (tx, rx) = mpsc::channel::<String>(256);
        let writer_task = tokio::spawn(write_lines(writer, rx));
        let in_flight: Arc<DashMap<u64, CallContext>> = Arc::new(DashMap::new());

        info!(plugin = %server.name, capabilities = %server.capabilities(), "plugin serving");

        let mut handshaken = false;
        let mut lines = BufReader::new(reader).lines();
        let read_result = loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            if line.trim().is_empty() {
                continue;
            }

            let request = match protocol::decode_request(&line) {
                Ok(request) => request,
                Err(e) => {
                    warn!(plugin = %server.name, error = %e, "undecodable request");
                    if let Some(id) = protocol::peek_id(&line) {
                        let resp =
                            Response::error(id, RemoteError::new(codes::INVALID_REQUEST, e.to_string()));
                        send(&tx, &resp).await;
                    }
                    continue;
                }
            };

            let id = request.id;
            match request.call {
                Call::Shutdown => {
                    debug!(plugin = %server.name, "shutdown requested");
                    send(&tx, &Response::ok(id, Reply::Ack)).await;
                    break Ok(());
                }
                Call::Cancel { request_id } => {
                    if let Some((_, ctx)) = in_flight.remove(&request_id) {
                        debug!(plugin = %server.name, request_id, "cancelling request");
                        ctx.cancel();
                    }
                }
                Call::Handshake {
                    schema_version,
                    config,
                } => {
                    let outcome = server.handshake(schema_version, &config);
                    handshaken |= matches!(outcome, Outcome::Ok(_));
                    send(&tx, &Response { id, outcome }).await;
                }
                call if !handshaken => {
                    warn!(plugin = %server.name, id, method = call.method(), "call before handshake");
                    let err = RemoteError::new(
                        codes::INVALID_REQUEST,
                        format!("{} before handshake", call.method()),
                    );
                    send(&tx, &Response::error(id, err)).await;
                }
                call => {
                    let ctx = CallContext::background();
                    in_flight.insert(id, ctx.clone());

                    let server = Arc::clone(&server);
                    let in_flight = Arc::clone(&in_flight);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let result = ctx.run(server.dispatch(&ctx, call)).await;
                        in_flight.remove(&id);
                        match result {
                            Ok(outcome) => send(&tx, &Response { id, outcome }).await,
                            Err(err) => debug!(id, %err, "request aborted"),
                        }
                    });
                }
            }
        };

        for entry in in_flight.iter() {
            entry.value().cancel();
        }
        drop(tx);
        match writer_task.await {
            Ok(Err(e)) => warn!(plugin = %server.name, error = %e, "flushing replies failed"),
            Err(e) => warn!(plugin = %server.name, error = %e, "writer task failed"),
            Ok(Ok(())) => {}
        }
        info!(plugin = %server.name, "plugin stopped");
        read_result.map_err(Into::into)
    }

    fn handshake(&self, schema_version: u32, config: &serde_json::Value) -> Outcome {
        if schema_version != SCHEMA_VERSION {
            return Outcome::Error(RemoteError::new(
                codes::SCHEMA_MISMATCH,
                format!(
                    "host speaks schema {}, plugin speaks {}",
                    schema_version, SCHEMA_VERSION
                ),
            ));
        }
        if let Some(configure) = &self.configure {
            if let Err(message) = configure(config) {
                return Outcome::Error(RemoteError::new(codes::INTERNAL, message));
            }
        }
        Outcome::Ok(Reply::Handshake {
            name: self.name.clone(),
            schema_version: SCHEMA_VERSION,
            capabilities: self.capabilities().to_vec(),
        })
    }

    async fn dispatch(&self, ctx: &CallContext, call: Call) -> Outcome {
        match call {
            Call::Decide { connection } => match &self.decider {
                Some(decider) => match decider.decide(ctx, &connection).await {
                    Ok(decision) => Outcome::Ok(Reply::Decision {
                        verdict: decision.verdict,
                        reason: decision.reason,
                    }),
                    Err(err) => internal(err),
                },
                None => unimplemented(Capability::Decider),
            },
            Call::Report { connection } => match &self.reporter {
                Some(reporter) => match reporter.report(ctx, &connection).await {
                    Ok(()) => Outcome::Ok(Reply::Ack),
                    Err(err) => internal(err),
                },
                None => unimplemented(Capability::Reporter),
            },
            Call::Resolve {
                question,
                connection,
            } => match &self.resolver {
                Some(resolver) => match resolver.resolve(ctx, &question, &connection).await {
                    Ok(response) => Outcome::Ok(Reply::Resolution { response }),
                    Err(err) => internal(err),
                },
                None => unimplemented(Capability::Resolver),
            },
            other => Outcome::Error(RemoteError::new(
                codes::INVALID_REQUEST,
                format!("{} cannot be dispatched", other.method()),
            )),
        }
    }
}

fn internal(err: impl std::fmt::Display) -> Outcome {
    Outcome::Error(RemoteError::new(codes::INTERNAL, err.to_string()))
}

fn unimplemented(capability: Capability) -> Outcome {
    Outcome::Error(RemoteError::new(
        codes::UNIMPLEMENTED,
        format!("{} not implemented", capability),
    ))
}

async fn send(tx: &mpsc::Sender<String>, resp: &Response) {
    match protocol::encode(resp) {
        Ok(line) => {
            if tx.send(line).await.is_err() {
                debug!(id = resp.id, "reply dropped, writer gone");
            }
        }
        Err(e) => warn!(id = resp.id, error = %e, "failed to encode reply"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::PluginHandle;
    use crate::protocol::{Request, Response};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::io::{duplex, split, AsyncWriteExt};
    use warden_common::{
        Connection, Decision, DecisionResult, Endpoint, Entity, PluginConfig, Verdict, WardenError,
    };

    /// Sets the flag when the handler future is dropped
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Hangs on port 9 until aborted, blocks everything else
    struct Tarpit {
        dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Decider for Tarpit {
        async fn decide(&self, _ctx: &CallContext, conn: &Connection) -> DecisionResult {
            if conn.entity.port == 9 {
                let _flag = DropFlag(Arc::clone(&self.dropped));
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(Decision::block("tarpit"))
        }
    }

    fn conn(port: u16) -> Connection {
        Connection::outbound(
            "c",
            17,
            Endpoint {
                ip: "10.0.0.2".parse().unwrap(),
                port: 40000,
            },
            Entity {
                ip: "10.0.0.53".parse().unwrap(),
                port,
                domain: None,
            },
        )
    }

    #[tokio::test]
    async fn test_cancel_aborts_handler_and_plugin_stays_usable() {
        let dropped = Arc::new(AtomicBool::new(false));
        let server = PluginServer::new("tarpit").decider(Tarpit {
            dropped: Arc::clone(&dropped),
        });

        let (host_io, plugin_io) = duplex(64 * 1024);
        let (pr, pw) = split(plugin_io);
        tokio::spawn(server.serve(pr, pw));
        let (hr, hw) = split(host_io);
        let handle = PluginHandle::attach("tarpit", hr, hw, &PluginConfig::new("tarpit", "unused"))
            .await
            .unwrap();

        let ctx = CallContext::background();
        let hung_conn = conn(9);
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.cancel();
        };
        let (result, ()) = tokio::join!(handle.decide(&ctx, &hung_conn), canceller);
        let err = result.unwrap_err();
        assert_eq!(err.source, WardenError::Cancelled);
        assert_eq!(err.verdict, Verdict::Failed);

        tokio::time::timeout(Duration::from_secs(1), async {
            while !dropped.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handler was not aborted");

        let next = tokio::time::timeout(
            Duration::from_secs(1),
            handle.decide(&CallContext::background(), &conn(80)),
        )
        .await
        .expect("later call blocked")
        .unwrap();
        assert_eq!(next, Decision::block("tarpit"));
    }

    async fn exchange<R, W>(lines: &mut tokio::io::Lines<BufReader<R>>, hw: &mut W, request: &Request) -> Response
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        hw.write_all(format!("{}\n", protocol::encode(request).unwrap()).as_bytes())
            .await
            .unwrap();
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap()
    }

    fn handshake(id: u64, schema_version: u32) -> Request {
        Request {
            id,
            call: Call::Handshake {
                schema_version,
                config: serde_json::Value::Null,
            },
        }
    }

    fn is_error(resp: &Response, code: &str) -> bool {
        matches!(&resp.outcome, Outcome::Error(e) if e.code == code)
    }

    #[tokio::test]
    async fn test_calls_before_handshake_are_rejected() {
        let server = PluginServer::new("strict").decider(warden_common::DeciderFn::new(|_, _| {
            Ok(Decision::block("strict"))
        }));
        let (host_io, plugin_io) = duplex(64 * 1024);
        let (pr, pw) = split(plugin_io);
        tokio::spawn(server.serve(pr, pw));
        let (hr, mut hw) = split(host_io);
        let mut lines = BufReader::new(hr).lines();

        let decide = |id| Request {
            id,
            call: Call::Decide { connection: conn(80) },
        };
        let resp = exchange(&mut lines, &mut hw, &decide(1)).await;
        assert_eq!(resp.id, 1);
        assert!(is_error(&resp, codes::INVALID_REQUEST));

        let resp = exchange(&mut lines, &mut hw, &handshake(2, SCHEMA_VERSION + 1)).await;
        assert!(is_error(&resp, codes::SCHEMA_MISMATCH));
        let resp = exchange(&mut lines, &mut hw, &decide(3)).await;
        assert!(is_error(&resp, codes::INVALID_REQUEST));

        let resp = exchange(&mut lines, &mut hw, &handshake(4, SCHEMA_VERSION)).await;
        assert!(matches!(resp.outcome, Outcome::Ok(Reply::Handshake { .. })));
        let resp = exchange(&mut lines, &mut hw, &decide(5)).await;
        assert!(matches!(
            resp.outcome,
            Outcome::Ok(Reply::Decision { verdict: Verdict::Block, .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_capability_and_bad_request_answers() {
        let server =
            PluginServer::new("silent").resolver(warden_common::ResolverFn::new(|_, _, _| Ok(None)));
        let (host_io, plugin_io) = duplex(64 * 1024);
        let (pr, pw) = split(plugin_io);
        let serving = tokio::spawn(server.serve(pr, pw));

        let (hr, mut hw) = split(host_io);
        let mut lines = BufReader::new(hr).lines();

        let resp = exchange(&mut lines, &mut hw, &handshake(1, SCHEMA_VERSION)).await;
        assert!(matches!(resp.outcome, Outcome::Ok(Reply::Handshake { .. })));

        let decide = Request {
            id: 2,
            call: Call::Decide { connection: conn(80) },
        };
        let resp = exchange(&mut lines, &mut hw, &decide).await;
        assert_eq!(resp.id, 2);
        assert!(is_error(&resp, codes::UNIMPLEMENTED));

        hw.write_all(b"{\"id\":3,\"call\":{\"method\":\"explode\"}}\n").await.unwrap();
        let resp: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(resp.id, 3);
        assert!(is_error(&resp, codes::INVALID_REQUEST));

        let shutdown = Request {
            id: 4,
            call: Call::Shutdown,
        };
        let resp = exchange(&mut lines, &mut hw, &shutdown).await;
        assert!(matches!(resp.outcome, Outcome::Ok(Reply::Ack)));
        serving.await.unwrap().unwrap();
    }
}
