//! Multiplexed request/response client over a duplex byte stream
//!
//! ```text
//!  call() ──► pending[id] = oneshot ──► outbound mpsc ──► writer task ──► plugin stdin
//!                    ▲
//!                    └──────── reader task ◄── response frames ◄── plugin stdout
//! ```
//!
//! Any number of calls may be in flight at once; a slow reply only holds up
//! its own caller. When the stream closes every pending call fails at once and
//! later calls fail immediately.

use crate::error::{PluginError, Result};
use crate::protocol::{self, Call, Outcome, RawResponse, Reply, Request};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};
use warden_common::CallContext;

/// Frames queued for the writer before callers have to wait
const OUTBOUND_QUEUE: usize = 256;

type ReplySender = oneshot::Sender<Result<Reply>>;

struct Shared {
    name: String,
    next_id: AtomicU64,
    pending: DashMap<u64, ReplySender>,
    outbound: mpsc::Sender<String>,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> PluginError {
        let reason = self
            .close_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "transport closed".to_string());
        PluginError::Closed(reason)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Mark the transport closed and fail every pending call
    fn close(&self, reason: String) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason.clone());
            }
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            error!(plugin = %self.name, %reason, "plugin transport closed");
        }

        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(PluginError::Closed(reason.clone())));
            }
        }
    }

    /// Route one response line to its waiting caller
    ///
    /// A line that is not a response frame at all means the framing can no
    /// longer be trusted; the error is the reason to close the transport.
    fn dispatch(&self, line: &str) -> std::result::Result<(), String> {
        if line.trim().is_empty() {
            return Ok(());
        }

        let raw: RawResponse = serde_json::from_str(line).map_err(|e| {
            warn!(plugin = %self.name, error = %e, "undecodable frame");
            format!("malformed frame: {}", e)
        })?;

        let Some((_, tx)) = self.pending.remove(&raw.id) else {
            debug!(plugin = %self.name, id = raw.id, "reply for unknown or abandoned request");
            return Ok(());
        };

        let result = match protocol::decode_outcome(raw.outcome) {
            Ok(Outcome::Ok(reply)) => Ok(reply),
            Ok(Outcome::Error(err)) => Err(PluginError::Remote {
                code: err.code,
                message: err.message,
            }),
            Err(err) => Err(err),
        };
        let _ = tx.send(result);
        Ok(())
    }

    fn send_cancel(&self, request_id: u64) {
        let frame = Request {
            id: self.next_id(),
            call: Call::Cancel { request_id },
        };
        if let Ok(line) = protocol::encode(&frame) {
            if self.outbound.try_send(line).is_err() {
                debug!(plugin = %self.name, request_id, "cancel notice not queued");
            }
        }
    }
}

/// Removes the pending entry when the call finishes or is dropped
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.id);
    }
}

/// Client side of a plugin transport
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("name", &self.shared.name)
            .field("closed", &self.is_closed())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl RpcClient {
    /// Start reader and writer tasks over the given stream halves
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect<R, W>(name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let shared = Arc::new(Shared {
            name: name.into(),
            next_id: AtomicU64::new(0),
            pending: DashMap::new(),
            outbound: tx,
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
        });

        let weak = Arc::downgrade(&shared);
        tokio::spawn(async move {
            if let Err(e) = write_lines(writer, rx).await {
                if let Some(shared) = weak.upgrade() {
                    shared.close(format!("write failed: {}", e));
                }
            }
        });
        tokio::spawn(read_loop(Arc::downgrade(&shared), reader));

        Self { shared }
    }

    /// Name of the peer, used in logs and errors
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the transport has closed
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Number of calls waiting for a reply
    pub fn in_flight(&self) -> usize {
        self.shared.pending.len()
    }

    /// Perform one call, bounded by `ctx`
    ///
    /// If `ctx` finishes first the call returns `Cancelled` or
    /// `DeadlineExceeded` and a cancel notice is sent to the plugin.
    pub async fn call(&self, ctx: &CallContext, call: Call) -> Result<Reply> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        let shared = &*self.shared;
        if shared.is_closed() {
            return Err(shared.closed_error());
        }

        let id = shared.next_id();
        let method = call.method();
        let line = protocol::encode(&Request { id, call })?;

        let (tx, rx) = oneshot::channel();
        shared.pending.insert(id, tx);
        let _guard = PendingGuard { shared, id };

        // close() may have drained the map before our insert
        if shared.is_closed() {
            return Err(shared.closed_error());
        }

        let queued = tokio::select! {
            biased;
            err = ctx.done() => return Err(err.into()),
            res = shared.outbound.send(line) => res,
        };
        if queued.is_err() {
            return Err(shared.closed_error());
        }
        debug!(plugin = %shared.name, id, method, "request sent");

        tokio::select! {
            biased;
            reply = rx => match reply {
                Ok(result) => result,
                Err(_) => Err(shared.closed_error()),
            },
            err = ctx.done() => {
                debug!(plugin = %shared.name, id, method, %err, "request abandoned");
                shared.send_cancel(id);
                Err(err.into())
            }
        }
    }
}

async fn read_loop<R>(shared: Weak<Shared>, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => match shared.upgrade() {
                Some(shared) => {
                    if let Err(reason) = shared.dispatch(&line) {
                        break reason;
                    }
                }
                None => return,
            },
            Ok(None) => break "plugin closed its output".to_string(),
            Err(e) => break format!("read failed: {}", e),
        }
    };

    if let Some(shared) = shared.upgrade() {
        shared.close(reason);
    }
}

/// Write queued frames, one per line, until every sender is gone
pub(crate) async fn write_lines<W>(mut writer: W, mut rx: mpsc::Receiver<String>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}
