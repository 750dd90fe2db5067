//! Per-connection inspection
//!
//! ```text
//!  first packet ─► factories (ascending order) ─► active inspectors
//!
//!  every packet ─► [verdict passes traffic?] ─► inspector[0] ─► inspector[1] ─► ...
//!                                                   │
//!                                     save request? └─► ConnectionSaver
//! ```
//!
//! A session belongs to one connection and is driven sequentially. Dropping
//! it destroys whatever inspectors are still active.

use crate::registry::{Inspector, Registration};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use warden_common::{AtomicCounter, Connection, Decision, OverridePolicy, Packet, Verdict};

/// Persists connections whose inspection state changed
pub trait ConnectionSaver: Send + Sync {
    /// Persist the connection
    fn save(&self, conn: &Connection);
}

impl<F> ConnectionSaver for F
where
    F: Fn(&Connection) + Send + Sync,
{
    fn save(&self, conn: &Connection) {
        self(conn)
    }
}

#[derive(Debug, Default)]
pub(crate) struct PipelineCounters {
    pub(crate) sessions: AtomicCounter,
    packets: AtomicCounter,
    skipped: AtomicCounter,
    invocations: AtomicCounter,
    overrides: AtomicCounter,
    saves: AtomicCounter,
    inspector_errors: AtomicCounter,
    destroy_errors: AtomicCounter,
}

impl PipelineCounters {
    pub(crate) fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            sessions: self.sessions.get(),
            packets: self.packets.get(),
            skipped: self.skipped.get(),
            invocations: self.invocations.get(),
            overrides: self.overrides.get(),
            saves: self.saves.get(),
            inspector_errors: self.inspector_errors.get(),
            destroy_errors: self.destroy_errors.get(),
        }
    }
}

/// Inspection statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Sessions started
    pub sessions: u64,
    /// Packets handed to the pipeline
    pub packets: u64,
    /// Packets not inspected because the connection is blocked or dropped
    pub skipped: u64,
    /// Individual inspector calls
    pub invocations: u64,
    /// Connection verdicts set by inspectors
    pub overrides: u64,
    /// Save requests forwarded
    pub saves: u64,
    /// Inspectors removed after a packet error
    pub inspector_errors: u64,
    /// Failed teardowns
    pub destroy_errors: u64,
}

struct ActiveInspector {
    name: String,
    inner: Box<dyn Inspector>,
}

/// Inspection state of one connection
pub struct InspectionSession {
    registrations: Arc<Vec<Registration>>,
    policy: OverridePolicy,
    saver: Option<Arc<dyn ConnectionSaver>>,
    counters: Arc<PipelineCounters>,
    active: Option<Vec<ActiveInspector>>,
}

impl std::fmt::Debug for InspectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InspectionSession")
            .field("policy", &self.policy)
            .field("active", &self.active_names())
            .finish()
    }
}

impl InspectionSession {
    pub(crate) fn new(
        registrations: Arc<Vec<Registration>>,
        policy: OverridePolicy,
        saver: Option<Arc<dyn ConnectionSaver>>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            registrations,
            policy,
            saver,
            counters,
            active: None,
        }
    }

    /// Names of the inspectors still attached, in execution order
    pub fn active_names(&self) -> Vec<&str> {
        self.active
            .iter()
            .flatten()
            .map(|a| a.name.as_str())
            .collect()
    }

    /// Run the inspectors over one packet
    ///
    /// Returns `Undeterminable` unless an inspector's verdict was applied to
    /// the connection under [`OverridePolicy::AllowOverride`].
    pub fn handle_packet(&mut self, conn: &mut Connection, packet: &Packet) -> Decision {
        self.counters.packets.inc();
        if !conn.verdict().passes_traffic() {
            self.counters.skipped.inc();
            return Decision::undeterminable();
        }

        if self.active.is_none() {
            self.active = Some(self.instantiate(conn, packet));
        }
        let Some(active) = self.active.as_mut() else {
            return Decision::undeterminable();
        };

        let mut applied = None;
        let mut i = 0;
        while i < active.len() {
            self.counters.invocations.inc();
            let inspector = &mut active[i];
            match inspector.inner.handle_packet(conn, packet) {
                Ok(decision) => {
                    if decision.verdict == Verdict::Failed {
                        warn!(conn = %conn, inspector = %inspector.name, reason = %decision.reason, "inspector reported failure");
                    } else if decision.is_terminal()
                        && apply(self.policy, conn, &inspector.name, &decision)
                    {
                        self.counters.overrides.inc();
                        applied = Some(decision);
                    }
                    i += 1;
                }
                Err(e) => {
                    self.counters.inspector_errors.inc();
                    warn!(conn = %conn, inspector = %inspector.name, error = %e, "inspector failed, removing");
                    let mut removed = active.remove(i);
                    destroy(&self.counters, &mut removed);
                }
            }

            if conn.take_save_request() {
                self.counters.saves.inc();
                match &self.saver {
                    Some(saver) => saver.save(conn),
                    None => debug!(conn = %conn, "save requested without a saver"),
                }
            }

            if !conn.verdict().passes_traffic() {
                break;
            }
        }

        applied.unwrap_or_else(Decision::undeterminable)
    }

    fn instantiate(&self, conn: &Connection, packet: &Packet) -> Vec<ActiveInspector> {
        let mut active = Vec::with_capacity(self.registrations.len());
        for registration in self.registrations.iter() {
            match (registration.factory)(conn, packet) {
                Ok(Some(inner)) => active.push(ActiveInspector {
                    name: registration.name.clone(),
                    inner,
                }),
                Ok(None) => {
                    debug!(conn = %conn, inspector = %registration.name, "inspector declined connection")
                }
                Err(e) => {
                    warn!(conn = %conn, inspector = %registration.name, error = %e, "inspector factory failed")
                }
            }
        }
        active
    }

    /// End inspection and destroy all inspectors
    ///
    /// Safe to call more than once. Called on drop.
    pub fn finish(&mut self) {
        // an empty list keeps a finished session from instantiating again
        let active = self.active.replace(Vec::new()).unwrap_or_default();
        for mut inspector in active {
            destroy(&self.counters, &mut inspector);
        }
    }
}

impl Drop for InspectionSession {
    fn drop(&mut self) {
        self.finish();
    }
}

fn apply(policy: OverridePolicy, conn: &mut Connection, inspector: &str, decision: &Decision) -> bool {
    match policy {
        OverridePolicy::Advisory => {
            debug!(conn = %conn, %inspector, verdict = %decision.verdict, "advisory inspector verdict");
            false
        }
        OverridePolicy::AllowOverride => match conn.set_verdict(decision.verdict, decision.reason.clone()) {
            Ok(()) => {
                debug!(conn = %conn, %inspector, verdict = %decision.verdict, "inspector set verdict");
                true
            }
            Err(_) => {
                debug!(conn = %conn, %inspector, verdict = %decision.verdict, "verdict already final, ignored");
                false
            }
        },
    }
}

fn destroy(counters: &PipelineCounters, inspector: &mut ActiveInspector) {
    if let Err(e) = inspector.inner.destroy() {
        counters.destroy_errors.inc();
        warn!(inspector = %inspector.name, error = %e, "inspector destroy failed");
    }
}
