//! Host decision engine
//!
//! Wires local evaluators and plugin handles into one place:
//!
//! ```text
//!                 ┌──────────────────────── DecisionEngine ───────────────────────┐
//!  Connection ───►│ [self-traffic] ─► decider chain ─► failure policy ─► verdict  │
//!                 │ reporters  (all, errors logged)                               │
//!  DnsQuestion ──►│ resolvers  (first answer wins)                                │
//!                 └───────────────────────────────────────────────────────────────┘
//! ```

use crate::chain::{chain, DeciderChain};
use crate::self_traffic::allow_self_traffic;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use warden_common::{
    AtomicCounter, CallContext, Connection, Decider, Decision, DecisionConfig, DecisionError,
    DnsQuestion, DnsResponse, FailurePolicy, PluginConfig, Reporter, Resolver, Verdict,
    WardenConfig, WardenResult,
};
use warden_plugin::{PluginHandle, PluginStatsSnapshot};

/// Collects evaluators before the engine is built
pub struct EngineBuilder {
    config: DecisionConfig,
    self_filter: Option<Arc<dyn Decider>>,
    deciders: Vec<Arc<dyn Decider>>,
    reporters: Vec<Arc<dyn Reporter>>,
    resolvers: Vec<Arc<dyn Resolver>>,
    plugins: Vec<Arc<PluginHandle>>,
}

impl EngineBuilder {
    /// Create builder
    pub fn new(config: DecisionConfig) -> Self {
        Self {
            config,
            self_filter: None,
            deciders: Vec::new(),
            reporters: Vec::new(),
            resolvers: Vec::new(),
            plugins: Vec::new(),
        }
    }

    /// Append a decider to the chain
    pub fn decider(self, decider: impl Decider + 'static) -> Self {
        self.shared_decider(Arc::new(decider))
    }

    /// Append a shared decider to the chain
    pub fn shared_decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.deciders.push(decider);
        self
    }

    /// Add a reporter
    pub fn reporter(self, reporter: impl Reporter + 'static) -> Self {
        self.shared_reporter(Arc::new(reporter))
    }

    /// Add a shared reporter
    pub fn shared_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    /// Add a resolver
    pub fn resolver(self, resolver: impl Resolver + 'static) -> Self {
        self.shared_resolver(Arc::new(resolver))
    }

    /// Add a shared resolver
    pub fn shared_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// Replace the process-wide self-traffic filter
    pub fn self_traffic_filter(mut self, filter: impl Decider + 'static) -> Self {
        self.self_filter = Some(Arc::new(filter));
        self
    }

    /// Register a plugin under every capability it advertised
    pub fn plugin(mut self, handle: Arc<PluginHandle>) -> Self {
        if let Some(decider) = handle.as_decider() {
            self.deciders.push(decider);
        }
        if let Some(reporter) = handle.as_reporter() {
            self.reporters.push(reporter);
        }
        if let Some(resolver) = handle.as_resolver() {
            self.resolvers.push(resolver);
        }
        self.plugins.push(handle);
        self
    }

    /// Launch and register plugins in configuration order
    ///
    /// If any plugin fails to start, the ones already started are shut down
    /// and the error is returned.
    pub async fn launch_plugins<'a, I>(mut self, configs: I) -> WardenResult<Self>
    where
        I: IntoIterator<Item = &'a PluginConfig>,
    {
        for config in configs {
            match PluginHandle::launch(config).await {
                Ok(handle) => self = self.plugin(Arc::new(handle)),
                Err(e) => {
                    warn!(plugin = %config.name, error = %e, "plugin launch failed");
                    for started in &self.plugins {
                        if let Err(e) = started.shutdown().await {
                            warn!(plugin = %started.name(), error = %e, "cleanup shutdown failed");
                        }
                    }
                    return Err(e.into_warden(&config.name));
                }
            }
        }
        Ok(self)
    }

    /// Build the engine
    pub fn build(self) -> DecisionEngine {
        let mut deciders = Vec::with_capacity(self.deciders.len() + 1);
        if self.config.allow_self_traffic {
            let filter = self
                .self_filter
                .unwrap_or_else(|| Arc::new(allow_self_traffic()) as Arc<dyn Decider>);
            deciders.push(filter);
        }
        deciders.extend(self.deciders);

        info!(
            deciders = deciders.len(),
            reporters = self.reporters.len(),
            resolvers = self.resolvers.len(),
            plugins = self.plugins.len(),
            failure_policy = ?self.config.failure_policy,
            "decision engine ready"
        );

        DecisionEngine {
            config: self.config,
            chain: chain(deciders),
            reporters: self.reporters,
            resolvers: self.resolvers,
            plugins: self.plugins,
            stats: EngineCounters::default(),
        }
    }
}

#[derive(Debug, Default)]
struct EngineCounters {
    decisions: AtomicCounter,
    accepted: AtomicCounter,
    blocked: AtomicCounter,
    undecided: AtomicCounter,
    failures: AtomicCounter,
    reports: AtomicCounter,
    report_errors: AtomicCounter,
    resolutions: AtomicCounter,
    answered: AtomicCounter,
}

/// Engine statistics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    /// Chain evaluations
    pub decisions: u64,
    /// Evaluations ending in `Accept`
    pub accepted: u64,
    /// Evaluations ending in `Block` or `Drop`
    pub blocked: u64,
    /// Evaluations where every decider abstained
    pub undecided: u64,
    /// Evaluations that ended in an error
    pub failures: u64,
    /// Reporter invocations
    pub reports: u64,
    /// Reporter invocations that failed
    pub report_errors: u64,
    /// Resolve requests
    pub resolutions: u64,
    /// Resolve requests answered by a resolver
    pub answered: u64,
    /// Per-plugin call counters
    pub plugins: HashMap<String, PluginStatsSnapshot>,
}

/// Decides, reports and resolves for the host
pub struct DecisionEngine {
    config: DecisionConfig,
    chain: DeciderChain,
    reporters: Vec<Arc<dyn Reporter>>,
    resolvers: Vec<Arc<dyn Resolver>>,
    plugins: Vec<Arc<PluginHandle>>,
    stats: EngineCounters,
}

impl DecisionEngine {
    /// Builder
    pub fn builder(config: DecisionConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Launch every enabled plugin of the configuration and build the engine
    pub async fn launch(config: &WardenConfig) -> WardenResult<Self> {
        config.validate()?;
        let builder = EngineBuilder::new(config.decision.clone())
            .launch_plugins(config.enabled_plugins())
            .await?;
        Ok(builder.build())
    }

    /// Decide a connection that has no final verdict yet
    ///
    /// A terminal verdict is stored on the connection. A connection that is
    /// already final is returned unchanged.
    pub async fn decide(&self, conn: &mut Connection) -> Decision {
        if conn.is_final() {
            debug!(conn = %conn, verdict = %conn.verdict(), "verdict already final");
            return conn.decision();
        }
        let decision = match self.evaluate(conn).await {
            Ok(decision) => decision,
            Err(err) => self.apply_failure_policy(conn, err),
        };
        if decision.is_terminal() {
            if let Err(e) = conn.set_verdict(decision.verdict, decision.reason.clone()) {
                warn!(conn = %conn, error = %e, "verdict not stored");
            }
        }
        decision
    }

    /// Run the chain again and replace the connection's verdict
    ///
    /// Used after policy changes. When the chain abstains the connection goes
    /// back to `Undecided`. When the chain fails the current verdict stays,
    /// except that `FailClosed` may still block the connection.
    pub async fn reevaluate(&self, conn: &mut Connection) -> Decision {
        match self.evaluate(conn).await {
            Ok(decision) => {
                if decision.is_terminal() {
                    conn.reevaluate(decision.verdict, decision.reason.clone());
                } else {
                    conn.reevaluate(Verdict::Undecided, "");
                }
                decision
            }
            Err(err) => {
                let fallback = self.apply_failure_policy(conn, err);
                if !fallback.verdict.passes_traffic() {
                    conn.reevaluate(fallback.verdict, fallback.reason.clone());
                } else {
                    debug!(conn = %conn, verdict = %conn.verdict(), "verdict kept after failed re-evaluation");
                }
                fallback
            }
        }
    }

    async fn evaluate(&self, conn: &Connection) -> Result<Decision, DecisionError> {
        self.stats.decisions.inc();
        let ctx = CallContext::with_timeout(self.config.timeout());
        let decision = match ctx.run(self.chain.decide(&ctx, conn)).await {
            Ok(result) => result,
            Err(e) => Err(DecisionError::from(e)),
        }
        .map_err(|err| {
            self.stats.failures.inc();
            err
        })?;

        self.count(decision.verdict);
        debug!(conn = %conn, verdict = %decision.verdict, reason = %decision.reason, "decided");
        Ok(decision)
    }

    fn apply_failure_policy(&self, conn: &Connection, err: DecisionError) -> Decision {
        let policy = self.config.failure_policy;
        let verdict = policy.fallback_verdict();
        let reason = match policy {
            FailurePolicy::Propagate => format!("decision failed: {}", err),
            FailurePolicy::FailOpen => format!("failing open: {}", err),
            FailurePolicy::FailClosed => format!("failing closed: {}", err),
        };
        warn!(
            conn = %conn,
            error = %err,
            chain_verdict = %err.verdict,
            fallback = %verdict,
            "decider chain failed"
        );
        if verdict.is_terminal() {
            self.count(verdict);
        }
        Decision::new(verdict, reason)
    }

    fn count(&self, verdict: Verdict) {
        let counter = match verdict {
            Verdict::Accept => &self.stats.accepted,
            Verdict::Block | Verdict::Drop => &self.stats.blocked,
            Verdict::Undecided | Verdict::Undeterminable => &self.stats.undecided,
            _ => return,
        };
        counter.inc();
    }

    /// Hand the connection to every reporter
    ///
    /// Reporter failures are logged and counted, never returned.
    pub async fn report(&self, conn: &Connection) {
        let ctx = CallContext::with_timeout(self.config.timeout());
        for reporter in &self.reporters {
            self.stats.reports.inc();
            let result = ctx.run(reporter.report(&ctx, conn)).await;
            if let Err(e) = result.and_then(|reported| reported) {
                self.stats.report_errors.inc();
                warn!(conn = %conn, error = %e, "reporter failed");
            }
        }
    }

    /// Ask resolvers in order; the first answer wins
    ///
    /// `Ok(None)` means resolution should continue normally. The first
    /// resolver error stops resolution and is returned.
    pub async fn resolve(
        &self,
        question: &DnsQuestion,
        conn: &Connection,
    ) -> WardenResult<Option<DnsResponse>> {
        self.stats.resolutions.inc();
        let ctx = CallContext::with_timeout(self.config.timeout());
        for resolver in &self.resolvers {
            let answer = ctx
                .run(resolver.resolve(&ctx, question, conn))
                .await
                .and_then(|result| result)?;
            if let Some(response) = answer {
                self.stats.answered.inc();
                debug!(name = %question.name, rcode = ?response.rcode, "question answered");
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    /// Shut every plugin down
    ///
    /// Every plugin is stopped even if an earlier one fails; the first
    /// failure is returned.
    pub async fn shutdown(&self) -> WardenResult<()> {
        let mut first_err = None;
        for plugin in &self.plugins {
            if let Err(e) = plugin.shutdown().await {
                warn!(plugin = %plugin.name(), error = %e, "plugin shutdown failed");
                if first_err.is_none() {
                    first_err = Some(e.into_warden(plugin.name()));
                }
            }
        }
        info!(plugins = self.plugins.len(), "decision engine stopped");
        first_err.map_or(Ok(()), Err)
    }

    /// Plugins owned by the engine
    pub fn plugins(&self) -> &[Arc<PluginHandle>] {
        &self.plugins
    }

    /// Statistics snapshot
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            decisions: self.stats.decisions.get(),
            accepted: self.stats.accepted.get(),
            blocked: self.stats.blocked.get(),
            undecided: self.stats.undecided.get(),
            failures: self.stats.failures.get(),
            reports: self.stats.reports.get(),
            report_errors: self.stats.report_errors.get(),
            resolutions: self.stats.resolutions.get(),
            answered: self.stats.answered.get(),
            plugins: self
                .plugins
                .iter()
                .map(|p| (p.name().to_string(), p.stats()))
                .collect(),
        }
    }
}
