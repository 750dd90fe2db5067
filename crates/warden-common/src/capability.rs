//! Capability contracts
//!
//! ```text
//!   Decider   Connection            -> Decision | DecisionError
//!   Reporter  Connection            -> () | WardenError
//!   Resolver  DnsQuestion, Connection -> Option<DnsResponse> | WardenError
//! ```
//!
//! Local evaluators implement the traits directly or wrap a closure in one of
//! the `*Fn` adapters; plugin handles implement them over RPC.

use crate::connection::Connection;
use crate::context::CallContext;
use crate::dns::{DnsQuestion, DnsResponse};
use crate::error::{DecisionResult, WardenResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Capability kinds a plugin can advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Renders verdicts
    Decider,
    /// Observes finished connections
    Reporter,
    /// Answers DNS questions
    Resolver,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decider => write!(f, "decider"),
            Self::Reporter => write!(f, "reporter"),
            Self::Resolver => write!(f, "resolver"),
        }
    }
}

/// Set of capabilities, fixed after handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet {
    decider: bool,
    reporter: bool,
    resolver: bool,
}

impl CapabilitySet {
    /// Empty set
    pub const fn empty() -> Self {
        Self {
            decider: false,
            reporter: false,
            resolver: false,
        }
    }

    /// Add a capability
    pub fn with(mut self, capability: Capability) -> Self {
        match capability {
            Capability::Decider => self.decider = true,
            Capability::Reporter => self.reporter = true,
            Capability::Resolver => self.resolver = true,
        }
        self
    }

    /// Whether the capability is present
    pub const fn contains(&self, capability: Capability) -> bool {
        match capability {
            Capability::Decider => self.decider,
            Capability::Reporter => self.reporter,
            Capability::Resolver => self.resolver,
        }
    }

    /// Whether no capability is present
    pub const fn is_empty(&self) -> bool {
        !(self.decider || self.reporter || self.resolver)
    }

    /// Capabilities in stable order
    pub fn to_vec(&self) -> Vec<Capability> {
        [Capability::Decider, Capability::Reporter, Capability::Resolver]
            .into_iter()
            .filter(|c| self.contains(*c))
            .collect()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.to_vec().iter().map(ToString::to_string).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// Renders a verdict for a connection
#[async_trait]
pub trait Decider: Send + Sync {
    /// Decide on the connection, abstaining with `Undecided`/`Undeterminable`
    async fn decide(&self, ctx: &CallContext, conn: &Connection) -> DecisionResult;
}

/// Observes connections without influencing their verdict
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Report the connection
    async fn report(&self, ctx: &CallContext, conn: &Connection) -> WardenResult<()>;
}

/// Intercepts DNS resolution
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Answer the question, `None` to let resolution continue normally
    async fn resolve(
        &self,
        ctx: &CallContext,
        question: &DnsQuestion,
        conn: &Connection,
    ) -> WardenResult<Option<DnsResponse>>;
}

type DeciderFnInner = dyn Fn(&CallContext, &Connection) -> DecisionResult + Send + Sync;
type ReporterFnInner = dyn Fn(&CallContext, &Connection) -> WardenResult<()> + Send + Sync;
type ResolverFnInner =
    dyn Fn(&CallContext, &DnsQuestion, &Connection) -> WardenResult<Option<DnsResponse>> + Send + Sync;

/// Decider backed by a plain function
#[derive(Clone)]
pub struct DeciderFn(Arc<DeciderFnInner>);

impl DeciderFn {
    /// Wrap a function
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&CallContext, &Connection) -> DecisionResult + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for DeciderFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeciderFn")
    }
}

#[async_trait]
impl Decider for DeciderFn {
    async fn decide(&self, ctx: &CallContext, conn: &Connection) -> DecisionResult {
        (self.0)(ctx, conn)
    }
}

/// Reporter backed by a plain function
#[derive(Clone)]
pub struct ReporterFn(Arc<ReporterFnInner>);

impl ReporterFn {
    /// Wrap a function
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&CallContext, &Connection) -> WardenResult<()> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for ReporterFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReporterFn")
    }
}

#[async_trait]
impl Reporter for ReporterFn {
    async fn report(&self, ctx: &CallContext, conn: &Connection) -> WardenResult<()> {
        (self.0)(ctx, conn)
    }
}

/// Resolver backed by a plain function
#[derive(Clone)]
pub struct ResolverFn(Arc<ResolverFnInner>);

impl ResolverFn {
    /// Wrap a function
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&CallContext, &DnsQuestion, &Connection) -> WardenResult<Option<DnsResponse>>
            + Send
            + Sync
            + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for ResolverFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResolverFn")
    }
}

#[async_trait]
impl Resolver for ResolverFn {
    async fn resolve(
        &self,
        ctx: &CallContext,
        question: &DnsQuestion,
        conn: &Connection,
    ) -> WardenResult<Option<DnsResponse>> {
        (self.0)(ctx, question, conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_set() {
        let set: CapabilitySet = [Capability::Resolver, Capability::Decider].into_iter().collect();
        assert!(set.contains(Capability::Decider));
        assert!(!set.contains(Capability::Reporter));
        assert_eq!(set.to_vec(), vec![Capability::Decider, Capability::Resolver]);
        assert_eq!(set.to_string(), "[decider, resolver]");
        assert!(CapabilitySet::empty().is_empty());
    }
}
