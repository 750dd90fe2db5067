//! Inspector contract and registry

use crate::error::{InspectError, Result};
use crate::session::{ConnectionSaver, InspectionSession, PipelineCounters, PipelineStats};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use warden_common::{Connection, Decision, InspectionConfig, OverridePolicy, Packet};

/// Stateful per-connection packet observer
pub trait Inspector: Send {
    /// Inspector name
    fn name(&self) -> &str;

    /// Look at one packet, optionally updating connection state
    fn handle_packet(&mut self, conn: &mut Connection, packet: &Packet) -> Result<Decision>;

    /// Release per-connection state
    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds an inspector for a connection from its first packet
///
/// `Ok(None)` declines the connection.
pub type InspectorFactory =
    dyn Fn(&Connection, &Packet) -> Result<Option<Box<dyn Inspector>>> + Send + Sync;

/// A registered inspector
#[derive(Clone)]
pub struct Registration {
    /// Inspector name
    pub name: String,
    /// Lower runs first
    pub order: i32,
    pub(crate) factory: Arc<InspectorFactory>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("order", &self.order)
            .finish()
    }
}

/// Ordered set of inspectors, shared by every inspection session
pub struct InspectorRegistry {
    registrations: Arc<Vec<Registration>>,
    disabled: HashSet<String>,
    policy: OverridePolicy,
    saver: Option<Arc<dyn ConnectionSaver>>,
    counters: Arc<PipelineCounters>,
}

impl Default for InspectorRegistry {
    fn default() -> Self {
        Self::new(&InspectionConfig::default())
    }
}

impl InspectorRegistry {
    /// Create empty registry
    pub fn new(config: &InspectionConfig) -> Self {
        Self {
            registrations: Arc::new(Vec::new()),
            disabled: config.disabled.iter().cloned().collect(),
            policy: config.override_policy,
            saver: None,
            counters: Arc::new(PipelineCounters::default()),
        }
    }

    /// Persistence callback for save requests raised by inspectors
    pub fn with_saver(mut self, saver: impl ConnectionSaver + 'static) -> Self {
        self.saver = Some(Arc::new(saver));
        self
    }

    /// Register an inspector
    ///
    /// Ties on `order` keep registration order. Disabled names are accepted
    /// and ignored.
    pub fn register<F>(&mut self, name: impl Into<String>, order: i32, factory: F) -> Result<()>
    where
        F: Fn(&Connection, &Packet) -> Result<Option<Box<dyn Inspector>>> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.registrations.iter().any(|r| r.name == name) {
            return Err(InspectError::Duplicate(name));
        }
        if self.disabled.contains(&name) {
            info!(inspector = %name, "inspector disabled by configuration");
            return Ok(());
        }

        let registrations = Arc::make_mut(&mut self.registrations);
        let at = registrations.partition_point(|r| r.order <= order);
        debug!(inspector = %name, order, position = at, "inspector registered");
        registrations.insert(
            at,
            Registration {
                name,
                order,
                factory: Arc::new(factory),
            },
        );
        Ok(())
    }

    /// Registered inspector names in execution order
    pub fn names(&self) -> Vec<&str> {
        self.registrations.iter().map(|r| r.name.as_str()).collect()
    }

    /// Number of active registrations
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Override policy applied by sessions
    pub fn policy(&self) -> OverridePolicy {
        self.policy
    }

    /// Start inspecting a new connection
    pub fn session(&self) -> InspectionSession {
        self.counters.sessions.inc();
        InspectionSession::new(
            Arc::clone(&self.registrations),
            self.policy,
            self.saver.clone(),
            Arc::clone(&self.counters),
        )
    }

    /// Statistics snapshot across all sessions
    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(&'static str);

    impl Inspector for Noop {
        fn name(&self) -> &str {
            self.0
        }

        fn handle_packet(&mut self, _conn: &mut Connection, _packet: &Packet) -> Result<Decision> {
            Ok(Decision::undeterminable())
        }
    }

    fn noop(
        name: &'static str,
    ) -> impl Fn(&Connection, &Packet) -> Result<Option<Box<dyn Inspector>>> + Send + Sync + 'static
    {
        move |_: &Connection, _: &Packet| Ok(Some(Box::new(Noop(name)) as Box<dyn Inspector>))
    }

    #[test]
    fn test_order_with_stable_ties() {
        let mut registry = InspectorRegistry::default();
        registry.register("late", 5, noop("late")).unwrap();
        registry.register("tie-a", 1, noop("tie-a")).unwrap();
        registry.register("first", -3, noop("first")).unwrap();
        registry.register("tie-b", 1, noop("tie-b")).unwrap();
        assert_eq!(registry.names(), vec!["first", "tie-a", "tie-b", "late"]);
    }

    #[test]
    fn test_duplicates_rejected_and_disabled_skipped() {
        let config = InspectionConfig {
            disabled: vec!["noisy".into()],
            ..InspectionConfig::default()
        };
        let mut registry = InspectorRegistry::new(&config);
        registry.register("dpi", 3, noop("dpi")).unwrap();
        assert_eq!(
            registry.register("dpi", 4, noop("dpi")),
            Err(InspectError::Duplicate("dpi".into()))
        );
        registry.register("noisy", 1, noop("noisy")).unwrap();
        assert_eq!(registry.names(), vec!["dpi"]);
        assert_eq!(registry.len(), 1);
    }
}
