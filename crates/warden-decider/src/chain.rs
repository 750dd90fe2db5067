//! Ordered decider composition
//!
//! ```text
//!  conn ─► d[0] ─► d[1] ─► ... ─► d[n-1] ─► (Undecided, "")
//!           │       │               │
//!           └───────┴── first error, Failed or other terminal verdict returns
//! ```
//!
//! `Undecided` and `Undeterminable` mean "no opinion" and hand the
//! connection to the next decider.

use async_trait::async_trait;
use std::sync::Arc;
use warden_common::{
    CallContext, Connection, Decider, DeciderFn, Decision, DecisionError, DecisionResult, Verdict,
    WardenError,
};

/// Deciders queried in order until one decides
#[derive(Clone, Default)]
pub struct DeciderChain {
    deciders: Vec<Arc<dyn Decider>>,
}

impl std::fmt::Debug for DeciderChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeciderChain")
            .field("len", &self.deciders.len())
            .finish()
    }
}

/// Compose deciders into a chain
pub fn chain(deciders: Vec<Arc<dyn Decider>>) -> DeciderChain {
    DeciderChain { deciders }
}

/// Compose plain decider functions into a chain
pub fn chain_fns(deciders: Vec<DeciderFn>) -> DeciderChain {
    chain(
        deciders
            .into_iter()
            .map(|d| Arc::new(d) as Arc<dyn Decider>)
            .collect(),
    )
}

impl DeciderChain {
    /// Number of deciders
    pub fn len(&self) -> usize {
        self.deciders.len()
    }

    /// Whether the chain has no deciders
    pub fn is_empty(&self) -> bool {
        self.deciders.is_empty()
    }
}

#[async_trait]
impl Decider for DeciderChain {
    async fn decide(&self, ctx: &CallContext, conn: &Connection) -> DecisionResult {
        for (index, decider) in self.deciders.iter().enumerate() {
            let decision = decider.decide(ctx, conn).await?;
            match decision.verdict {
                Verdict::Undecided | Verdict::Undeterminable => continue,
                Verdict::Failed => {
                    return Err(DecisionError::new(
                        Verdict::Failed,
                        decision.reason,
                        WardenError::DeciderFailed { index },
                    ))
                }
                _ => return Ok(decision),
            }
        }
        Ok(Decision::undecided())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use warden_common::{Endpoint, Entity};

    /// Error instead of a verdict
    const STEP_ERROR: u8 = 8;

    fn conn() -> Connection {
        Connection::outbound(
            "c1",
            6,
            Endpoint {
                ip: "10.1.1.1".parse().unwrap(),
                port: 40000,
            },
            Entity {
                ip: "10.2.2.2".parse().unwrap(),
                port: 443,
                domain: None,
            },
        )
    }

    fn scripted(step: u8, calls: Arc<AtomicUsize>) -> DeciderFn {
        DeciderFn::new(move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            if step == STEP_ERROR {
                return Err(DecisionError::new(
                    Verdict::Undeterminable,
                    "lookup failed",
                    WardenError::Io("backend down".into()),
                ));
            }
            let verdict = Verdict::from_wire(step).unwrap_or_default();
            Ok(Decision::new(verdict, format!("step {}", step)))
        })
    }

    fn counted(steps: &[u8]) -> (DeciderChain, Vec<Arc<AtomicUsize>>) {
        let counters: Vec<Arc<AtomicUsize>> =
            steps.iter().map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let fns = steps
            .iter()
            .zip(&counters)
            .map(|(step, calls)| scripted(*step, Arc::clone(calls)))
            .collect();
        (chain_fns(fns), counters)
    }

    fn run(chain: &DeciderChain) -> DecisionResult {
        tokio_test::block_on(chain.decide(&CallContext::background(), &conn()))
    }

    #[tokio::test]
    async fn test_first_terminal_wins() {
        let third_calls = Arc::new(AtomicUsize::new(0));
        let chain = chain_fns(vec![
            DeciderFn::new(|_, _| Ok(Decision::undeterminable())),
            DeciderFn::new(|_, _| Ok(Decision::accept("own"))),
            scripted(Verdict::Block.wire_value(), Arc::clone(&third_calls)),
        ]);

        let decision = chain.decide(&CallContext::background(), &conn()).await.unwrap();
        assert_eq!(decision, Decision::accept("own"));
        assert_eq!(third_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_and_abstaining_chains() {
        let empty = chain(Vec::new());
        assert!(empty.is_empty());
        assert_eq!(
            empty.decide(&CallContext::background(), &conn()).await.unwrap(),
            Decision::undecided()
        );

        let abstain = chain_fns(vec![
            DeciderFn::new(|_, _| Ok(Decision::undecided())),
            DeciderFn::new(|_, _| Ok(Decision::undeterminable())),
        ]);
        assert_eq!(
            abstain.decide(&CallContext::background(), &conn()).await.unwrap(),
            Decision::undecided()
        );
    }

    #[tokio::test]
    async fn test_failed_without_error_names_index() {
        let chain = chain_fns(vec![
            DeciderFn::new(|_, _| Ok(Decision::undecided())),
            DeciderFn::new(|_, _| Ok(Decision::new(Verdict::Failed, "rule engine broken"))),
        ]);
        let err = chain
            .decide(&CallContext::background(), &conn())
            .await
            .unwrap_err();
        assert_eq!(err.verdict, Verdict::Failed);
        assert_eq!(err.reason, "rule engine broken");
        assert_eq!(err.source, WardenError::DeciderFailed { index: 1 });
        assert_eq!(
            err.to_string(),
            "chained decider at index 1 returned verdict failed"
        );
    }

    #[tokio::test]
    async fn test_chains_nest() {
        let inner = chain_fns(vec![DeciderFn::new(|_, _| Ok(Decision::block("inner")))]);
        let outer = chain(vec![
            Arc::new(chain(Vec::new())) as Arc<dyn Decider>,
            Arc::new(inner),
        ]);
        assert_eq!(outer.len(), 2);
        assert_eq!(
            outer.decide(&CallContext::background(), &conn()).await.unwrap(),
            Decision::block("inner")
        );
    }

    proptest! {
        #[test]
        fn prop_chain_stops_at_first_non_abstention(steps in prop::collection::vec(0u8..=STEP_ERROR, 0..8)) {
            let (chain, counters) = counted(&steps);
            let result = run(&chain);

            let stop = steps.iter().position(|s| *s > Verdict::Undeterminable.wire_value());
            match stop {
                None => prop_assert_eq!(result, Ok(Decision::undecided())),
                Some(i) if steps[i] == STEP_ERROR => {
                    let err = result.unwrap_err();
                    prop_assert_eq!(err.verdict, Verdict::Undeterminable);
                    prop_assert_eq!(err.source, WardenError::Io("backend down".into()));
                }
                Some(i) if steps[i] == Verdict::Failed.wire_value() => {
                    let err = result.unwrap_err();
                    prop_assert_eq!(err.source, WardenError::DeciderFailed { index: i });
                }
                Some(i) => {
                    let decision = result.unwrap();
                    prop_assert_eq!(decision.verdict.wire_value(), steps[i]);
                    prop_assert_eq!(decision.reason, format!("step {}", steps[i]));
                }
            }

            let last_called = stop.unwrap_or(steps.len().saturating_sub(1));
            for (i, calls) in counters.iter().enumerate() {
                let expected = usize::from(i <= last_called && !steps.is_empty());
                prop_assert_eq!(calls.load(Ordering::SeqCst), expected);
            }
        }
    }
}
