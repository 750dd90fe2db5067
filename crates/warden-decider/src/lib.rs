//! Warden Decider - Verdict composition
//!
//! # Chain semantics
//!
//! | Decider returns             | Chain does                               |
//! |-----------------------------|------------------------------------------|
//! | error                       | returns it with its verdict and reason   |
//! | `Undecided`/`Undeterminable`| asks the next decider                    |
//! | `Failed` without error      | returns an error naming the index        |
//! | any other verdict           | returns it, later deciders are skipped   |
//! | (every decider abstained)   | `(Undecided, "")`                        |
//!
//! The [`DecisionEngine`] puts the self-traffic filter in front of the chain
//! and turns chain errors into verdicts according to the failure policy.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chain;
pub mod engine;
pub mod self_traffic;

pub use chain::{chain, chain_fns, DeciderChain};
pub use engine::{DecisionEngine, EngineBuilder, EngineStats};
pub use self_traffic::{
    allow_self_traffic, is_self, process_identity, ExecutableIdentity, IdentityCache,
    IdentityError, SelfTrafficFilter, OWN_TRAFFIC,
};
