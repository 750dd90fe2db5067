//! Warden Common - Shared types for the firewall verdict core
//!
//! This crate provides the vocabulary every evaluator speaks:
//! - Verdicts and decisions
//! - Connections, DNS questions and raw packets
//! - Capability contracts (decider, reporter, resolver)
//! - Per-call cancellation
//! - Configuration and errors
//!
//! # Architecture
//!
//! ```text
//!              ┌──────────────┐
//!  capture ───►│  Connection  │◄─── process attribution
//!              └──────┬───────┘
//!          ┌──────────┼───────────┐
//!          ▼          ▼           ▼
//!      Decider    Reporter    Resolver      (local fn or plugin RPC)
//!          │
//!          ▼
//!   Decision { verdict, reason }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capability;
pub mod config;
pub mod connection;
pub mod context;
pub mod dns;
pub mod error;
pub mod packet;
pub mod verdict;

pub use capability::*;
pub use config::*;
pub use connection::*;
pub use context::CallContext;
pub use dns::*;
pub use error::*;
pub use packet::*;
pub use verdict::*;

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counter for statistics
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create new counter
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment and return previous value
    #[inline(always)]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Add value and return previous
    #[inline(always)]
    pub fn add(&self, val: u64) -> u64 {
        self.0.fetch_add(val, Ordering::Relaxed)
    }

    /// Get current value
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_counter() {
        let counter = AtomicCounter::new(0);
        assert_eq!(counter.inc(), 0);
        assert_eq!(counter.add(5), 1);
        assert_eq!(counter.get(), 6);
    }
}
