//! Self-traffic filter
//!
//! Connections owned by the firewall's own executable are accepted before any
//! policy runs. The executable identity is resolved once per process and
//! never retried; a failure stays a failure until restart.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{debug, warn};
use warden_common::{
    CallContext, Connection, Decider, Decision, DecisionError, DecisionResult, Verdict, WardenError,
};

/// Reason attached to accepted self-traffic
pub const OWN_TRAFFIC: &str = "own traffic";

/// Failure to determine the current executable
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The OS did not report an executable path
    #[error("failed to get executable path: {0}")]
    Executable(String),

    /// The executable path could not be canonicalized
    #[error("failed to resolve {}: {reason}", .path.display())]
    Canonicalize {
        /// Path as reported by the OS
        path: PathBuf,
        /// Failure description
        reason: String,
    },
}

impl From<IdentityError> for WardenError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Executable(reason) => WardenError::Identity(reason),
            IdentityError::Canonicalize { path, reason } => {
                WardenError::Identity(format!("{}: {}", path.display(), reason))
            }
        }
    }
}

/// Paths under which the running executable is known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableIdentity {
    /// Path as reported by the OS
    pub path: PathBuf,
    /// Symlink-free canonical path
    pub canonical: PathBuf,
}

impl ExecutableIdentity {
    /// Resolve the identity of the running process
    pub fn current() -> Result<Self, IdentityError> {
        let path = std::env::current_exe().map_err(|e| IdentityError::Executable(e.to_string()))?;
        Self::from_path(path)
    }

    /// Resolve the identity of an executable path
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, IdentityError> {
        let path = path.into();
        let canonical = std::fs::canonicalize(&path).map_err(|e| IdentityError::Canonicalize {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { path, canonical })
    }

    /// Whether `binary` is either known path
    pub fn matches(&self, binary: &Path) -> bool {
        binary == self.path || binary == self.canonical
    }
}

type IdentityResolver = dyn Fn() -> Result<ExecutableIdentity, IdentityError> + Send + Sync;

/// Resolve-once cache of the executable identity
pub struct IdentityCache {
    cell: OnceLock<Result<ExecutableIdentity, IdentityError>>,
    resolver: Box<IdentityResolver>,
}

impl std::fmt::Debug for IdentityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCache")
            .field("resolved", &self.cell.get())
            .finish()
    }
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityCache {
    /// Cache for the running executable
    pub fn new() -> Self {
        Self::with_resolver(ExecutableIdentity::current)
    }

    /// Cache with a custom resolver, invoked at most once
    pub fn with_resolver<F>(resolver: F) -> Self
    where
        F: Fn() -> Result<ExecutableIdentity, IdentityError> + Send + Sync + 'static,
    {
        Self {
            cell: OnceLock::new(),
            resolver: Box::new(resolver),
        }
    }

    /// Resolved identity, or the cached failure
    pub fn identity(&self) -> Result<&ExecutableIdentity, IdentityError> {
        self.cell
            .get_or_init(|| {
                let resolved = (self.resolver)();
                match &resolved {
                    Ok(identity) => debug!(
                        path = %identity.path.display(),
                        canonical = %identity.canonical.display(),
                        "executable identity resolved"
                    ),
                    Err(e) => warn!(error = %e, "executable identity unavailable"),
                }
                resolved
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    /// Whether the connection is owned by this executable
    pub fn is_self(&self, conn: &Connection) -> Result<bool, IdentityError> {
        let identity = self.identity()?;
        Ok(conn.binary_path().is_some_and(|binary| identity.matches(binary)))
    }
}

/// Process-wide identity cache
pub fn process_identity() -> &'static Arc<IdentityCache> {
    static CACHE: OnceLock<Arc<IdentityCache>> = OnceLock::new();
    CACHE.get_or_init(|| Arc::new(IdentityCache::new()))
}

/// Whether the connection is owned by the running executable
pub fn is_self(conn: &Connection) -> Result<bool, IdentityError> {
    process_identity().is_self(conn)
}

/// Decider accepting the host's own traffic, meant to run first in any chain
#[derive(Debug, Clone)]
pub struct SelfTrafficFilter {
    cache: Arc<IdentityCache>,
}

impl SelfTrafficFilter {
    /// Filter backed by a specific cache
    pub fn with_cache(cache: Arc<IdentityCache>) -> Self {
        Self { cache }
    }
}

/// Filter backed by the process-wide identity cache
pub fn allow_self_traffic() -> SelfTrafficFilter {
    SelfTrafficFilter::with_cache(Arc::clone(process_identity()))
}

#[async_trait]
impl Decider for SelfTrafficFilter {
    async fn decide(&self, _ctx: &CallContext, conn: &Connection) -> DecisionResult {
        match self.cache.is_self(conn) {
            Ok(true) => {
                debug!(conn = %conn, "accepting own traffic");
                Ok(Decision::accept(OWN_TRAFFIC))
            }
            Ok(false) => Ok(Decision::undecided()),
            Err(e) => Err(DecisionError::new(Verdict::Undecided, "", e.into())),
        }
    }
}
