//! Authorization scopes and token registry
//!
//! Every RPC method declares a required scope. Tokens map to scope sets via
//! config; `admin` implies all. Comparison is constant-time.

pub mod device;
pub mod pairing;

use serde::{Deserialize, Serialize};

pub use device::DeviceIdentity;
pub use pairing::PairingManager;

/// Permission label gating RPC methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Read,
    Write,
    Approvals,
    Pairing,
    Admin,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Approvals => write!(f, "approvals"),
            Self::Pairing => write!(f, "pairing"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

/// An authenticated connection's granted scopes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSet {
    scopes: Vec<Scope>,
}

impl ScopeSet {
    /// Build from a list of scopes
    #[must_use]
    pub fn new(scopes: Vec<Scope>) -> Self {
        Self { scopes }
    }

    /// All scopes, for administrative tokens
    #[must_use]
    pub fn admin() -> Self {
        Self {
            scopes: vec![Scope::Admin],
        }
    }

    /// Does this set satisfy the required scope? `admin` implies all.
    #[must_use]
    pub fn allows(&self, required: Scope) -> bool {
        self.scopes
            .iter()
            .any(|s| *s == Scope::Admin || *s == required)
    }

    /// The granted scopes as declared
    #[must_use]
    pub fn as_slice(&self) -> &[Scope] {
        &self.scopes
    }

    /// Whether any scope is granted at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

/// Resolve a bearer token to its scope set using the config snapshot.
///
/// Returns `None` for unknown tokens. Comparison is constant-time per
/// candidate to avoid timing oracles.
#[must_use]
pub fn resolve_token(config: &crate::config::Config, token: &str) -> Option<ScopeSet> {
    for candidate in &config.tokens {
        if constant_time_eq(candidate.token.as_bytes(), token.as_bytes()) {
            return Some(ScopeSet::new(candidate.scopes.clone()));
        }
    }
    None
}

/// Constant-time byte comparison to prevent timing attacks
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
