//! Identity-based request authorization.
//!
//! Transport verification proves a client certificate chains to the trust
//! pool; this gate additionally restricts *which* verified identities may
//! perform *which* requests.  It compiles [`AuthorizationConfig`] once and
//! evaluates `(identity, path, verb)` triples.
//!
//! # Evaluation
//!
//! 1. Unverified identity → [`PolicyDecision::Deny`].
//! 2. Gate disabled → [`PolicyDecision::Allow`].
//! 3. Any rule whose identity equals the CN or a SAN *and* has a grant whose
//!    path and verb match → [`PolicyDecision::Allow`].
//! 4. Otherwise → [`PolicyDecision::Deny`] (fail-closed).
//!
//! # Path patterns
//!
//! | Pattern | Semantics |
//! |---------|-----------|
//! | `"*"` | matches everything |
//! | `"/prefix*"` | prefix match |
//! | `"*suffix"` | suffix match |
//! | `"*contains*"` | contains match |
//! | `"/exact"` | exact match |

use std::collections::HashMap;

use axum::http::Method;
use tracing::{debug, warn};

use crate::mtls::config::{AuthorizationConfig, GrantConfig};
use crate::mtls::identity::ClientIdentity;
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Public decision type
// ─────────────────────────────────────────────────────────────────────────────

/// Result of evaluating a request against the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// The request may reach the metrics handler.
    Allow,
    /// The request is answered with 403.
    Deny,
}

impl PolicyDecision {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Compiled gate
// ─────────────────────────────────────────────────────────────────────────────

/// Compiled allow-list.
///
/// Build once at startup with [`AuthorizationGate::from_config`], then call
/// [`AuthorizationGate::authorize`] per request.
#[derive(Debug, Clone)]
pub struct AuthorizationGate {
    /// Identity name → grants.  Several rules for one identity are merged.
    grants: HashMap<String, Vec<CompiledGrant>>,
    enabled: bool,
}

impl AuthorizationGate {
    /// Compile the gate from configuration.
    #[must_use]
    pub fn from_config(config: &AuthorizationConfig) -> Self {
        let mut grants: HashMap<String, Vec<CompiledGrant>> = HashMap::new();
        for rule in &config.rules {
            grants
                .entry(rule.identity.clone())
                .or_default()
                .extend(rule.allow.iter().map(CompiledGrant::from_config));
        }

        Self {
            grants,
            enabled: config.enabled,
        }
    }

    /// Decide whether `identity` may perform `verb` on `path`.
    #[must_use]
    pub fn authorize(&self, identity: &ClientIdentity, path: &str, verb: &Method) -> PolicyDecision {
        if !identity.is_verified() {
            return PolicyDecision::Deny;
        }
        if !self.enabled {
            return PolicyDecision::Allow;
        }

        let allowed = identity
            .names()
            .filter_map(|name| self.grants.get(name))
            .flatten()
            .any(|grant| grant.permits(path, verb));

        if allowed {
            PolicyDecision::Allow
        } else {
            PolicyDecision::Deny
        }
    }

    /// [`AuthorizationGate::authorize`] as a `Result`, logging the outcome.
    ///
    /// The error carries the identity and request for server-side logs only;
    /// callers must not echo it to the client.
    pub fn check(&self, identity: &ClientIdentity, path: &str, verb: &Method) -> Result<()> {
        match self.authorize(identity, path, verb) {
            PolicyDecision::Allow => {
                debug!(identity = %identity.display_name(), %verb, path, "Request authorized");
                Ok(())
            }
            PolicyDecision::Deny => {
                warn!(identity = %identity.display_name(), %verb, path, "Request denied by allow-list");
                Err(Error::Authorization {
                    identity: identity.display_name().to_string(),
                    verb: verb.to_string(),
                    path: path.to_string(),
                })
            }
        }
    }

    /// Number of identities with at least one grant.
    #[must_use]
    pub fn identity_count(&self) -> usize {
        self.grants.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Compiled grant
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct CompiledGrant {
    path: PathPattern,
    verbs: Vec<Method>,
}

impl CompiledGrant {
    fn from_config(cfg: &GrantConfig) -> Self {
        Self {
            path: PathPattern::new(&cfg.path),
            // Unparseable verbs can never match a real request method.
            verbs: cfg
                .verbs
                .iter()
                .filter_map(|v| Method::from_bytes(v.to_ascii_uppercase().as_bytes()).ok())
                .collect(),
        }
    }

    fn permits(&self, path: &str, verb: &Method) -> bool {
        self.path.matches(path) && self.verbs.iter().any(|v| v == verb)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Path pattern
// ─────────────────────────────────────────────────────────────────────────────

/// A compiled path pattern supporting `*`, `prefix*`, `*suffix`, `*mid*`,
/// and exact matches.
#[derive(Debug, Clone)]
enum PathPattern {
    Wildcard,
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
}

impl PathPattern {
    fn new(s: &str) -> Self {
        if s == "*" {
            return Self::Wildcard;
        }
        match (s.strip_prefix('*'), s.strip_suffix('*')) {
            (Some(rest), Some(_)) => match rest.strip_suffix('*') {
                Some("") | None => Self::Wildcard,
                Some(inner) => Self::Contains(inner.to_string()),
            },
            (Some(suffix), None) => Self::Suffix(suffix.to_string()),
            (None, Some(prefix)) => Self::Prefix(prefix.to_string()),
            (None, None) => Self::Exact(s.to_string()),
        }
    }

    fn matches(&self, path: &str) -> bool {
        match self {
            Self::Wildcard => true,
            Self::Exact(e) => path == e,
            Self::Prefix(p) => path.starts_with(p.as_str()),
            Self::Suffix(s) => path.ends_with(s.as_str()),
            Self::Contains(c) => path.contains(c.as_str()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
