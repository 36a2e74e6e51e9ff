//! mTLS configuration types.
//!
//! Defines the YAML-deserialisable configuration for mutual TLS: server
//! certificate paths, the client CA trust bundle, an optional CRL, hot-reload
//! behaviour and the identity allow-list.
//!
//! # Example YAML
//!
//! ```yaml
//! tls:
//!   cert_file: "/etc/tls/private/tls.crt"
//!   key_file:  "/etc/tls/private/tls.key"
//! trust:
//!   ca_bundle_file: "/etc/tls/client-ca/service-ca.crt"
//! reload:
//!   mode: notify
//!   poll_interval: 5s
//! authorization:
//!   rules:
//!     - identity: "system:serviceaccount:openshift-monitoring:prometheus-k8s"
//!       allow:
//!         - path: /metrics
//!           verbs: [GET]
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identity of the in-cluster Prometheus scraper.
pub const PROMETHEUS_K8S_IDENTITY: &str =
    "system:serviceaccount:openshift-monitoring:prometheus-k8s";

// ─────────────────────────────────────────────────────────────────────────────
// Server identity / trust sources
// ─────────────────────────────────────────────────────────────────────────────

/// Server certificate and key, provisioned by an external issuer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to the PEM-encoded server certificate chain (leaf first).
    pub cert_file: PathBuf,

    /// Path to the PEM-encoded private key (PKCS#8, PKCS#1 or SEC1).
    pub key_file: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_file: PathBuf::from("/etc/tls/private/tls.crt"),
            key_file: PathBuf::from("/etc/tls/private/tls.key"),
        }
    }
}

/// Client-certificate trust anchors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Path to the PEM bundle of CA certificates used to verify clients.
    ///
    /// Usually a ConfigMap mounted as a volume; the whole file is the source
    /// of truth and is re-read on every change.
    pub ca_bundle_file: PathBuf,

    /// Optional path to a PEM-encoded Certificate Revocation List.
    ///
    /// When set, revoked client certificates are rejected at the handshake.
    pub crl_file: Option<PathBuf>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            ca_bundle_file: PathBuf::from("/etc/tls/client-ca/service-ca.crt"),
            crl_file: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hot reload
// ─────────────────────────────────────────────────────────────────────────────

/// How watchers learn that their source changed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReloadMode {
    /// Filesystem notifications (inotify / kqueue / FSEvents).
    #[default]
    Notify,
    /// Periodic modification-time polling.
    Poll,
}

/// Hot-reload tuning shared by the certificate and trust watchers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// Notification mechanism.
    pub mode: ReloadMode,

    /// Poll interval for [`ReloadMode::Poll`] (bounded to 100ms..=60s).
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Quiet period after the last change event before reloading.
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,

    /// Extra load attempts while certificate and key disagree.
    pub pair_retry_attempts: usize,

    /// Delay between consistency retries.
    #[serde(with = "humantime_serde")]
    pub pair_retry_delay: Duration,
}

/// Lower bound for the poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound for the poll interval.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            mode: ReloadMode::Notify,
            poll_interval: Duration::from_secs(5),
            debounce: Duration::from_millis(500),
            pair_retry_attempts: 5,
            pair_retry_delay: Duration::from_millis(200),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Authorization
// ─────────────────────────────────────────────────────────────────────────────

/// Identity allow-list applied after a successful handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    /// When `false`, any client with a verified certificate is allowed.
    pub enabled: bool,

    /// Identity → permitted `(path, verbs)` grants.  No match means deny.
    pub rules: Vec<AuthorizationRuleConfig>,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: vec![AuthorizationRuleConfig {
                identity: PROMETHEUS_K8S_IDENTITY.to_string(),
                allow: vec![GrantConfig {
                    path: "/metrics".to_string(),
                    verbs: vec!["GET".to_string()],
                }],
            }],
        }
    }
}

/// One identity and everything it may do.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthorizationRuleConfig {
    /// Exact match against the certificate CN or any SAN (DNS or URI).
    pub identity: String,

    /// Permitted path / verb pairs.
    pub allow: Vec<GrantConfig>,
}

/// A path and the HTTP verbs allowed on it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GrantConfig {
    /// Request path.  Exact, or `*` glob (`/metrics*`, `*/metrics`).
    pub path: String,

    /// HTTP methods, matched case-insensitively.
    pub verbs: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_authorization_allows_only_prometheus_get_metrics() {
        // GIVEN: default-constructed authorization config
        let cfg = AuthorizationConfig::default();
        // THEN: one rule for the in-cluster Prometheus scraper
        assert!(cfg.enabled);
        assert_eq!(cfg.rules.len(), 1);
        assert_eq!(cfg.rules[0].identity, PROMETHEUS_K8S_IDENTITY);
        assert_eq!(cfg.rules[0].allow[0].path, "/metrics");
        assert_eq!(cfg.rules[0].allow[0].verbs, &["GET"]);
    }

    #[test]
    fn crl_file_defaults_to_none() {
        let cfg = TrustConfig::default();
        assert!(cfg.crl_file.is_none());
    }

    #[test]
    fn reload_mode_defaults_to_notify() {
        assert_eq!(ReloadConfig::default().mode, ReloadMode::Notify);
    }

    #[test]
    fn reload_config_parses_humantime_durations() {
        // GIVEN: poll mode with human-readable durations
        let yaml = "mode: poll\npoll_interval: 2s\ndebounce: 50ms\npair_retry_delay: 1s";
        let cfg: ReloadConfig = serde_yaml::from_str(yaml).unwrap();
        // THEN: durations converted, unset fields keep defaults
        assert_eq!(cfg.mode, ReloadMode::Poll);
        assert_eq!(cfg.poll_interval, Duration::from_secs(2));
        assert_eq!(cfg.debounce, Duration::from_millis(50));
        assert_eq!(cfg.pair_retry_delay, Duration::from_secs(1));
        assert_eq!(cfg.pair_retry_attempts, 5);
    }

    #[test]
    fn authorization_rule_with_multiple_grants_deserialises() {
        let yaml = r#"
identity: "spiffe://cluster.local/ns/monitoring/sa/thanos"
allow:
  - path: /metrics
    verbs: [GET, HEAD]
  - path: /federate*
    verbs: [get]
"#;
        let rule: AuthorizationRuleConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.allow.len(), 2);
        assert_eq!(rule.allow[0].verbs, &["GET", "HEAD"]);
        assert_eq!(rule.allow[1].path, "/federate*");
    }

    #[test]
    fn explicit_empty_rules_override_default() {
        let cfg: AuthorizationConfig = serde_yaml::from_str("rules: []").unwrap();
        assert!(cfg.rules.is_empty());
    }
}
