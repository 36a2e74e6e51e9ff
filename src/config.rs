//! Configuration management

use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::mtls::config::{
    AuthorizationConfig, MAX_POLL_INTERVAL, MIN_POLL_INTERVAL, ReloadConfig, ReloadMode,
    TlsConfig, TrustConfig,
};
use crate::{Error, Result};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "MTLS_METRICS_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Server certificate and key
    pub tls: TlsConfig,
    /// Client CA bundle and CRL
    pub trust: TrustConfig,
    /// Hot-reload behaviour
    pub reload: ReloadConfig,
    /// Client identity allow-list
    pub authorization: AuthorizationConfig,
}

/// HTTPS listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Path the metrics payload is served on
    pub metrics_path: String,
    /// Upper bound for a TLS handshake
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Upper bound for receiving a request's headers
    #[serde(with = "humantime_serde")]
    pub header_read_timeout: Duration,
    /// A connection with no request in flight for this long is closed
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Maximum number of concurrently served connections
    pub max_connections: usize,
    /// How long shutdown waits for open connections to finish
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8443,
            metrics_path: "/metrics".to_string(),
            handshake_timeout: Duration::from_secs(10),
            header_read_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            max_connections: 1024,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file plus environment.
    ///
    /// Environment variables use the `MTLS_METRICS_` prefix and `__` as the
    /// nesting separator, e.g. `MTLS_METRICS_SERVER__PORT=9443`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.parse::<std::net::IpAddr>().is_err() {
            return Err(Error::Config(format!(
                "Invalid host '{}': expected an IP address",
                self.server.host
            )));
        }
        if !self.server.metrics_path.starts_with('/') {
            return Err(Error::Config(format!(
                "metrics_path must start with '/': '{}'",
                self.server.metrics_path
            )));
        }
        if self.server.handshake_timeout.is_zero() {
            return Err(Error::Config("handshake_timeout must be non-zero".into()));
        }
        if self.server.header_read_timeout.is_zero() {
            return Err(Error::Config("header_read_timeout must be non-zero".into()));
        }
        if self.server.idle_timeout.is_zero() {
            return Err(Error::Config("idle_timeout must be non-zero".into()));
        }
        if self.server.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }

        for (name, path) in [
            ("tls.cert_file", &self.tls.cert_file),
            ("tls.key_file", &self.tls.key_file),
            ("trust.ca_bundle_file", &self.trust.ca_bundle_file),
        ] {
            if path.as_os_str().is_empty() {
                return Err(Error::Config(format!("{name} must be set")));
            }
        }

        if self.reload.mode == ReloadMode::Poll
            && !(MIN_POLL_INTERVAL..=MAX_POLL_INTERVAL).contains(&self.reload.poll_interval)
        {
            return Err(Error::Config(format!(
                "reload.poll_interval must be between {MIN_POLL_INTERVAL:?} and {MAX_POLL_INTERVAL:?}"
            )));
        }

        if self.authorization.enabled {
            if self.authorization.rules.is_empty() {
                return Err(Error::Config(
                    "authorization is enabled but no rules are configured".into(),
                ));
            }
            for rule in &self.authorization.rules {
                if rule.identity.is_empty() {
                    return Err(Error::Config("authorization rule without identity".into()));
                }
                if rule.allow.iter().any(|g| g.path.is_empty() || g.verbs.is_empty()) {
                    return Err(Error::Config(format!(
                        "authorization rule for '{}' has a grant without path or verbs",
                        rule.identity
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::mtls::config::PROMETHEUS_K8S_IDENTITY;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn load_reads_yaml_file() {
        // GIVEN: a config file overriding port, bundle path and reload mode
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "server:\n  port: 9443\n  handshake_timeout: 3s\ntrust:\n  ca_bundle_file: /tmp/ca.crt\nreload:\n  mode: poll\n  poll_interval: 2s"
        )
        .unwrap();

        // WHEN: loading it
        let cfg = Config::load(Some(file.path())).unwrap();

        // THEN: overrides applied, other fields defaulted
        assert_eq!(cfg.server.port, 9443);
        assert_eq!(cfg.server.handshake_timeout, Duration::from_secs(3));
        assert_eq!(cfg.trust.ca_bundle_file, Path::new("/tmp/ca.crt"));
        assert_eq!(cfg.reload.mode, ReloadMode::Poll);
        assert_eq!(cfg.server.metrics_path, "/metrics");
        assert_eq!(cfg.authorization.rules[0].identity, PROMETHEUS_K8S_IDENTITY);
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/config.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn poll_interval_out_of_bounds_is_rejected() {
        let mut cfg = Config::default();
        cfg.reload.mode = ReloadMode::Poll;
        cfg.reload.poll_interval = Duration::from_secs(600);
        assert!(cfg.validate().is_err());

        cfg.reload.poll_interval = Duration::from_millis(1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn poll_interval_ignored_in_notify_mode() {
        let mut cfg = Config::default();
        cfg.reload.poll_interval = Duration::from_secs(600);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn enabled_authorization_requires_rules() {
        let mut cfg = Config::default();
        cfg.authorization.rules.clear();
        assert!(cfg.validate().is_err());

        cfg.authorization.enabled = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn grant_without_verbs_is_rejected() {
        let mut cfg = Config::default();
        cfg.authorization.rules[0].allow[0].verbs.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_handshake_timeout_is_rejected() {
        let mut cfg = Config::default();
        cfg.server.handshake_timeout = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_idle_timeout_is_rejected() {
        let mut cfg = Config::default();
        cfg.server.idle_timeout = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn hostname_instead_of_ip_is_rejected() {
        let mut cfg = Config::default();
        cfg.server.host = "localhost".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn metrics_path_must_be_absolute() {
        let mut cfg = Config::default();
        cfg.server.metrics_path = "metrics".to_string();
        assert!(cfg.validate().is_err());
    }
}
