//! Mutual TLS for the metrics endpoint.
//!
//! # Architecture
//!
//! ```text
//! TCP connection
//!   → DynamicTlsConfig::handshake_config()   (current pair + current pool)
//!   → TLS handshake                          (rustls requires + verifies client cert)
//!   → ClientIdentity extracted from the verified peer chain
//!   → Injected into every request's extensions
//!   → AuthorizationGate check                (identity, path, verb)
//!   → metrics handler
//! ```
//!
//! # Modules
//!
//! - [`config`]: YAML configuration types (`TlsConfig`, `TrustConfig`, `AuthorizationConfig`, …)
//! - [`identity`]: X.509 certificate field extraction (`ClientIdentity`)
//! - [`access_control`]: Allow-list evaluation (`AuthorizationGate`, `PolicyDecision`)
//! - [`dynamic`]: Per-handshake rustls config from the live watchers (`DynamicTlsConfig`)
//! - [`cert_manager`]: PEM parsing and certificate generation CLI helpers
//!
//! # Quick start
//!
//! ```yaml
//! tls:
//!   cert_file: "/etc/tls/private/tls.crt"
//!   key_file:  "/etc/tls/private/tls.key"
//! trust:
//!   ca_bundle_file: "/etc/tls/client-ca/service-ca.crt"
//! authorization:
//!   rules:
//!     - identity: "system:serviceaccount:openshift-monitoring:prometheus-k8s"
//!       allow:
//!         - path: /metrics
//!           verbs: [GET]
//! ```

pub mod access_control;
pub mod cert_manager;
pub mod config;
pub mod dynamic;
pub mod identity;

pub use access_control::{AuthorizationGate, PolicyDecision};
pub use cert_manager::{
    CaParams, CertGenerator, GeneratedCert, LeafCertParams, crypto_provider,
};
pub use config::{AuthorizationConfig, PROMETHEUS_K8S_IDENTITY, TlsConfig, TrustConfig};
pub use dynamic::{ClientAuthMode, ClientVerificationPolicy, DynamicTlsConfig, HandshakeConfig};
pub use identity::ClientIdentity;
