//! Server certificate/key pair watcher.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use rustls::InconsistentKeys;
use tracing::warn;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::mtls::cert_manager::{parse_certs, parse_private_key, read_file};
use crate::mtls::config::TlsConfig;
use crate::reload::{SnapshotLoader, SnapshotWatcher, SourceBytes};
use crate::telemetry;
use crate::{Error, Result};

/// Watches the server certificate chain and private key.
pub type CertificateWatcher = SnapshotWatcher<KeyPairLoader>;

/// An immutable, verified certificate/key pair.
///
/// The private key only lives inside the signing key of [`CertifiedKey`].
#[derive(Debug)]
pub struct KeyPairMaterial {
    certified_key: Arc<CertifiedKey>,
    subject: String,
    not_after: DateTime<Utc>,
    fingerprint: String,
    loaded_at: DateTime<Utc>,
}

impl KeyPairMaterial {
    /// Chain presented to clients, leaf first.
    #[must_use]
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.certified_key.cert
    }

    /// Signing key and chain for the rustls resolver.
    #[must_use]
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }

    /// Leaf subject DN.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Leaf `notAfter`.
    #[must_use]
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// SHA-256 over the certificate and key file contents.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// When this pair was loaded.
    #[must_use]
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

/// Loads [`KeyPairMaterial`] from a PEM certificate file and a PEM key file.
pub struct KeyPairLoader {
    cert_file: PathBuf,
    key_file: PathBuf,
    provider: Arc<CryptoProvider>,
}

impl KeyPairLoader {
    /// Loader for the files named in `config`.
    #[must_use]
    pub fn new(config: &TlsConfig, provider: Arc<CryptoProvider>) -> Self {
        Self {
            cert_file: config.cert_file.clone(),
            key_file: config.key_file.clone(),
            provider,
        }
    }

    fn origin(path: &Path) -> String {
        path.display().to_string()
    }
}

impl SnapshotLoader for KeyPairLoader {
    type Snapshot = KeyPairMaterial;
    const KIND: &'static str = "certificate";

    fn paths(&self) -> Vec<PathBuf> {
        vec![self.cert_file.clone(), self.key_file.clone()]
    }

    fn read(&self) -> Result<SourceBytes> {
        let cert = read_file(&self.cert_file)?;
        let key = read_file(&self.key_file)?;
        Ok(SourceBytes::new(vec![cert, key]))
    }

    fn parse(&self, source: &SourceBytes) -> Result<KeyPairMaterial> {
        let cert_origin = Self::origin(&self.cert_file);
        let key_origin = Self::origin(&self.key_file);

        let chain = parse_certs(Self::KIND, &cert_origin, &source.parts[0])?;
        let key_der = parse_private_key(&key_origin, &source.parts[1])?;

        let signing_key = self
            .provider
            .key_provider
            .load_private_key(key_der)
            .map_err(|e| Error::rotation("private-key", &key_origin, e))?;

        let certified_key = CertifiedKey::new(chain, signing_key);
        match certified_key.keys_match() {
            Ok(()) | Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {}
            Err(rustls::Error::InconsistentKeys(InconsistentKeys::KeyMismatch)) => {
                return Err(Error::KeyMismatch {
                    cert: cert_origin,
                    key: key_origin,
                });
            }
            Err(e) => return Err(Error::rotation(Self::KIND, &cert_origin, e)),
        }

        let (_, leaf) = X509Certificate::from_der(certified_key.cert[0].as_ref())
            .map_err(|e| Error::rotation(Self::KIND, &cert_origin, format!("bad leaf: {e}")))?;
        let subject = leaf.subject().to_string();
        let not_after = DateTime::from_timestamp(leaf.validity().not_after.timestamp(), 0)
            .ok_or_else(|| Error::rotation(Self::KIND, &cert_origin, "notAfter out of range"))?;

        if not_after < Utc::now() {
            warn!(path = %cert_origin, %subject, %not_after, "Server certificate has expired");
        }

        Ok(KeyPairMaterial {
            certified_key: Arc::new(certified_key),
            subject,
            not_after,
            fingerprint: source.fingerprint.clone(),
            loaded_at: Utc::now(),
        })
    }

    fn describe(&self, snapshot: &KeyPairMaterial) -> String {
        format!(
            "subject={} not_after={} chain_len={}",
            snapshot.subject,
            snapshot.not_after.to_rfc3339(),
            snapshot.chain().len()
        )
    }

    fn published(&self, snapshot: &KeyPairMaterial) {
        telemetry::set_server_cert_expiry(snapshot.not_after.timestamp());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtls::cert_manager::{CaParams, CertGenerator, GeneratedCert, LeafCertParams, crypto_provider};
    use crate::mtls::config::ReloadConfig;
    use crate::reload::ReloadOutcome;
    use std::time::Duration;

    fn ca() -> GeneratedCert {
        CertGenerator::init_ca(&CaParams {
            cn: "service-ca",
            validity_days: 30,
        })
        .unwrap()
    }

    fn server_cert(ca: &GeneratedCert, cn: &str) -> GeneratedCert {
        CertGenerator::issue_leaf(
            &LeafCertParams {
                cn,
                ou: None,
                san_dns: vec!["metrics.openshift-monitoring.svc".to_string()],
                san_uris: vec![],
                validity_days: 10,
            },
            &ca.cert_pem,
            &ca.key_pem,
        )
        .unwrap()
    }

    fn reload_cfg() -> ReloadConfig {
        ReloadConfig {
            pair_retry_attempts: 2,
            pair_retry_delay: Duration::from_millis(5),
            ..ReloadConfig::default()
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        tls: TlsConfig,
    }

    impl Fixture {
        fn new(pair: &GeneratedCert) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let tls = TlsConfig {
                cert_file: dir.path().join("tls.crt"),
                key_file: dir.path().join("tls.key"),
            };
            let f = Self { _dir: dir, tls };
            f.write(pair);
            f
        }

        fn write(&self, pair: &GeneratedCert) {
            std::fs::write(&self.tls.cert_file, &pair.cert_pem).unwrap();
            std::fs::write(&self.tls.key_file, &pair.key_pem).unwrap();
        }

        fn watcher(&self) -> Result<CertificateWatcher> {
            CertificateWatcher::load_initial(
                KeyPairLoader::new(&self.tls, crypto_provider()),
                &reload_cfg(),
            )
        }
    }

    #[test]
    fn loads_matching_pair() {
        // GIVEN: a CA-issued server pair on disk
        let ca = ca();
        let fx = Fixture::new(&server_cert(&ca, "metrics-server"));
        // WHEN: loading
        let w = fx.watcher().unwrap();
        // THEN: subject and expiry extracted
        let current = w.current();
        assert!(current.subject().contains("metrics-server"));
        assert!(current.not_after() > Utc::now());
        assert_eq!(current.chain().len(), 1);
        assert_eq!(current.fingerprint().len(), 64);
    }

    #[test]
    fn mismatched_pair_fails_startup() {
        let ca = ca();
        let a = server_cert(&ca, "a");
        let b = server_cert(&ca, "b");
        let fx = Fixture::new(&GeneratedCert {
            cert_pem: a.cert_pem,
            key_pem: b.key_pem,
        });

        let err = fx.watcher().err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn missing_key_fails_startup() {
        let ca = ca();
        let fx = Fixture::new(&server_cert(&ca, "a"));
        std::fs::remove_file(&fx.tls.key_file).unwrap();
        assert!(matches!(fx.watcher().err().unwrap(), Error::Config(_)));
    }

    #[tokio::test]
    async fn rotation_swaps_pair() {
        let ca = ca();
        let fx = Fixture::new(&server_cert(&ca, "old"));
        let w = fx.watcher().unwrap();

        fx.write(&server_cert(&ca, "new"));
        assert_eq!(w.reload().await, ReloadOutcome::Updated);
        assert!(w.current().subject().contains("new"));
    }

    #[tokio::test]
    async fn half_written_rotation_is_retried_and_rejected() {
        // GIVEN: serving "old"
        let ca = ca();
        let fx = Fixture::new(&server_cert(&ca, "old"));
        let w = fx.watcher().unwrap();

        // WHEN: only the certificate was replaced so far
        let next = server_cert(&ca, "new");
        std::fs::write(&fx.tls.cert_file, &next.cert_pem).unwrap();

        // THEN: the inconsistent pair is rejected and "old" kept
        assert_eq!(w.reload().await, ReloadOutcome::Rejected);
        assert!(w.current().subject().contains("old"));
        assert_eq!(w.error_streak(), 1);

        // WHEN: the key lands
        std::fs::write(&fx.tls.key_file, &next.key_pem).unwrap();
        // THEN: the next reload succeeds
        assert_eq!(w.reload().await, ReloadOutcome::Updated);
        assert!(w.current().subject().contains("new"));
        assert_eq!(w.error_streak(), 0);
    }

    #[tokio::test]
    async fn key_arriving_during_retry_window_is_accepted() {
        let ca = ca();
        let fx = Fixture::new(&server_cert(&ca, "old"));
        let w = Arc::new(
            CertificateWatcher::load_initial(
                KeyPairLoader::new(&fx.tls, crypto_provider()),
                &ReloadConfig {
                    pair_retry_attempts: 20,
                    pair_retry_delay: Duration::from_millis(25),
                    ..ReloadConfig::default()
                },
            )
            .unwrap(),
        );

        let next = server_cert(&ca, "new");
        std::fs::write(&fx.tls.cert_file, &next.cert_pem).unwrap();

        let key_file = fx.tls.key_file.clone();
        let key_pem = next.key_pem.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            let staged = key_file.with_extension("tmp");
            std::fs::write(&staged, key_pem).unwrap();
            std::fs::rename(staged, key_file).unwrap();
        });

        assert_eq!(w.reload().await, ReloadOutcome::Updated);
        writer.await.unwrap();
        assert!(w.current().subject().contains("new"));
    }

    #[tokio::test]
    async fn garbage_certificate_is_rejected() {
        let ca = ca();
        let fx = Fixture::new(&server_cert(&ca, "old"));
        let w = fx.watcher().unwrap();

        std::fs::write(&fx.tls.cert_file, "-----BEGIN CERTIFICATE-----\nzzz\n").unwrap();
        assert_eq!(w.reload().await, ReloadOutcome::Rejected);
        assert!(w.current().subject().contains("old"));
    }
}
