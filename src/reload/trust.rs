//! Client CA trust bundle watcher.
//!
//! The bundle file is the single source of truth: every change rebuilds the
//! whole pool from scratch. Anchors are never merged with a previous pool, so
//! removing a CA from the bundle revokes it on the next handshake.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustls::RootCertStore;
use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::ClientCertVerifier;
use tracing::warn;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::mtls::cert_manager::{parse_certs, parse_crls, read_file};
use crate::mtls::config::TrustConfig;
use crate::reload::{SnapshotLoader, SnapshotWatcher, SourceBytes};
use crate::{Error, Result};

/// Watches the client CA bundle (and optional CRL).
pub type TrustRootWatcher = SnapshotWatcher<TrustBundleLoader>;

/// An immutable set of client trust anchors with its verifier.
#[derive(Debug)]
pub struct TrustPool {
    roots: Arc<RootCertStore>,
    subjects: Vec<String>,
    crl_count: usize,
    verifier: Arc<dyn ClientCertVerifier>,
    fingerprint: String,
    loaded_at: DateTime<Utc>,
}

impl TrustPool {
    /// Trust anchors.
    #[must_use]
    pub fn roots(&self) -> Arc<RootCertStore> {
        Arc::clone(&self.roots)
    }

    /// Number of anchors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Always `false`: empty bundles are rejected at load.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Subject DNs of the anchors, in bundle order.
    #[must_use]
    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }

    /// CRLs consulted during verification.
    #[must_use]
    pub fn crl_count(&self) -> usize {
        self.crl_count
    }

    /// Verifier that requires a client certificate chaining to these roots.
    #[must_use]
    pub fn verifier(&self) -> Arc<dyn ClientCertVerifier> {
        Arc::clone(&self.verifier)
    }

    /// SHA-256 over the bundle and CRL contents.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// When this pool was built.
    #[must_use]
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

/// Builds a [`TrustPool`] from a PEM bundle and an optional PEM CRL.
pub struct TrustBundleLoader {
    ca_bundle_file: PathBuf,
    crl_file: Option<PathBuf>,
    provider: Arc<CryptoProvider>,
}

impl TrustBundleLoader {
    /// Loader for the files named in `config`.
    #[must_use]
    pub fn new(config: &TrustConfig, provider: Arc<CryptoProvider>) -> Self {
        Self {
            ca_bundle_file: config.ca_bundle_file.clone(),
            crl_file: config.crl_file.clone(),
            provider,
        }
    }
}

impl SnapshotLoader for TrustBundleLoader {
    type Snapshot = TrustPool;
    const KIND: &'static str = "trust-bundle";

    fn paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.ca_bundle_file.clone()];
        paths.extend(self.crl_file.clone());
        paths
    }

    fn read(&self) -> Result<SourceBytes> {
        let bundle = read_file(&self.ca_bundle_file)?;
        let crl = match &self.crl_file {
            Some(path) => read_file(path)?,
            None => Vec::new(),
        };
        Ok(SourceBytes::new(vec![bundle, crl]))
    }

    fn parse(&self, source: &SourceBytes) -> Result<TrustPool> {
        let origin = self.ca_bundle_file.display().to_string();

        let certs = parse_certs(Self::KIND, &origin, &source.parts[0])?;

        let subjects = certs
            .iter()
            .filter_map(|der| X509Certificate::from_der(der.as_ref()).ok())
            .map(|(_, cert)| cert.subject().to_string())
            .collect();

        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(certs);
        if added == 0 {
            return Err(Error::rotation(Self::KIND, &origin, "no usable trust anchors"));
        }
        if ignored > 0 {
            warn!(path = %origin, ignored, "Skipped unusable certificates in trust bundle");
        }

        let crls = match &self.crl_file {
            Some(path) => parse_crls(&path.display().to_string(), &source.parts[1])?,
            None => Vec::new(),
        };
        let crl_count = crls.len();

        let roots = Arc::new(roots);
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::clone(&roots), Arc::clone(&self.provider))
                .with_crls(crls)
                .only_check_end_entity_revocation()
                .allow_unknown_revocation_status()
                .build()
                .map_err(|e| Error::rotation(Self::KIND, &origin, e))?;

        Ok(TrustPool {
            roots,
            subjects,
            crl_count,
            verifier,
            fingerprint: source.fingerprint.clone(),
            loaded_at: Utc::now(),
        })
    }

    fn describe(&self, snapshot: &TrustPool) -> String {
        format!(
            "anchors={} crls={} subjects=[{}]",
            snapshot.len(),
            snapshot.crl_count,
            snapshot.subjects.join("; ")
        )
    }
}
