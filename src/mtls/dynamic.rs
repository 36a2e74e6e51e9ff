//! Per-handshake TLS configuration assembled from the live watchers.
//!
//! Nothing here is cached: every call reads the watchers' current snapshots,
//! so a rotation is visible to the very next handshake while handshakes
//! already in flight keep the snapshots they started with.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;

use super::cert_manager::crypto_provider;
use crate::config::Config;
use crate::reload::{
    CertificateWatcher, KeyPairLoader, KeyPairMaterial, TrustBundleLoader, TrustPool,
    TrustRootWatcher,
};
use crate::{Error, Result};

/// ALPN protocols offered, in preference order.
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// How client certificates are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuthMode {
    /// A client certificate must be presented and must chain to the pool.
    RequireAndVerify,
}

/// Trust pool plus the mode it is enforced with.
#[derive(Debug, Clone)]
pub struct ClientVerificationPolicy {
    /// Anchors the client chain is verified against.
    pub trust_pool: Arc<TrustPool>,
    /// Enforcement mode.
    pub mode: ClientAuthMode,
}

/// A rustls server config together with the snapshots it was built from.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Config handed to the acceptor.
    pub server_config: Arc<ServerConfig>,
    /// Server pair presented in this handshake.
    pub key_pair: Arc<KeyPairMaterial>,
    /// Pool client chains are verified against in this handshake.
    pub trust_pool: Arc<TrustPool>,
}

/// Composes the certificate and trust watchers into handshake configs.
pub struct DynamicTlsConfig {
    certificates: Arc<CertificateWatcher>,
    trust: Arc<TrustRootWatcher>,
    provider: Arc<CryptoProvider>,
}

impl DynamicTlsConfig {
    /// Combine the two watchers.
    #[must_use]
    pub fn new(
        certificates: Arc<CertificateWatcher>,
        trust: Arc<TrustRootWatcher>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            certificates,
            trust,
            provider,
        }
    }

    /// Load both watchers' initial snapshots from the configured files.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if either the pair or the trust pool cannot be loaded.
    pub fn from_config(config: &Config) -> Result<Self> {
        let provider = crypto_provider();
        let certificates = CertificateWatcher::load_initial(
            KeyPairLoader::new(&config.tls, Arc::clone(&provider)),
            &config.reload,
        )?;
        let trust = TrustRootWatcher::load_initial(
            TrustBundleLoader::new(&config.trust, Arc::clone(&provider)),
            &config.reload,
        )?;
        Ok(Self::new(Arc::new(certificates), Arc::new(trust), provider))
    }

    /// The current server certificate/key pair.
    #[must_use]
    pub fn certificate(&self) -> Arc<KeyPairMaterial> {
        self.certificates.current()
    }

    /// The current client verification policy.
    #[must_use]
    pub fn client_verification_policy(&self) -> ClientVerificationPolicy {
        ClientVerificationPolicy {
            trust_pool: self.trust.current(),
            mode: ClientAuthMode::RequireAndVerify,
        }
    }

    /// Build the config for one handshake.
    ///
    /// Takes exactly one snapshot of each watcher.
    pub fn handshake_config(&self) -> Result<HandshakeConfig> {
        let key_pair = self.certificate();
        let ClientVerificationPolicy { trust_pool, mode } = self.client_verification_policy();

        let verifier = match mode {
            ClientAuthMode::RequireAndVerify => trust_pool.verifier(),
        };

        let mut server_config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
            .map_err(|e| Error::Internal(format!("TLS protocol setup failed: {e}")))?
            .with_client_cert_verifier(verifier)
            .with_cert_resolver(Arc::new(PinnedCertResolver(key_pair.certified_key())));
        server_config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

        Ok(HandshakeConfig {
            server_config: Arc::new(server_config),
            key_pair,
            trust_pool,
        })
    }

    /// The certificate watcher.
    #[must_use]
    pub fn certificate_watcher(&self) -> &Arc<CertificateWatcher> {
        &self.certificates
    }

    /// The trust root watcher.
    #[must_use]
    pub fn trust_watcher(&self) -> &Arc<TrustRootWatcher> {
        &self.trust
    }
}

/// Always presents the pair captured when the handshake config was built.
struct PinnedCertResolver(Arc<CertifiedKey>);

impl std::fmt::Debug for PinnedCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedCertResolver")
            .field("chain_len", &self.0.cert.len())
            .finish()
    }
}

impl ResolvesServerCert for PinnedCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}
