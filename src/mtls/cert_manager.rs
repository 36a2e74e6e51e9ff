//! Certificate management. PEM parsing, file loading, and CLI helpers.
//!
//! Provides:
//! - [`parse_certs`] / [`parse_private_key`] / [`parse_crls`]: PEM decoding
//!   of already-read bytes, used by the reload watchers
//! - [`read_file`]: file reads that keep the IO error kind
//! - [`CertGenerator`]: `rcgen`-backed CA, leaf and CRL generation for the
//!   `mtls-metrics-server tls` CLI commands and tests
//!
//! # File format
//!
//! All certificate and key files are expected in **PEM format**.  DER is not
//! supported; the service CA, cert-manager and openssl all emit PEM.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, DistinguishedName,
    DnType, IsCa, Issuer, KeyIdMethod, KeyPair, KeyUsagePurpose, RevocationReason,
    RevokedCertParams, SanType, SerialNumber, date_time_ymd,
};
use rcgen::string::Ia5String;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Public: crypto provider
// ─────────────────────────────────────────────────────────────────────────────

/// The crypto provider every server config, verifier and signing key uses.
#[must_use]
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: PEM parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Decode every `CERTIFICATE` block in `pem`.
///
/// `kind` and `origin` only label the error.
///
/// # Errors
///
/// Returns [`Error::RotationParse`] on malformed PEM or when no certificate
/// block is present.
pub fn parse_certs(
    kind: &'static str,
    origin: &str,
    pem: &[u8],
) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::rotation(kind, origin, format!("malformed PEM: {e}")))?;

    if certs.is_empty() {
        return Err(Error::rotation(kind, origin, "no certificates found"));
    }

    Ok(certs)
}

/// Decode the first private key in `pem`.
///
/// Supports PKCS#1 (`RSA PRIVATE KEY`), PKCS#8 (`PRIVATE KEY`) and SEC1
/// (`EC PRIVATE KEY`).
pub fn parse_private_key(origin: &str, pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| Error::rotation("private-key", origin, format!("no usable private key: {e}")))
}

/// Decode every `X509 CRL` block in `pem`.  An empty file yields no CRLs.
pub fn parse_crls(
    origin: &str,
    pem: &[u8],
) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    CertificateRevocationListDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::rotation("crl", origin, format!("malformed PEM: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: file reads
// ─────────────────────────────────────────────────────────────────────────────

/// Read a file, keeping the IO error kind so callers can tell a briefly
/// missing file from a broken one.
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| {
        Error::Io(io::Error::new(
            e.kind(),
            format!("Cannot read '{}': {e}", path.display()),
        ))
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: certificate generation (CLI helpers)
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters for generating a CA certificate.
#[derive(Debug)]
pub struct CaParams<'a> {
    /// Common Name for the root CA (e.g. `"metrics-client-ca"`).
    pub cn: &'a str,
    /// Validity period in days.
    pub validity_days: u32,
}

/// Parameters for generating a leaf certificate (server or client).
#[derive(Debug)]
pub struct LeafCertParams<'a> {
    /// Common Name.
    pub cn: &'a str,
    /// Organisational Unit (optional).
    pub ou: Option<&'a str>,
    /// Subject Alternative Names: DNS entries.
    pub san_dns: Vec<String>,
    /// Subject Alternative Names: URI entries (e.g. SPIFFE IDs).
    pub san_uris: Vec<String>,
    /// Validity period in days.
    pub validity_days: u32,
}

/// Generated certificate and key pair in PEM format.
#[derive(Debug, Clone)]
pub struct GeneratedCert {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

/// Certificate generator backed by `rcgen`.
///
/// Produces CA and leaf certificates for development clusters and tests
/// without requiring `openssl`.
pub struct CertGenerator;

impl CertGenerator {
    /// Generate a self-signed CA certificate.
    pub fn init_ca(params: &CaParams<'_>) -> Result<GeneratedCert> {
        let key_pair = KeyPair::generate()
            .map_err(|e| Error::Config(format!("Failed to generate CA key: {e}")))?;

        let mut ca_params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, params.cn);
        ca_params.distinguished_name = dn;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        ca_params.not_after = validity_to_date(params.validity_days)?;

        let ca_cert = ca_params
            .self_signed(&key_pair)
            .map_err(|e| Error::Config(format!("CA cert generation failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: ca_cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Issue a leaf certificate signed by `ca_cert_pem` / `ca_key_pem`.
    pub fn issue_leaf(
        params: &LeafCertParams<'_>,
        ca_cert_pem: &str,
        ca_key_pem: &str,
    ) -> Result<GeneratedCert> {
        let ca_key = KeyPair::from_pem(ca_key_pem)
            .map_err(|e| Error::Config(format!("Failed to parse CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, ca_key)
            .map_err(|e| Error::Config(format!("Failed to parse CA cert: {e}")))?;

        let leaf_key = KeyPair::generate()
            .map_err(|e| Error::Config(format!("Failed to generate leaf key: {e}")))?;

        let mut leaf_params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, params.cn);
        if let Some(ou) = params.ou {
            dn.push(DnType::OrganizationalUnitName, ou);
        }
        leaf_params.distinguished_name = dn;
        leaf_params.not_after = validity_to_date(params.validity_days)?;

        let mut sans: Vec<SanType> = Vec::new();
        for dns in &params.san_dns {
            let ia5 = Ia5String::try_from(dns.as_str())
                .map_err(|e| Error::Config(format!("Invalid DNS SAN '{dns}': {e}")))?;
            sans.push(SanType::DnsName(ia5));
        }
        for uri in &params.san_uris {
            let ia5 = Ia5String::try_from(uri.as_str())
                .map_err(|e| Error::Config(format!("Invalid URI SAN '{uri}': {e}")))?;
            sans.push(SanType::URI(ia5));
        }
        leaf_params.subject_alt_names = sans;

        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &issuer)
            .map_err(|e| Error::Config(format!("Leaf cert signing failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: leaf_cert.pem(),
            key_pem: leaf_key.serialize_pem(),
        })
    }

    /// Issue a PEM CRL, signed by the CA, revoking every certificate in
    /// `revoked_pems`.
    pub fn issue_crl(
        ca_cert_pem: &str,
        ca_key_pem: &str,
        revoked_pems: &[&str],
        validity_days: u32,
    ) -> Result<String> {
        let ca_key = KeyPair::from_pem(ca_key_pem)
            .map_err(|e| Error::Config(format!("Failed to parse CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, ca_key)
            .map_err(|e| Error::Config(format!("Failed to parse CA cert: {e}")))?;

        let today = validity_to_date(0)?;
        let mut revoked_certs = Vec::with_capacity(revoked_pems.len());
        for pem in revoked_pems {
            for der in parse_certs("certificate", "revoked", pem.as_bytes())? {
                let (_, cert) = X509Certificate::from_der(der.as_ref())
                    .map_err(|e| Error::Config(format!("Failed to parse revoked cert: {e}")))?;
                revoked_certs.push(RevokedCertParams {
                    serial_number: SerialNumber::from_slice(cert.raw_serial()),
                    revocation_time: today,
                    reason_code: Some(RevocationReason::KeyCompromise),
                    invalidity_date: None,
                });
            }
        }

        let params = CertificateRevocationListParams {
            this_update: today,
            next_update: validity_to_date(validity_days)?,
            crl_number: SerialNumber::from(1u64),
            issuing_distribution_point: None,
            revoked_certs,
            key_identifier_method: KeyIdMethod::Sha256,
        };

        params
            .signed_by(&issuer)
            .and_then(|crl| crl.pem())
            .map_err(|e| Error::Config(format!("CRL signing failed: {e}")))
    }

    /// Write a [`GeneratedCert`] to disk as `<stem>.crt` and `<stem>.key`.
    pub fn write_to_dir(cert: &GeneratedCert, dir: &Path, stem: &str) -> Result<()> {
        fs::create_dir_all(dir)
            .map_err(|e| Error::Config(format!("Cannot create dir '{}': {e}", dir.display())))?;

        fs::write(dir.join(format!("{stem}.crt")), &cert.cert_pem)
            .map_err(|e| Error::Config(format!("Cannot write cert: {e}")))?;

        fs::write(dir.join(format!("{stem}.key")), &cert.key_pem)
            .map_err(|e| Error::Config(format!("Cannot write key: {e}")))?;

        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Convert a validity period (days) into a future date for `rcgen`.
fn validity_to_date(days: u32) -> Result<time::OffsetDateTime> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Config(format!("System time error: {e}")))?
        .as_secs();

    let future_secs = now_secs.saturating_add(u64::from(days) * 86_400);

    let dt = time::OffsetDateTime::from_unix_timestamp(
        i64::try_from(future_secs).unwrap_or(i64::MAX),
    )
    .map_err(|e| Error::Config(format!("Date calculation error: {e}")))?;

    Ok(date_time_ymd(dt.year(), dt.month() as u8, dt.day()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
