//! Client identity extraction.
//!
//! Parses the leaf of a peer certificate chain that rustls has already
//! verified and extracts the fields the authorization gate matches on:
//! Common Name, Organisational Unit, SAN DNS names and SAN URIs.

use rustls::pki_types::CertificateDer;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Client identity
// ─────────────────────────────────────────────────────────────────────────────

/// Identity of a client whose certificate chain passed verification.
///
/// Only built by [`ClientIdentity::from_verified_chain`], which the listener
/// calls after the handshake completed against the trust pool captured at
/// handshake start.  A chain that failed verification never reaches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    common_name: Option<String>,
    organizational_unit: Option<String>,
    san_dns_names: Vec<String>,
    san_uris: Vec<String>,
    verified_chain: bool,
    display_name: String,
}

impl ClientIdentity {
    /// Extract the identity from a verified peer chain (leaf first).
    pub(crate) fn from_verified_chain(chain: &[CertificateDer<'_>]) -> Result<Self> {
        let leaf = chain
            .first()
            .ok_or_else(|| Error::Internal("verified handshake without peer certificate".into()))?;
        let (_, cert) = X509Certificate::from_der(leaf.as_ref())
            .map_err(|e| Error::Internal(format!("Failed to parse client certificate: {e}")))?;

        let common_name = extract_cn(&cert);
        let organizational_unit = extract_ou(&cert);
        let (san_uris, san_dns_names) = extract_sans(&cert);
        let display_name = build_display_name(common_name.as_ref(), &san_uris);

        Ok(Self {
            common_name,
            organizational_unit,
            san_dns_names,
            san_uris,
            verified_chain: true,
            display_name,
        })
    }

    /// Certificate Common Name (CN).
    #[must_use]
    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    /// First Organisational Unit (OU) in the subject.
    #[must_use]
    pub fn organizational_unit(&self) -> Option<&str> {
        self.organizational_unit.as_deref()
    }

    /// Subject Alternative Name DNS entries.
    #[must_use]
    pub fn san_dns_names(&self) -> &[String] {
        &self.san_dns_names
    }

    /// Subject Alternative Name URI entries.
    #[must_use]
    pub fn san_uris(&self) -> &[String] {
        &self.san_uris
    }

    /// `true` when derived from a chain that passed verification.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.verified_chain
    }

    /// Human-readable label for logs.
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Every name this identity may be matched by: CN, then SANs.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.common_name
            .as_deref()
            .into_iter()
            .chain(self.san_dns_names.iter().map(String::as_str))
            .chain(self.san_uris.iter().map(String::as_str))
    }

    #[cfg(test)]
    pub(crate) fn for_test(cn: Option<&str>, san_dns: &[&str], san_uris: &[&str]) -> Self {
        let san_uris: Vec<String> = san_uris.iter().map(|s| (*s).to_owned()).collect();
        let common_name = cn.map(str::to_owned);
        Self {
            display_name: build_display_name(common_name.as_ref(), &san_uris),
            common_name,
            organizational_unit: None,
            san_dns_names: san_dns.iter().map(|s| (*s).to_owned()).collect(),
            san_uris,
            verified_chain: true,
        }
    }

    #[cfg(test)]
    pub(crate) fn unverified_for_test(cn: &str) -> Self {
        Self {
            verified_chain: false,
            ..Self::for_test(Some(cn), &[], &[])
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Extraction helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Extract the CN attribute from the subject DN.
fn extract_cn(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

/// Extract the first OU attribute from the subject DN.
fn extract_ou(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_organizational_unit()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

/// Extract SAN URI and SAN DNS entries from the certificate extensions.
fn extract_sans(cert: &X509Certificate<'_>) -> (Vec<String>, Vec<String>) {
    let mut uris = Vec::new();
    let mut dns_names = Vec::new();

    if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
        for name in &san_ext.value.general_names {
            match name {
                GeneralName::URI(uri) => uris.push((*uri).to_owned()),
                GeneralName::DNSName(dns) => dns_names.push((*dns).to_owned()),
                _ => {}
            }
        }
    }

    (uris, dns_names)
}

/// Prefers the CN (service-account identities live there), then a SPIFFE
/// URI, then `"<unknown>"`.
fn build_display_name(cn: Option<&String>, san_uris: &[String]) -> String {
    cn.map(String::as_str)
        .or_else(|| {
            san_uris
                .iter()
                .find(|u| u.starts_with("spiffe://"))
                .map(String::as_str)
        })
        .unwrap_or("<unknown>")
        .to_owned()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
