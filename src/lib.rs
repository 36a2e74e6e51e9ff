//! mTLS Metrics Server Library
//!
//! A self-reloading mutual-TLS HTTPS endpoint for Prometheus metrics.
//!
//! # Features
//!
//! - **Hot rotation**: server certificate/key and client CA bundle are re-read
//!   from disk without a restart; in-flight handshakes keep the material they
//!   started with
//! - **Client certificates required**: every connection is verified against the
//!   current trust pool (plus an optional CRL)
//! - **Identity allow-list**: only listed identities may use listed verbs on
//!   listed paths
//! - **Self-observability**: reload, handshake and authorization outcomes are
//!   exported on the same endpoint

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod mtls;
pub mod reload;
pub mod server;
pub mod telemetry;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber
                .with(fmt::layer().json())
                .try_init()
                .map_err(|e| Error::Internal(format!("Tracing setup failed: {e}")))?;
        }
        _ => {
            subscriber
                .with(fmt::layer())
                .try_init()
                .map_err(|e| Error::Internal(format!("Tracing setup failed: {e}")))?;
        }
    }

    Ok(())
}
