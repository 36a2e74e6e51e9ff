//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Self-reloading mutual-TLS HTTPS server for Prometheus metrics
#[derive(Parser, Debug)]
#[command(name = "mtls-metrics-server")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MTLS_METRICS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "MTLS_METRICS_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "MTLS_METRICS_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "MTLS_METRICS_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MTLS_METRICS_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the metrics server (default)
    Serve,

    /// Validate configuration and load the certificate pair and trust pool
    Check,

    /// Development certificate helpers
    #[command(subcommand)]
    Tls(TlsCommand),
}

/// Certificate helper subcommands
#[derive(Subcommand, Debug)]
pub enum TlsCommand {
    /// Generate a self-signed CA
    InitCa {
        /// Common Name of the CA
        #[arg(long, default_value = "mtls-metrics-dev-ca")]
        cn: String,

        /// Validity in days
        #[arg(long, default_value_t = 365)]
        days: u32,

        /// Output directory (writes `ca.crt` and `ca.key`)
        #[arg(short, long, default_value = "certs")]
        out: PathBuf,
    },

    /// Issue a server or client certificate signed by the CA
    Issue {
        /// Common Name (client identity, or server name)
        #[arg(long, required = true)]
        cn: String,

        /// Organizational Unit
        #[arg(long)]
        ou: Option<String>,

        /// DNS Subject Alternative Names (repeatable)
        #[arg(long = "san-dns")]
        san_dns: Vec<String>,

        /// URI Subject Alternative Names (repeatable)
        #[arg(long = "san-uri")]
        san_uris: Vec<String>,

        /// Validity in days
        #[arg(long, default_value_t = 90)]
        days: u32,

        /// CA certificate
        #[arg(long, default_value = "certs/ca.crt")]
        ca_cert: PathBuf,

        /// CA private key
        #[arg(long, default_value = "certs/ca.key")]
        ca_key: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = "certs")]
        out: PathBuf,

        /// File stem for `<name>.crt` / `<name>.key`
        #[arg(long, required = true)]
        name: String,
    },

    /// Write a CRL revoking the given certificates
    Crl {
        /// Certificates to revoke (PEM)
        #[arg(required = true)]
        revoke: Vec<PathBuf>,

        /// Validity of the CRL in days
        #[arg(long, default_value_t = 7)]
        days: u32,

        /// CA certificate
        #[arg(long, default_value = "certs/ca.crt")]
        ca_cert: PathBuf,

        /// CA private key
        #[arg(long, default_value = "certs/ca.key")]
        ca_key: PathBuf,

        /// Output file
        #[arg(short, long, default_value = "certs/ca.crl")]
        out: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["mtls-metrics-server", "--port", "9443"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(9443));
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn issue_collects_repeated_sans() {
        let cli = Cli::try_parse_from([
            "mtls-metrics-server",
            "tls",
            "issue",
            "--cn",
            "prometheus",
            "--name",
            "client",
            "--san-dns",
            "a.example",
            "--san-dns",
            "b.example",
        ])
        .unwrap();

        let Some(Command::Tls(TlsCommand::Issue { san_dns, days, .. })) = cli.command else {
            panic!("expected tls issue");
        };
        assert_eq!(san_dns, vec!["a.example", "b.example"]);
        assert_eq!(days, 90);
    }

    #[test]
    fn crl_requires_a_certificate() {
        assert!(Cli::try_parse_from(["mtls-metrics-server", "tls", "crl"]).is_err());
    }
}
