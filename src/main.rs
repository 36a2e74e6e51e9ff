//! mTLS Metrics Server - self-reloading mutual-TLS HTTPS metrics endpoint

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

use mtls_metrics_server::{
    Error, Result,
    cli::{Cli, Command, TlsCommand},
    config::Config,
    mtls::{AuthorizationGate, CaParams, CertGenerator, DynamicTlsConfig, LeafCertParams},
    reload::source,
    server::{AppState, MetricsServer, MetricsSource, PrometheusSource, create_router},
    setup_tracing, telemetry,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    // Handle subcommands
    let result = match cli.command {
        Some(Command::Tls(ref tls_cmd)) => run_tls_command(tls_cmd),
        Some(Command::Check) => run_check(&cli),
        Some(Command::Serve) | None => run_server(&cli).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Validate configuration and the on-disk material without serving
fn run_check(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let tls = DynamicTlsConfig::from_config(&config)?;
    let gate = AuthorizationGate::from_config(&config.authorization);

    let pair = tls.certificate();
    let pool = tls.client_verification_policy().trust_pool;

    println!("✅ Configuration valid");
    println!("   Listen:      {}:{}{}", config.server.host, config.server.port, config.server.metrics_path);
    println!("   Certificate: {} (expires {})", pair.subject(), pair.not_after().to_rfc3339());
    println!("   Trust pool:  {} anchor(s), {} CRL(s)", pool.len(), pool.crl_count());
    for subject in pool.subjects() {
        println!("     - {subject}");
    }
    if config.authorization.enabled {
        println!("   Allow-list:  {} identit(ies)", gate.identity_count());
    } else {
        println!("   Allow-list:  disabled (any verified client)");
    }
    Ok(())
}

/// Run the metrics server
async fn run_server(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        metrics_path = %config.server.metrics_path,
        reload_mode = ?config.reload.mode,
        "Starting mTLS metrics server"
    );

    let handle = telemetry::init_metrics_recorder().map_err(Error::Internal)?;
    let metrics_source: Arc<dyn MetricsSource> = Arc::new(PrometheusSource::new(handle));

    let tls = Arc::new(DynamicTlsConfig::from_config(&config)?);
    let state = AppState {
        gate: Arc::new(AuthorizationGate::from_config(&config.authorization)),
        source: metrics_source,
    };
    let router = create_router(&config.server.metrics_path, state);
    let server = MetricsServer::bind(&config.server, Arc::clone(&tls), router).await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let cert_watch = tls
        .certificate_watcher()
        .spawn(source::from_config(&config.reload), shutdown_tx.subscribe())?;
    let trust_watch = tls
        .trust_watcher()
        .spawn(source::from_config(&config.reload), shutdown_tx.subscribe())?;

    tokio::spawn(shutdown_signal(shutdown_tx.clone()));

    // Run with graceful shutdown
    let served = server.run(shutdown_tx.subscribe()).await;

    // Stop the watchers even if the listener failed
    let _ = shutdown_tx.send(());
    cert_watch.join().await;
    trust_watch.join().await;

    served?;
    info!("Server shutdown complete");
    Ok(())
}

/// Run certificate helper commands
fn run_tls_command(cmd: &TlsCommand) -> Result<()> {
    match cmd {
        TlsCommand::InitCa { cn, days, out } => {
            let ca = CertGenerator::init_ca(&CaParams {
                cn,
                validity_days: *days,
            })?;
            CertGenerator::write_to_dir(&ca, out, "ca")?;
            println!("✅ CA written to {}", out.join("ca.crt").display());
            println!("   Private key: {}", out.join("ca.key").display());
        }

        TlsCommand::Issue {
            cn,
            ou,
            san_dns,
            san_uris,
            days,
            ca_cert,
            ca_key,
            out,
            name,
        } => {
            let leaf = CertGenerator::issue_leaf(
                &LeafCertParams {
                    cn,
                    ou: ou.as_deref(),
                    san_dns: san_dns.clone(),
                    san_uris: san_uris.clone(),
                    validity_days: *days,
                },
                &read_pem(ca_cert)?,
                &read_pem(ca_key)?,
            )?;
            CertGenerator::write_to_dir(&leaf, out, name)?;
            println!("✅ Issued '{cn}' → {}", out.join(format!("{name}.crt")).display());
        }

        TlsCommand::Crl {
            revoke,
            days,
            ca_cert,
            ca_key,
            out,
        } => {
            let revoked = revoke.iter().map(|p| read_pem(p)).collect::<Result<Vec<_>>>()?;
            let revoked_refs: Vec<&str> = revoked.iter().map(String::as_str).collect();
            let crl = CertGenerator::issue_crl(
                &read_pem(ca_cert)?,
                &read_pem(ca_key)?,
                &revoked_refs,
                *days,
            )?;
            std::fs::write(out, crl)
                .map_err(|e| Error::Config(format!("Cannot write '{}': {e}", out.display())))?;
            println!("✅ CRL revoking {} certificate(s) → {}", revoke.len(), out.display());
        }
    }
    Ok(())
}

fn read_pem(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Cannot read '{}': {e}", path.display())))
}

async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
