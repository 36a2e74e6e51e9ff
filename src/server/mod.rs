//! Mutual-TLS HTTPS listener.
//!
//! Every accepted TCP connection walks a small state machine:
//!
//! ```text
//! Listening → Handshaking → Authorized → Serving → Closed
//!                         ↘ Rejected ─────────────↗
//! ```
//!
//! The handshake uses the snapshots current when it *starts*; a rotation
//! racing with it affects only later handshakes. Connections that fail the
//! handshake see nothing but the TLS alert or a closed socket; the reason is
//! logged and counted here.

pub mod router;
pub mod source;

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use hyper::Request;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use parking_lot::Mutex;
use rustls::CertificateError;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, error, info, trace, warn};

use crate::config::ServerConfig;
use crate::mtls::{ClientIdentity, DynamicTlsConfig};
use crate::telemetry;
use crate::{Error, Result};

pub use router::{AppState, create_router};
pub use source::{MetricsSource, PrometheusSource};

// ============================================================================
// Connection state machine
// ============================================================================

/// Lifecycle of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted on the socket, nothing read yet.
    Listening,
    /// TLS handshake in progress.
    Handshaking,
    /// Handshake done and the client chain verified.
    Authorized,
    /// Handshake failed or the peer identity was unusable.
    Rejected,
    /// HTTP requests are being served.
    Serving,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Listening, Self::Handshaking)
                | (Self::Handshaking, Self::Authorized | Self::Rejected)
                | (Self::Authorized, Self::Serving)
                | (Self::Rejected | Self::Serving, Self::Closed)
        )
    }
}

/// Why a handshake was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Client presented no certificate.
    NoCertificate,
    /// Client chain does not lead to a trusted anchor.
    UntrustedIssuer,
    /// Client certificate expired (or is not yet valid).
    Expired,
    /// Client certificate revoked by the CRL.
    Revoked,
    /// Any other certificate validation failure.
    InvalidChain,
    /// TLS protocol failure unrelated to certificates.
    Protocol,
    /// Handshake did not finish in time.
    Timeout,
    /// Socket error during the handshake.
    Transport,
    /// Verified chain without a parseable leaf.
    Identity,
    /// No handshake configuration could be built.
    Unavailable,
}

impl RejectReason {
    /// Metric / log label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoCertificate => "no_certificate",
            Self::UntrustedIssuer => "untrusted_issuer",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::InvalidChain => "invalid_chain",
            Self::Protocol => "protocol",
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Identity => "identity",
            Self::Unavailable => "unavailable",
        }
    }

    /// Classify an acceptor error.
    #[must_use]
    pub fn classify(err: &io::Error) -> Self {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
            .map_or(Self::Transport, Self::from_tls)
    }

    fn from_tls(err: &rustls::Error) -> Self {
        match err {
            rustls::Error::NoCertificatesPresented => Self::NoCertificate,
            rustls::Error::InvalidCertificate(cert) => match cert {
                CertificateError::UnknownIssuer => Self::UntrustedIssuer,
                CertificateError::Expired
                | CertificateError::ExpiredContext { .. }
                | CertificateError::NotValidYet
                | CertificateError::NotValidYetContext { .. } => Self::Expired,
                CertificateError::Revoked => Self::Revoked,
                _ => Self::InvalidChain,
            },
            _ => Self::Protocol,
        }
    }

    /// Rejections that are mostly noise (probes, scanners, slow clients).
    fn is_quiet(self) -> bool {
        matches!(self, Self::Transport | Self::Timeout)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct ConnectionTracker {
    peer: SocketAddr,
    state: ConnectionState,
}

impl ConnectionTracker {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            state: ConnectionState::Listening,
        }
    }

    fn advance(&mut self, next: ConnectionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "illegal connection transition {:?} -> {next:?}",
                self.state
            )));
        }
        trace!(peer = %self.peer, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
        Ok(())
    }

    fn reject(&mut self, reason: RejectReason, detail: &dyn fmt::Display) -> Result<()> {
        self.advance(ConnectionState::Rejected)?;
        let err = Error::Handshake(reason);
        if reason.is_quiet() {
            debug!(peer = %self.peer, reason = reason.as_str(), detail = %detail, "{err}");
        } else {
            warn!(peer = %self.peer, reason = reason.as_str(), detail = %detail, "{err}");
        }
        telemetry::record_handshake(reason.as_str());
        self.advance(ConnectionState::Closed)
    }
}

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct ConnectionLimits {
    handshake_timeout: Duration,
    header_read_timeout: Duration,
    idle_timeout: Duration,
    max_connections: usize,
    shutdown_grace: Duration,
}

impl From<&ServerConfig> for ConnectionLimits {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            handshake_timeout: cfg.handshake_timeout,
            header_read_timeout: cfg.header_read_timeout,
            idle_timeout: cfg.idle_timeout,
            max_connections: cfg.max_connections,
            shutdown_grace: cfg.shutdown_grace,
        }
    }
}

struct ConnectionContext {
    tls: Arc<DynamicTlsConfig>,
    router: Router,
    limits: ConnectionLimits,
}

/// The HTTPS metrics endpoint.
pub struct MetricsServer {
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
}

impl MetricsServer {
    /// Bind the listening socket.
    pub async fn bind(
        config: &ServerConfig,
        tls: Arc<DynamicTlsConfig>,
        router: Router,
    ) -> Result<Self> {
        let ip: IpAddr = config
            .host
            .parse()
            .map_err(|e| Error::Config(format!("Invalid host '{}': {e}", config.host)))?;
        let addr = SocketAddr::new(ip, config.port);
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            Error::Io(io::Error::new(e.kind(), format!("Cannot bind {addr}: {e}")))
        })?;

        Ok(Self {
            listener,
            ctx: Arc::new(ConnectionContext {
                tls,
                router,
                limits: ConnectionLimits::from(config),
            }),
        })
    }

    /// The bound address (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and serve connections until `shutdown_rx` fires, then drain.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let limits = self.ctx.limits;
        let permits = Arc::new(Semaphore::new(limits.max_connections));
        let (drain_tx, _) = watch::channel(false);
        let mut connections = JoinSet::new();

        info!(
            addr = %self.local_addr()?,
            max_connections = limits.max_connections,
            "mTLS metrics server listening"
        );

        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => permit
                    .map_err(|e| Error::Internal(format!("Connection limiter closed: {e}")))?,
                _ = shutdown_rx.recv() => break,
            };

            let (tcp, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
                _ = shutdown_rx.recv() => break,
            };

            while connections.try_join_next().is_some() {}

            let ctx = Arc::clone(&self.ctx);
            let drain_rx = drain_tx.subscribe();
            connections.spawn(async move {
                let _permit = permit;
                if let Err(e) = serve_connection(ctx, tcp, peer, drain_rx).await {
                    error!(%peer, error = %e, "Connection handling failed");
                }
            });
        }

        info!(open = connections.len(), "Stopped accepting, draining connections");
        let _ = drain_tx.send(true);

        let drained = tokio::time::timeout(limits.shutdown_grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "Shutdown grace period elapsed, aborting connections"
            );
            connections.abort_all();
        }

        info!("mTLS metrics server stopped");
        Ok(())
    }
}

/// Request activity on one connection.
#[derive(Clone)]
struct IdleTracker(Arc<Mutex<IdleState>>);

struct IdleState {
    in_flight: usize,
    last_activity: Instant,
}

/// Marks one request in flight until dropped.
struct InFlight(IdleTracker);

impl IdleTracker {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(IdleState {
            in_flight: 0,
            last_activity: Instant::now(),
        })))
    }

    fn begin(&self) -> InFlight {
        let mut state = self.0.lock();
        state.in_flight += 1;
        state.last_activity = Instant::now();
        InFlight(self.clone())
    }

    /// `None` while a request is in flight.
    fn idle_for(&self) -> Option<Duration> {
        let state = self.0.lock();
        (state.in_flight == 0).then(|| state.last_activity.elapsed())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut state = (self.0).0.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.last_activity = Instant::now();
    }
}

fn idle_check_period(idle_timeout: Duration) -> Duration {
    (idle_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1))
}

async fn serve_connection(
    ctx: Arc<ConnectionContext>,
    tcp: TcpStream,
    peer: SocketAddr,
    mut drain_rx: watch::Receiver<bool>,
) -> Result<()> {
    let mut conn = ConnectionTracker::new(peer);
    let _ = tcp.set_nodelay(true);
    conn.advance(ConnectionState::Handshaking)?;

    let handshake = match ctx.tls.handshake_config() {
        Ok(handshake) => handshake,
        Err(e) => return conn.reject(RejectReason::Unavailable, &e),
    };

    let acceptor = TlsAcceptor::from(Arc::clone(&handshake.server_config));
    let stream = match tokio::time::timeout(ctx.limits.handshake_timeout, acceptor.accept(tcp)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return conn.reject(RejectReason::classify(&e), &e),
        Err(_) => return conn.reject(RejectReason::Timeout, &"handshake timed out"),
    };

    let identity = match stream
        .get_ref()
        .1
        .peer_certificates()
        .map(ClientIdentity::from_verified_chain)
    {
        Some(Ok(identity)) => identity,
        Some(Err(e)) => return conn.reject(RejectReason::Identity, &e),
        None => return conn.reject(RejectReason::NoCertificate, &"no peer certificate"),
    };

    conn.advance(ConnectionState::Authorized)?;
    telemetry::record_handshake("accepted");
    debug!(
        %peer,
        identity = %identity.display_name(),
        server_subject = %handshake.key_pair.subject(),
        trust_anchors = handshake.trust_pool.len(),
        "Client authenticated"
    );

    conn.advance(ConnectionState::Serving)?;
    let router = ctx.router.clone();
    let activity = IdleTracker::new();
    let service_activity = activity.clone();
    let service = service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(identity.clone());
        let in_flight = service_activity.begin();
        let response = router.clone().oneshot(request);
        async move {
            let response = response.await;
            drop(in_flight);
            response
        }
    });

    let limits = ctx.limits;
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(limits.header_read_timeout);
    builder
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(limits.idle_timeout)
        .keep_alive_timeout(limits.header_read_timeout);

    let connection = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let mut idle_check = tokio::time::interval(idle_check_period(limits.idle_timeout));
    idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut draining = false;
    let mut close_deadline: Option<Instant> = None;
    let result = loop {
        tokio::select! {
            res = connection.as_mut() => break res,
            Ok(()) = drain_rx.changed(), if !draining => {
                draining = true;
                connection.as_mut().graceful_shutdown();
            }
            _ = idle_check.tick() => {
                if close_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    debug!(%peer, "Idle connection did not close in time, dropping");
                    break Ok(());
                }
                if !draining && activity.idle_for().is_some_and(|idle| idle >= limits.idle_timeout) {
                    debug!(%peer, idle_timeout = ?limits.idle_timeout, "Closing idle connection");
                    draining = true;
                    close_deadline = Some(Instant::now() + limits.shutdown_grace);
                    connection.as_mut().graceful_shutdown();
                }
            }
        }
    };

    if let Err(e) = result {
        debug!(%peer, error = %e, "Connection closed with error");
    }
    conn.advance(ConnectionState::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tls_io_error(err: rustls::Error) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }

    #[test]
    fn idle_tracker_is_not_idle_while_a_request_is_in_flight() {
        // GIVEN: one request in flight
        let tracker = IdleTracker::new();
        let request = tracker.begin();
        // THEN: never idle
        assert!(tracker.idle_for().is_none());

        // WHEN: it completes
        drop(request);
        // THEN: the idle clock restarts from the completion
        let idle = tracker.idle_for().unwrap();
        assert!(idle < Duration::from_secs(1));
    }

    #[test]
    fn overlapping_requests_keep_connection_busy() {
        let tracker = IdleTracker::new();
        let first = tracker.begin();
        let second = tracker.begin();
        drop(first);
        assert!(tracker.idle_for().is_none());
        drop(second);
        assert!(tracker.idle_for().is_some());
    }

    #[test]
    fn idle_check_period_is_bounded() {
        assert_eq!(idle_check_period(Duration::from_millis(8)), Duration::from_millis(10));
        assert_eq!(idle_check_period(Duration::from_millis(400)), Duration::from_millis(100));
        assert_eq!(idle_check_period(Duration::from_secs(60)), Duration::from_secs(1));
    }

    #[test]
    fn legal_path_through_state_machine() {
        use ConnectionState::*;
        assert!(Listening.can_transition_to(Handshaking));
        assert!(Handshaking.can_transition_to(Authorized));
        assert!(Handshaking.can_transition_to(Rejected));
        assert!(Authorized.can_transition_to(Serving));
        assert!(Serving.can_transition_to(Closed));
        assert!(Rejected.can_transition_to(Closed));
    }

    #[test]
    fn illegal_transitions_are_refused() {
        use ConnectionState::*;
        assert!(!Listening.can_transition_to(Serving));
        assert!(!Rejected.can_transition_to(Serving));
        assert!(!Handshaking.can_transition_to(Serving));
        assert!(!Closed.can_transition_to(Listening));
        assert!(!Authorized.can_transition_to(Rejected));
    }

    #[test]
    fn tracker_rejects_skipping_the_handshake() {
        let mut conn = ConnectionTracker::new("127.0.0.1:1".parse().unwrap());
        assert!(conn.advance(ConnectionState::Serving).is_err());
        assert_eq!(conn.state, ConnectionState::Listening);
    }

    #[test]
    fn reject_ends_closed() {
        let mut conn = ConnectionTracker::new("127.0.0.1:1".parse().unwrap());
        conn.advance(ConnectionState::Handshaking).unwrap();
        conn.reject(RejectReason::Timeout, &"slow").unwrap();
        assert_eq!(conn.state, ConnectionState::Closed);
    }

    #[test]
    fn classifies_certificate_failures() {
        let cases = [
            (rustls::Error::NoCertificatesPresented, RejectReason::NoCertificate),
            (
                rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer),
                RejectReason::UntrustedIssuer,
            ),
            (
                rustls::Error::InvalidCertificate(CertificateError::Expired),
                RejectReason::Expired,
            ),
            (
                rustls::Error::InvalidCertificate(CertificateError::Revoked),
                RejectReason::Revoked,
            ),
            (
                rustls::Error::InvalidCertificate(CertificateError::BadSignature),
                RejectReason::InvalidChain,
            ),
            (
                rustls::Error::General("boom".into()),
                RejectReason::Protocol,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(RejectReason::classify(&tls_io_error(err)), expected);
        }
    }

    #[test]
    fn plain_io_error_is_transport() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(RejectReason::classify(&err), RejectReason::Transport);
    }

    #[test]
    fn reject_reason_labels_are_snake_case() {
        assert_eq!(RejectReason::UntrustedIssuer.to_string(), "untrusted_issuer");
        assert_eq!(RejectReason::NoCertificate.as_str(), "no_certificate");
    }
}
