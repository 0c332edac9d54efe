//! Process Lifecycle
//!
//! Opens the store, starts ingestion in the background and serves queries
//! in the foreground. Shutdown stops the subscriber before closing the
//! store; [`Lifecycle::shutdown`] consumes the lifecycle so it runs once.

use std::fmt;
use std::future::{self, Future};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::rate_limit::{governor_layer, RateLimitConfig};
use crate::{create_router, install_metrics, AppConfig, AppState};
use ingest::{IngestError, IngestFault, StopOutcome, Subscriber};
use storage::{ReadingStore, StoreError};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("Rate limit quota must be positive")]
    RateLimit,
    #[error("Server already served")]
    AlreadyServed,
    #[error("Server error: {0}")]
    Server(std::io::Error),
}

/// Why the query service stopped
#[derive(Debug)]
pub enum ShutdownReason {
    /// Ctrl-C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Caller-supplied stop future completed
    Requested,
    /// Ingestion can no longer make progress
    IngestFault(IngestFault),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Interrupt => write!(f, "interrupt"),
            ShutdownReason::Terminate => write!(f, "terminate"),
            ShutdownReason::Requested => write!(f, "requested"),
            ShutdownReason::IngestFault(fault) => write!(f, "ingest fault: {}", fault),
        }
    }
}

/// Running store, subscriber and bound listener
pub struct Lifecycle {
    config: AppConfig,
    store: ReadingStore,
    subscriber: Subscriber,
    state: Arc<AppState>,
    listener: Option<TcpListener>,
    faults: Option<mpsc::Receiver<IngestFault>>,
}

impl Lifecycle {
    /// Open the store, start the subscriber and bind the listener
    pub async fn start(config: AppConfig) -> Result<Self, LifecycleError> {
        let store = ReadingStore::open(&config.store_config()).await?;

        let mut subscriber = Subscriber::new(config.subscriber_config(), store.clone());
        let faults = subscriber.take_faults();
        if let Err(e) = subscriber.start_in_background() {
            store.close().await;
            return Err(e.into());
        }

        let addr = config.listen_addr();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                subscriber.stop().await;
                store.close().await;
                return Err(LifecycleError::Bind { addr, source });
            }
        };

        let state = AppState::new(store.clone(), subscriber.monitor(), config.freshness_window())
            .with_metrics(install_metrics());

        info!("Query service listening on {}", addr);
        Ok(Self {
            config,
            store,
            subscriber,
            state: Arc::new(state),
            listener: Some(listener),
            faults,
        })
    }

    /// Bound address, until [`serve`](Self::serve) takes the listener
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Serve until Ctrl-C, SIGTERM or an ingest fault
    pub async fn serve(&mut self) -> Result<ShutdownReason, LifecycleError> {
        self.serve_until(os_signal()).await
    }

    /// Serve until `stop` resolves or an ingest fault arrives
    pub async fn serve_until<F>(&mut self, stop: F) -> Result<ShutdownReason, LifecycleError>
    where
        F: Future<Output = ShutdownReason> + Send + 'static,
    {
        let listener = self.listener.take().ok_or(LifecycleError::AlreadyServed)?;

        let mut router = create_router(self.state.clone());
        if let Some(limits) = RateLimitConfig::from_app(&self.config) {
            let layer = governor_layer(&limits).ok_or(LifecycleError::RateLimit)?;
            info!(
                "Rate limiting enabled: 1 request per {}s, burst {}",
                limits.per_second, limits.burst_size
            );
            router = router.layer(layer);
        }

        let faults = self.faults.take();
        let (reason_tx, reason_rx) = oneshot::channel();
        let shutdown = async move {
            let reason = tokio::select! {
                reason = stop => reason,
                fault = next_fault(faults) => ShutdownReason::IngestFault(fault),
            };
            info!("Shutdown requested: {}", reason);
            let _ = reason_tx.send(reason);
        };

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(LifecycleError::Server)?;

        reason_rx
            .await
            .map_err(|_| LifecycleError::Server(std::io::ErrorKind::Interrupted.into()))
    }

    /// Stop ingestion, then close the store
    pub async fn shutdown(mut self) -> StopOutcome {
        let outcome = self.subscriber.stop().await;
        if outcome == StopOutcome::Ungraceful {
            warn!("UngracefulStop: subscriber aborted before draining");
        }
        self.store.close().await;
        info!("Shutdown complete");
        outcome
    }
}

async fn next_fault(faults: Option<mpsc::Receiver<IngestFault>>) -> IngestFault {
    if let Some(mut faults) = faults {
        if let Some(fault) = faults.recv().await {
            error!("Ingest fault: {}", fault);
            return fault;
        }
    }
    future::pending().await
}

async fn os_signal() -> ShutdownReason {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => ShutdownReason::Interrupt,
        _ = terminate => ShutdownReason::Terminate,
    }
}
