use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::error::CoordinatorError;
use crate::models::ReapSummary;
use crate::services::coordinator::BookingCoordinator;

/// Periodic sweep that expires sessions past their deadline and purges
/// terminal sessions whose audit retention has run out.
#[derive(Clone)]
pub struct SessionReaper {
    coordinator: Arc<BookingCoordinator>,
    interval: Duration,
    is_shutdown: Arc<RwLock<bool>>,
}

impl SessionReaper {
    pub fn new(coordinator: Arc<BookingCoordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
            is_shutdown: Arc::new(RwLock::new(false)),
        }
    }

    #[instrument(skip(self))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ReapSummary, CoordinatorError> {
        let store = self.coordinator.store();
        let mut summary = ReapSummary::default();

        for session in store.list_expired(now).await? {
            let session_key = session.session_key.clone();
            match self.coordinator.expire_session(session, now).await {
                Ok(true) => {
                    info!("Expired session {}", session_key);
                    summary.expired += 1;
                }
                Ok(false) => debug!("Session {} was handled before the reaper got to it", session_key),
                Err(e) => warn!("Failed to expire session {}: {}", session_key, e),
            }
        }

        summary.purged = store.purge_terminal(now).await?;

        if summary.expired > 0 || summary.purged > 0 {
            info!(
                "Reaper pass: {} expired, {} purged",
                summary.expired, summary.purged
            );
        }

        Ok(summary)
    }

    /// Tick until `shutdown` is called.
    pub async fn start(&self) {
        info!("Starting session reaper, interval {:?}", self.interval);
        let mut interval = tokio::time::interval(self.interval);

        loop {
            interval.tick().await;

            if *self.is_shutdown.read().await {
                break;
            }

            if let Err(e) = self.run_once(Utc::now()).await {
                error!("Reaper pass failed: {}", e);
            }
        }

        info!("Session reaper stopped");
    }

    pub async fn shutdown(&self) {
        let mut is_shutdown = self.is_shutdown.write().await;
        *is_shutdown = true;
    }
}
