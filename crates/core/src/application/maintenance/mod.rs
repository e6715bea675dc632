// Maintenance Service
// Scheduled store maintenance: job GC, posting history pruning, VACUUM

use crate::application::worker::ShutdownToken;
use crate::error::Result;
use crate::port::{Maintenance, MaintenanceConfig, MaintenanceStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};

/// Maintenance scheduler
///
/// Runs periodic maintenance operations in the background
pub struct MaintenanceScheduler {
    maintenance: Arc<dyn Maintenance>,
    config: MaintenanceConfig,
    period: Duration,
}

impl MaintenanceScheduler {
    /// Create a new maintenance scheduler
    ///
    /// # Arguments
    /// * `maintenance` - Maintenance implementation
    /// * `config` - Retention and size thresholds
    /// * `interval_hours` - How often to run maintenance (hours)
    pub fn new(
        maintenance: Arc<dyn Maintenance>,
        config: MaintenanceConfig,
        interval_hours: u64,
    ) -> Self {
        Self::with_period(
            maintenance,
            config,
            Duration::from_secs(interval_hours.max(1) * 3600),
        )
    }

    pub fn with_period(
        maintenance: Arc<dyn Maintenance>,
        config: MaintenanceConfig,
        period: Duration,
    ) -> Self {
        Self {
            maintenance,
            config,
            period,
        }
    }

    /// Run maintenance loop until shutdown
    ///
    /// The first pass runs immediately. Should be spawned in tokio::spawn
    pub async fn run(self, mut shutdown: ShutdownToken) {
        info!(
            period_secs = self.period.as_secs(),
            job_retention_days = self.config.finished_job_retention_days,
            history_retention_days = self.config.posting_history_retention_days,
            "Maintenance scheduler started"
        );

        let mut tick = interval(self.period);

        loop {
            tokio::select! {
                _ = tick.tick() => {},
                _ = shutdown.wait() => break,
            }

            match self.maintenance.run_full_maintenance(&self.config).await {
                Ok(stats) => {
                    info!(
                        db_size_mb = stats.db_size_mb,
                        job_count = stats.job_count,
                        finished_jobs = stats.finished_job_count,
                        posting_history = stats.posting_history_count,
                        "Scheduled maintenance completed"
                    );
                }
                Err(e) => {
                    error!(error = ?e, "Scheduled maintenance failed");
                }
            }
        }

        info!("Maintenance scheduler stopped");
    }

    /// Run maintenance immediately (for manual trigger)
    pub async fn run_now(&self) -> Result<MaintenanceStats> {
        info!("Running manual maintenance...");

        let stats = self.maintenance.run_full_maintenance(&self.config).await?;

        info!(
            db_size_mb = stats.db_size_mb,
            job_count = stats.job_count,
            "Manual maintenance completed"
        );

        Ok(stats)
    }
}
