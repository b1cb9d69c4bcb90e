//! Background reconciliation of orphaned analysis tasks.
//!
//! A task can get stuck RUNNING (worker died mid-dispatch, process restart)
//! or PENDING (submitted, never picked up). The sweep cancels both classes
//! once they predate an absolute timeout AND a grace period; the double
//! condition keeps tasks created moments before a restart from being
//! misclassified as stuck. Reclamation is a single UPDATE per class, so two
//! sweeps running concurrently cannot double-reclaim, and no result
//! artifacts are ever deleted.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::DbHandle;

#[derive(Debug, Clone, Copy)]
pub struct SweepConfig {
    pub interval: Duration,
    pub running_timeout: Duration,
    pub pending_timeout: Duration,
    pub grace_period: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            running_timeout: Duration::from_secs(2 * 3600),
            pending_timeout: Duration::from_secs(4 * 3600),
            grace_period: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SweepReport {
    pub running_reclaimed: usize,
    pub pending_reclaimed: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.running_reclaimed + self.pending_reclaimed
    }
}

pub struct MaintenanceSweep {
    db: DbHandle,
    config: SweepConfig,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceSweep {
    pub fn new(db: DbHandle, config: SweepConfig) -> Self {
        Self {
            db,
            config,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    /// One reclamation pass at the current time.
    pub async fn run_once(&self) -> Result<SweepReport> {
        Self::sweep_at(&self.db, &self.config, Utc::now()).await
    }

    /// One reclamation pass evaluated against an explicit `now`.
    pub async fn sweep_at(
        db: &DbHandle,
        config: &SweepConfig,
        now: DateTime<Utc>,
    ) -> Result<SweepReport> {
        let grace_cutoff = cutoff(now, config.grace_period)?;
        let running_cutoff = cutoff(now, config.running_timeout)?;
        let pending_cutoff = cutoff(now, config.pending_timeout)?;
        let running_error = format!(
            "Cancelled by maintenance sweep: running longer than {}s",
            config.running_timeout.as_secs()
        );
        let pending_error = format!(
            "Cancelled by maintenance sweep: pending longer than {}s",
            config.pending_timeout.as_secs()
        );

        db.call(move |db| {
            let running_reclaimed =
                db.reclaim_running_tasks(&running_cutoff, &grace_cutoff, &running_error)?;
            let pending_reclaimed =
                db.reclaim_pending_tasks(&pending_cutoff, &grace_cutoff, &pending_error)?;
            Ok(SweepReport {
                running_reclaimed,
                pending_reclaimed,
            })
        })
        .await
    }

    /// Start the recurring sweep. The first pass runs immediately (process
    /// startup), then every `interval`.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let db = self.db.clone();
        let config = self.config;
        let cancel = self.cancel.clone();
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match Self::sweep_at(&db, &config, Utc::now()).await {
                            Ok(report) if report.total() > 0 => {
                                info!(
                                    running = report.running_reclaimed,
                                    pending = report.pending_reclaimed,
                                    "maintenance sweep reclaimed stuck tasks"
                                );
                            }
                            Ok(_) => debug!("maintenance sweep found nothing to reclaim"),
                            Err(e) => warn!("maintenance sweep failed: {:#}", e),
                        }
                    }
                }
            }
        }));
    }

    /// Stop the recurring sweep and wait for the task to wind down.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> Result<String> {
    let age = chrono::Duration::from_std(age).context("sweep window out of range")?;
    Ok((now - age).to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
}
