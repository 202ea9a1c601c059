// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Master-side change scheduler.
//!
//! One background loop per master configuration. Every iteration leases a
//! pooled connection and asks the [`ChangeChecker`] to convert whatever is
//! staged, then waits for the next reason to look again:
//!
//! - a database notification, if the dialect has one
//! - an explicit hint ([`ChangeScheduler::trigger`])
//! - the poll interval elapsing (`alertScheduler.pollInterval`, 0 = off)
//! - shutdown
//!
//! # Failure Policy
//!
//! An iteration error never ends the loop. The connection that saw the error
//! is detached from the pool instead of being returned, the error is logged
//! (warn when transient, error otherwise) and the loop sleeps a fixed
//! backoff before the next iteration. Only the shutdown signal stops it.

use crate::converter::ChangeChecker;
use crate::dialect::Dialect;
use crate::error::Result;
use crate::metrics;
use sqlx::sqlite::SqlitePool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Wait used for dialect notifications when timed polling is off.
const NOTIFICATION_WAIT: Duration = Duration::from_secs(1);

/// Background loop driving change conversion.
pub struct ChangeScheduler {
    name: String,
    pool: SqlitePool,
    checker: Arc<dyn ChangeChecker>,
    dialect: Arc<dyn Dialect>,
    poll_interval: Option<Duration>,
    backoff: Duration,
    hint: Arc<Notify>,
    iterations: AtomicU64,
    errors: AtomicU64,
}

impl ChangeScheduler {
    pub fn new(
        name: &str,
        pool: SqlitePool,
        checker: Arc<dyn ChangeChecker>,
        dialect: Arc<dyn Dialect>,
        poll_interval: Option<Duration>,
        backoff: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            pool,
            checker,
            dialect,
            poll_interval,
            backoff,
            hint: Arc::new(Notify::new()),
            iterations: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Ask for an immediate check.
    pub fn trigger(&self) {
        self.hint.notify_one();
    }

    /// Completed iterations (successful or not).
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    /// Iterations that ended in an error.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Run until `shutdown_rx` turns true.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let span = info_span!("change_scheduler", name = %self.name);

        async move {
            info!(
                poll_ms = self.poll_interval.map(|d| d.as_millis() as u64),
                backoff_ms = self.backoff.as_millis() as u64,
                "Starting change scheduler"
            );

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let start = Instant::now();
                let result = self.iteration().await;
                self.iterations.fetch_add(1, Ordering::Relaxed);
                metrics::record_scheduler_iteration(start.elapsed());

                match result {
                    Ok(0) => {}
                    Ok(rows) => debug!(rows, "Scheduler iteration converted changes"),
                    Err(e) => {
                        self.errors.fetch_add(1, Ordering::Relaxed);
                        metrics::record_scheduler_error(e.is_retryable());
                        if e.is_retryable() {
                            warn!(error = %e, backoff_ms = self.backoff.as_millis() as u64, "Transient scheduler error, backing off");
                        } else {
                            error!(error = %e, backoff_ms = self.backoff.as_millis() as u64, "Scheduler iteration failed, backing off");
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(self.backoff) => {}
                            changed = shutdown_rx.changed() => {
                                // Sender gone.
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                        continue;
                    }
                }

                if !self.wait_for_work(&mut shutdown_rx).await {
                    break;
                }
            }

            info!("Change scheduler stopped");
        }
        .instrument(span)
        .await
    }

    /// One check. A failing connection is discarded rather than returned.
    async fn iteration(&self) -> Result<usize> {
        let mut conn = self.pool.acquire().await?;
        match self.checker.check_again(&mut *conn).await {
            Ok(rows) => Ok(rows),
            Err(e) => {
                drop(conn.detach());
                Err(e)
            }
        }
    }

    /// Block until there may be new work. Returns false on shutdown.
    async fn wait_for_work(&self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        if self.dialect.supports_change_notification() {
            let timeout = self.poll_interval.unwrap_or(NOTIFICATION_WAIT);
            let wait = async {
                let mut conn = self.pool.acquire().await?;
                self.dialect.wait_for_change(&mut *conn, timeout).await
            };
            tokio::select! {
                res = wait => {
                    if let Err(e) = res {
                        warn!(error = %e, "Change notification wait failed");
                        tokio::time::sleep(self.backoff).await;
                    }
                }
                _ = self.hint.notified() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        } else {
            tokio::select! {
                _ = poll_sleep(self.poll_interval) => {}
                _ = self.hint.notified() => {}
                changed = shutdown_rx.changed() => {
                    // Sender gone: nobody can stop us any more, stop now.
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
        !*shutdown_rx.borrow()
    }
}

async fn poll_sleep(interval: Option<Duration>) {
    match interval {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending::<()>().await,
    }
}
