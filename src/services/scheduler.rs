//! In-memory extraction scheduler.
//!
//! Loads every active schedule at startup and fires the extractor per
//! tenant. Fires coalesce: when the prior run is still live the fire is
//! dropped, never queued. Schedule mutations through the API touch both the
//! persisted row and the live job table. Shutdown drains in-flight runs for
//! a bounded grace period, then cancels them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::{parse_cron, parse_interval, ExtractionSchedule, ScheduleKind};
use crate::repository::{ScheduleRepository, TenantRepository};
use crate::services::extractor::ProcessExtractor;
use crate::services::tasks::TaskControl;

/// How often the job table is polled for due fires.
const TICK: Duration = Duration::from_secs(2);

/// One live scheduling job.
struct Job {
    kind: ScheduleKind,
    expression: String,
    next_due: DateTime<Utc>,
}

impl Job {
    fn from_schedule(schedule: &ExtractionSchedule, now: DateTime<Utc>) -> Result<Self> {
        let mut job = Self {
            kind: schedule.kind,
            expression: schedule.expression.clone(),
            next_due: now,
        };
        job.advance(now)?;
        Ok(job)
    }

    /// Compute the next fire time strictly after `now`.
    fn advance(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.next_due = match self.kind {
            ScheduleKind::Interval => {
                let interval = parse_interval(&self.expression)?;
                now + chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::minutes(30))
            }
            ScheduleKind::Cron => parse_cron(&self.expression)?
                .after(&now)
                .next()
                .unwrap_or(now + chrono::Duration::days(365)),
        };
        Ok(())
    }
}

/// Single-process scheduler over the schedule table.
pub struct Scheduler {
    schedules: Arc<ScheduleRepository>,
    tenants: Arc<TenantRepository>,
    extractor: Arc<ProcessExtractor>,
    control: Arc<TaskControl>,
    jobs: Mutex<HashMap<String, Job>>,
    shutdown: watch::Sender<bool>,
    grace: Duration,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        schedules: Arc<ScheduleRepository>,
        tenants: Arc<TenantRepository>,
        extractor: Arc<ProcessExtractor>,
        control: Arc<TaskControl>,
        grace: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            schedules,
            tenants,
            extractor,
            control,
            jobs: Mutex::new(HashMap::new()),
            shutdown,
            grace,
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Load every active schedule into the live job table.
    pub fn load_jobs(&self) -> Result<usize> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().expect("job table poisoned");
        jobs.clear();

        let mut loaded = 0;
        for schedule in self.schedules.get_all_active()? {
            match Job::from_schedule(&schedule, now) {
                Ok(job) => {
                    debug!(
                        tenant_id = %schedule.tenant_id,
                        next_due = %job.next_due,
                        "scheduled extraction job"
                    );
                    jobs.insert(schedule.tenant_id.clone(), job);
                    loaded += 1;
                }
                Err(e) => warn!(
                    tenant_id = %schedule.tenant_id,
                    "skipping schedule with bad expression: {e}"
                ),
            }
        }
        info!(loaded, "scheduler loaded active schedules");
        Ok(loaded)
    }

    /// Add or replace the live job for a schedule. Inactive schedules are
    /// removed instead.
    pub fn upsert_job(&self, schedule: &ExtractionSchedule) -> Result<()> {
        let mut jobs = self.jobs.lock().expect("job table poisoned");
        if !schedule.is_active {
            jobs.remove(&schedule.tenant_id);
            return Ok(());
        }
        jobs.insert(
            schedule.tenant_id.clone(),
            Job::from_schedule(schedule, Utc::now())?,
        );
        Ok(())
    }

    pub fn remove_job(&self, tenant_id: &str) {
        self.jobs.lock().expect("job table poisoned").remove(tenant_id);
    }

    /// Tenant ids with a live job, with their next fire times.
    pub fn job_overview(&self) -> Vec<(String, DateTime<Utc>)> {
        let jobs = self.jobs.lock().expect("job table poisoned");
        let mut overview: Vec<(String, DateTime<Utc>)> = jobs
            .iter()
            .map(|(tenant, job)| (tenant.clone(), job.next_due))
            .collect();
        overview.sort();
        overview
    }

    /// Run the ticker loop until shutdown is signalled.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(TICK);
        info!("scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.fire_due(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain().await;
        info!("scheduler stopped");
    }

    /// Fire every due job. Overlapping fires are dropped, not queued.
    fn fire_due(&self) {
        let now = Utc::now();
        let mut due: Vec<String> = Vec::new();
        {
            let mut jobs = self.jobs.lock().expect("job table poisoned");
            let mut bad: Vec<String> = Vec::new();
            for (tenant_id, job) in jobs.iter_mut() {
                if job.next_due <= now {
                    if job.advance(now).is_err() {
                        warn!(tenant_id = %tenant_id, "could not advance schedule, removing job");
                        bad.push(tenant_id.clone());
                        continue;
                    }
                    due.push(tenant_id.clone());
                }
            }
            for tenant_id in bad {
                jobs.remove(&tenant_id);
            }
        }

        for tenant_id in due {
            if self.control.extraction_running(&tenant_id) {
                info!(tenant_id = %tenant_id, "dropping scheduled fire, prior run still active");
                continue;
            }
            match self.tenants.get(&tenant_id) {
                Ok(Some(tenant)) if !tenant.is_active => {
                    debug!(tenant_id = %tenant_id, "skipping scheduled fire for inactive tenant");
                    continue;
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!(tenant_id = %tenant_id, "schedule references missing tenant, removing job");
                    self.remove_job(&tenant_id);
                    continue;
                }
                Err(e) => {
                    warn!(tenant_id = %tenant_id, "tenant lookup failed: {e}");
                    continue;
                }
            }

            info!(tenant_id = %tenant_id, "scheduled extraction firing");
            let extractor = self.extractor.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = extractor.run(&tenant_id).await {
                    warn!(tenant_id = %tenant_id, "scheduled extraction failed: {e}");
                }
            });

            let mut in_flight = self.in_flight.lock().expect("in-flight table poisoned");
            in_flight.retain(|h| !h.is_finished());
            in_flight.push(handle);
        }
    }

    /// Signal shutdown. The run loop drains and returns.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for in-flight runs up to the grace period, then cancel the rest.
    async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut in_flight = self.in_flight.lock().expect("in-flight table poisoned");
            in_flight.drain(..).collect()
        };
        if handles.is_empty() {
            return;
        }

        info!(jobs = handles.len(), grace = ?self.grace, "draining in-flight extractions");
        let drained = tokio::time::timeout(self.grace, async {
            for handle in handles {
                let _ = handle.await;
            }
        })
        .await;

        if drained.is_err() {
            warn!("grace period elapsed, cancelling remaining runs");
            self.control.cancel_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(kind: ScheduleKind, expression: &str) -> ExtractionSchedule {
        ExtractionSchedule {
            tenant_id: "t1".into(),
            kind,
            expression: expression.into(),
            is_active: true,
        }
    }

    #[test]
    fn interval_job_due_time() {
        let now = Utc::now();
        let job = Job::from_schedule(&schedule(ScheduleKind::Interval, "30m"), now).unwrap();
        let expected = now + chrono::Duration::minutes(30);
        assert!((job.next_due - expected).num_seconds().abs() <= 1);
    }

    #[test]
    fn cron_job_due_time_is_in_future() {
        let now = Utc::now();
        let job = Job::from_schedule(&schedule(ScheduleKind::Cron, "*/5 * * * *"), now).unwrap();
        assert!(job.next_due > now);
        assert!(job.next_due <= now + chrono::Duration::minutes(5) + chrono::Duration::seconds(1));
    }

    #[test]
    fn advance_moves_strictly_forward() {
        let now = Utc::now();
        let mut job = Job::from_schedule(&schedule(ScheduleKind::Interval, "1m"), now).unwrap();
        let first = job.next_due;
        job.advance(first).unwrap();
        assert!(job.next_due > first);
    }

    #[test]
    fn bad_expression_is_rejected() {
        let now = Utc::now();
        assert!(Job::from_schedule(&schedule(ScheduleKind::Interval, "bogus"), now).is_err());
        assert!(Job::from_schedule(&schedule(ScheduleKind::Cron, "bogus"), now).is_err());
    }
}
