//! Cron jobs on a 30-second polling loop.
//!
//! A job's next fire time is advanced before its callback runs, so a tick
//! can never re-enter a job, and fire times missed while the process was
//! paused collapse into a single execution. Wall-clock polling at this
//! granularity is the intended design, not a compromise.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use cron::Schedule;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub type JobFuture = BoxFuture<'static, Result<()>>;
pub type JobCallback = Arc<dyn Fn() -> JobFuture + Send + Sync>;

const POLL_INTERVAL: Duration = Duration::from_secs(30);

struct CronJob {
    name: String,
    schedule: Schedule,
    callback: JobCallback,
    next_run: Option<DateTime<Local>>,
    last_run: Option<DateTime<Local>>,
}

#[derive(Default)]
pub struct CronService {
    jobs: Vec<CronJob>,
}

impl CronService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job before the service starts. Five-field expressions are
    /// accepted and normalised to the six-field form the parser wants.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        cron_expr: &str,
        callback: JobCallback,
    ) -> Result<()> {
        let name = name.into();
        let normalized = normalize_cron(cron_expr);
        let schedule = Schedule::from_str(&normalized)
            .with_context(|| format!("invalid cron expression {cron_expr:?} for job {name}"))?;
        debug!(job = %name, expr = %cron_expr, "cron job registered");
        self.jobs.push(CronJob {
            name,
            schedule,
            callback,
            next_run: None,
            last_run: None,
        });
        Ok(())
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Compute every job's first fire time from `now`.
    pub fn prime_at(&mut self, now: DateTime<Local>) {
        for job in &mut self.jobs {
            job.next_run = job.schedule.after(&now).next();
        }
    }

    /// Fire every job whose next fire time has passed, returning how many
    /// fired. The next fire time is recomputed from `now` before the
    /// callback executes.
    pub async fn tick_at(&mut self, now: DateTime<Local>) -> usize {
        let mut fired = 0;
        for job in &mut self.jobs {
            let due = job.next_run.is_some_and(|next| now >= next);
            if !due {
                continue;
            }
            job.last_run = Some(now);
            job.next_run = job.schedule.after(&now).next();
            fired += 1;

            info!(job = %job.name, "cron job firing");
            let future = (job.callback)();
            // Run in a task of its own so a panic inside the callback is
            // contained; the await keeps execution single-entry.
            match tokio::spawn(future).await {
                Ok(Ok(())) => debug!(job = %job.name, "cron job finished"),
                Ok(Err(err)) => error!(job = %job.name, %err, "cron job failed"),
                Err(join_err) => error!(job = %job.name, %join_err, "cron job panicked"),
            }
        }
        fired
    }

    /// Poll until the shutdown flag flips. In-flight callbacks finish
    /// before the loop exits.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(jobs = self.jobs.len(), "cron service started");
        self.prime_at(Local::now());

        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick_at(Local::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("cron service stopping");
                        break;
                    }
                }
            }
        }
    }
}

/// The `cron` crate wants a seconds column; standard five-field expressions
/// from configuration get one prepended.
fn normalize_cron(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use chrono::{Local, TimeZone};

    use super::{normalize_cron, CronService, JobCallback};

    fn counting_callback() -> (Arc<AtomicUsize>, JobCallback) {
        let counter = Arc::new(AtomicUsize::new(0));
        let captured = counter.clone();
        let callback: JobCallback = Arc::new(move || {
            let counter = captured.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        (counter, callback)
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> chrono::DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn five_field_expressions_gain_a_seconds_column() {
        assert_eq!(normalize_cron("0 2 * * *"), "0 0 2 * * *");
        assert_eq!(normalize_cron("0 0 2 * * *"), "0 0 2 * * *");
    }

    #[test]
    fn bad_expressions_fail_registration() {
        let (_counter, callback) = counting_callback();
        let mut service = CronService::new();
        assert!(service.register("bad", "not a cron", callback).is_err());
        assert_eq!(service.job_count(), 0);
    }

    #[tokio::test]
    async fn missed_fires_collapse_into_one_execution() {
        let (counter, callback) = counting_callback();
        let mut service = CronService::new();
        service.register("daily", "0 2 * * *", callback).unwrap();

        // Primed the evening before; the process then "sleeps" past 02:00.
        service.prime_at(at(2026, 2, 25, 0, 0));

        let fired = service.tick_at(at(2026, 2, 25, 2, 10)).await;
        assert_eq!(fired, 1, "first tick after the fire time runs the job once");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let fired = service.tick_at(at(2026, 2, 25, 2, 14)).await;
        assert_eq!(fired, 0, "a second tick minutes later does not re-fire");

        let fired = service.tick_at(at(2026, 2, 26, 2, 1)).await;
        assert_eq!(fired, 1, "the next day fires again");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_and_panicking_callbacks_do_not_stop_other_jobs() {
        let failing: JobCallback =
            Arc::new(|| Box::pin(async { anyhow::bail!("expected failure") }));
        let panicking: JobCallback = Arc::new(|| Box::pin(async { panic!("expected panic") }));
        let (counter, ok_callback) = counting_callback();

        let mut service = CronService::new();
        service.register("failing", "* * * * *", failing).unwrap();
        service.register("panicking", "* * * * *", panicking).unwrap();
        service.register("ok", "* * * * *", ok_callback).unwrap();

        service.prime_at(at(2026, 2, 25, 12, 0));
        let fired = service.tick_at(at(2026, 2, 25, 12, 2)).await;
        assert_eq!(fired, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 1, "healthy job still ran");
    }

    #[tokio::test]
    async fn next_fire_is_advanced_before_execution() {
        // A callback slow enough that a buggy implementation could re-fire.
        let counter = Arc::new(AtomicUsize::new(0));
        let captured = counter.clone();
        let slow: JobCallback = Arc::new(move || {
            let counter = captured.clone();
            Box::pin(async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let mut service = CronService::new();
        service.register("slow", "* * * * *", slow).unwrap();
        service.prime_at(at(2026, 2, 25, 12, 0));

        // Tick twice at the same instant: the second tick sees the advanced
        // next_run and does nothing.
        let now = at(2026, 2, 25, 12, 1);
        assert_eq!(service.tick_at(now).await, 1);
        assert_eq!(service.tick_at(now).await, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
