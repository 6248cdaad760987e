//! Periodic background jobs behind one registry: offline sweep, reading
//! retention, tombstone purge, report expiry. Each job runs on its own
//! interval task; runs of the same job never overlap because the loop
//! awaits the previous invocation.

use std::time::Duration;

use futures_util::future::BoxFuture;

type JobFn = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<usize>> + Send + Sync>;

struct Job {
    name: &'static str,
    initial_delay: Duration,
    interval: Duration,
    run: JobFn,
}

#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<Job>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named periodic job. The closure returns how many rows it
    /// touched, for the log line.
    pub fn register<F>(
        &mut self,
        name: &'static str,
        initial_delay: Duration,
        interval: Duration,
        run: F,
    ) where
        F: Fn() -> BoxFuture<'static, anyhow::Result<usize>> + Send + Sync + 'static,
    {
        self.jobs.push(Job {
            name,
            initial_delay,
            interval,
            run: Box::new(run),
        });
    }

    /// Spawn every registered job as a long-lived task.
    pub fn spawn_all(self) {
        for job in self.jobs {
            tokio::spawn(async move {
                tokio::time::sleep(job.initial_delay).await;
                tracing::info!(job = job.name, interval_secs = job.interval.as_secs(), "job started");
                let mut ticker = tokio::time::interval(job.interval);
                loop {
                    ticker.tick().await;
                    match (job.run)().await {
                        Ok(touched) if touched > 0 => {
                            tracing::info!(job = job.name, touched, "job run complete");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(job = job.name, "job failed: {e:#}"),
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn jobs_tick_on_their_interval() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new();
        let c = Arc::clone(&counter);
        scheduler.register(
            "test-job",
            Duration::from_millis(0),
            Duration::from_millis(20),
            move || {
                let c = Arc::clone(&c);
                Box::pin(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                })
            },
        );
        scheduler.spawn_all();
        tokio::time::sleep(Duration::from_millis(130)).await;
        let ticks = counter.load(Ordering::SeqCst);
        assert!(ticks >= 3, "expected several ticks, got {ticks}");
    }
}
