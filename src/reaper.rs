//! Background sweep that stops instances past their template lifetime.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{LedgerError, ReclaimError, RuntimeError};
use crate::ledger::Ledger;
use crate::runtime::Runtime;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Delay between sweeps.
    pub interval: Duration,
    /// Upper bound on reclamations running at once.
    pub concurrency: usize,
    /// Lifetime for instances whose template is no longer in the ledger.
    pub default_lifetime_secs: u64,
    /// How long one runtime stop may take before it counts as failed.
    pub stop_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            concurrency: 8,
            default_lifetime_secs: 60,
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Non-terminated instances inspected.
    pub inspected: usize,
    /// Instances marked terminated by this sweep.
    pub reclaimed: Vec<String>,
    /// Instances whose reclamation failed.
    pub failed: Vec<String>,
}

pub struct Reaper {
    ledger: Ledger,
    runtime: Arc<dyn Runtime>,
    clock: Arc<dyn Clock>,
    config: ReaperConfig,
    permits: Arc<Semaphore>,
}

impl Reaper {
    pub fn new(
        ledger: Ledger,
        runtime: Arc<dyn Runtime>,
        clock: Arc<dyn Clock>,
        config: ReaperConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            ledger,
            runtime,
            clock,
            config,
            permits,
        }
    }

    /// Sweep on every tick until `cancel` fires. Cancelling mid-sweep
    /// aborts the reclamations still in flight.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval = ?self.config.interval, "reaper started");
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let swept = tokio::select! {
                        _ = cancel.cancelled() => break,
                        swept = self.sweep() => swept,
                    };
                    match swept {
                        Ok(report) if !report.reclaimed.is_empty() || !report.failed.is_empty() => {
                            info!(
                                inspected = report.inspected,
                                reclaimed = report.reclaimed.len(),
                                failed = report.failed.len(),
                                "sweep finished"
                            );
                        }
                        Ok(report) => debug!(inspected = report.inspected, "sweep finished"),
                        Err(e) => error!(error = %e, "sweep could not read ledger"),
                    }
                }
            }
        }
        info!("reaper stopped");
    }

    /// Reclaim every instance that has outlived its template, oldest first.
    pub async fn sweep(&self) -> Result<SweepReport, LedgerError> {
        let now = self.clock.now();
        let live = self.ledger.live_instances()?;
        let mut report = SweepReport {
            inspected: live.len(),
            ..SweepReport::default()
        };

        let mut tasks = JoinSet::new();
        for entry in live {
            let elapsed = now - entry.instance.start_time;
            debug!(
                instance_id = %entry.instance.instance_id,
                elapsed_secs = elapsed.num_seconds(),
                "instance running"
            );
            if !entry.is_expired(now, self.config.default_lifetime_secs) {
                continue;
            }

            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                break;
            };
            let ledger = self.ledger.clone();
            let runtime = Arc::clone(&self.runtime);
            let instance_id = entry.instance.instance_id;
            let stop_timeout = self.config.stop_timeout;
            tasks.spawn(async move {
                let outcome = reclaim(&ledger, runtime.as_ref(), &instance_id, stop_timeout).await;
                drop(permit);
                (instance_id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(()))) => report.reclaimed.push(id),
                Ok((id, Err(e))) => {
                    error!(error = %e, "reclaim failed");
                    self.ledger
                        .record(&format!("[-] reclaim {} failed: {}", id, e));
                    report.failed.push(id);
                }
                Err(e) => error!(error = %e, "reclaim task panicked"),
            }
        }
        Ok(report)
    }
}

/// Stop `instance_id` and mark it terminated.
///
/// The stop is best-effort and bounded by `stop_timeout`: a container that
/// already exited, or a runtime that never answers, still gets its row
/// terminated. Re-marking a terminated row is a no-op.
pub async fn reclaim(
    ledger: &Ledger,
    runtime: &dyn Runtime,
    instance_id: &str,
    stop_timeout: Duration,
) -> Result<(), ReclaimError> {
    info!(instance_id, "reclaiming instance");
    let stopped = match tokio::time::timeout(stop_timeout, runtime.stop(instance_id)).await {
        Ok(stopped) => stopped,
        Err(_) => Err(RuntimeError::Timeout(stop_timeout)),
    };
    if let Err(e) = stopped {
        warn!(instance_id, error = %e, "stop failed, continuing with termination");
        ledger.record(&format!("[-] stop {} failed: {}", instance_id, e));
    }

    let flipped = ledger
        .mark_terminated(instance_id)
        .map_err(|source| ReclaimError {
            instance_id: instance_id.to_string(),
            source,
        })?;
    if flipped {
        ledger.record(&format!("[+] instance {} terminated", instance_id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::clock::ManualClock;
    use crate::error::RuntimeError;
    use crate::model::{Instance, Template};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRuntime {
        stopped: Mutex<Vec<String>>,
        fail_stop: bool,
        hang_stop: bool,
    }

    #[async_trait]
    impl Runtime for RecordingRuntime {
        async fn spawn(&self, _: &str, _: &str, _: u16, _: u16) -> Result<String, RuntimeError> {
            Err(RuntimeError::MissingId)
        }

        async fn stop(&self, instance_id: &str) -> Result<(), RuntimeError> {
            self.stopped.lock().unwrap().push(instance_id.to_string());
            if self.hang_stop {
                std::future::pending::<()>().await;
            }
            if self.fail_stop {
                Err(RuntimeError::NonZeroExit {
                    code: Some(1),
                    stderr: "No such container".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn template(id: &str, lifetime_seconds: u64) -> Template {
        Template {
            template_id: id.to_string(),
            tag: format!("{}:latest", id),
            challenge_id: 1,
            challenge_name: id.to_string(),
            lifetime_seconds,
        }
    }

    fn setup(runtime: Arc<RecordingRuntime>) -> (Reaper, Ledger, Arc<ManualClock>) {
        setup_with(runtime, ReaperConfig::default())
    }

    fn setup_with(
        runtime: Arc<RecordingRuntime>,
        config: ReaperConfig,
    ) -> (Reaper, Ledger, Arc<ManualClock>) {
        let ledger = Ledger::open_in_memory().unwrap();
        let catalog = Catalog::new(vec![template("short", 60), template("long", 600)]).unwrap();
        ledger.seed_templates(&catalog).unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let reaper = Reaper::new(
            ledger.clone(),
            runtime,
            clock.clone(),
            config,
        );
        (reaper, ledger, clock)
    }

    fn spawn_row(ledger: &Ledger, clock: &ManualClock, id: &str, template: &str, port: u16) {
        ledger
            .insert_instance(&Instance {
                instance_id: id.to_string(),
                template_id: template.to_string(),
                port,
                start_time: clock.now(),
                owner: format!("owner-{}", id),
                terminated: false,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn uses_per_template_lifetime() {
        let runtime = Arc::new(RecordingRuntime::default());
        let (reaper, ledger, clock) = setup(runtime.clone());
        spawn_row(&ledger, &clock, "a", "short", 10001);
        spawn_row(&ledger, &clock, "b", "long", 10002);

        clock.advance_secs(59);
        let report = reaper.sweep().await.unwrap();
        assert_eq!(report.inspected, 2);
        assert!(report.reclaimed.is_empty());

        clock.advance_secs(1);
        let report = reaper.sweep().await.unwrap();
        assert_eq!(report.reclaimed, ["a"]);
        assert!(ledger.instance("a").unwrap().unwrap().terminated);
        assert!(!ledger.instance("b").unwrap().unwrap().terminated);

        clock.advance_secs(600);
        let report = reaper.sweep().await.unwrap();
        assert_eq!(report.inspected, 1);
        assert_eq!(report.reclaimed, ["b"]);
        assert_eq!(*runtime.stopped.lock().unwrap(), ["a", "b"]);
    }

    #[tokio::test]
    async fn stop_failure_still_terminates() {
        let runtime = Arc::new(RecordingRuntime {
            fail_stop: true,
            ..RecordingRuntime::default()
        });
        let (reaper, ledger, clock) = setup(runtime);
        spawn_row(&ledger, &clock, "a", "short", 10001);
        spawn_row(&ledger, &clock, "b", "short", 10002);

        clock.advance_secs(120);
        let mut report = reaper.sweep().await.unwrap();
        report.reclaimed.sort();
        assert_eq!(report.reclaimed, ["a", "b"]);
        assert!(ledger.live_instances().unwrap().is_empty());

        let log = ledger.activity().unwrap();
        assert!(log.iter().any(|e| e.message.contains("No such container")));
    }

    #[tokio::test]
    async fn reclaim_twice_is_a_noop() {
        let runtime = Arc::new(RecordingRuntime::default());
        let (_, ledger, clock) = setup(runtime.clone());
        spawn_row(&ledger, &clock, "a", "short", 10001);

        let timeout = Duration::from_secs(1);
        reclaim(&ledger, runtime.as_ref(), "a", timeout).await.unwrap();
        reclaim(&ledger, runtime.as_ref(), "a", timeout).await.unwrap();
        assert!(ledger.instance("a").unwrap().unwrap().terminated);

        let terminations = ledger
            .activity()
            .unwrap()
            .into_iter()
            .filter(|e| e.message.contains("terminated"))
            .count();
        assert_eq!(terminations, 1);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let runtime = Arc::new(RecordingRuntime::default());
        let (reaper, ledger, clock) = setup(runtime);
        spawn_row(&ledger, &clock, "a", "short", 10001);
        clock.advance_secs(61);

        let cancel = CancellationToken::new();
        let reaper = Arc::new(reaper);
        let handle = tokio::spawn({
            let reaper = Arc::clone(&reaper);
            let cancel = cancel.clone();
            async move { reaper.run(cancel).await }
        });

        // The first tick fires immediately.
        for _ in 0..50 {
            if ledger.live_instances().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ledger.live_instances().unwrap().is_empty());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn unanswered_stop_still_terminates() {
        let runtime = Arc::new(RecordingRuntime {
            hang_stop: true,
            ..RecordingRuntime::default()
        });
        let config = ReaperConfig {
            stop_timeout: Duration::from_millis(50),
            ..ReaperConfig::default()
        };
        let (reaper, ledger, clock) = setup_with(runtime, config);
        spawn_row(&ledger, &clock, "a", "short", 10001);
        clock.advance_secs(120);

        let report = tokio::time::timeout(Duration::from_secs(2), reaper.sweep())
            .await
            .expect("sweep must not wait on a hung stop")
            .unwrap();
        assert_eq!(report.reclaimed, ["a"]);
        assert!(ledger.instance("a").unwrap().unwrap().terminated);

        let log = ledger.activity().unwrap();
        assert!(log.iter().any(|e| e.message.contains("did not answer")));
    }

    #[tokio::test]
    async fn run_cancels_a_sweep_stuck_on_stop() {
        let runtime = Arc::new(RecordingRuntime {
            hang_stop: true,
            ..RecordingRuntime::default()
        });
        let config = ReaperConfig {
            stop_timeout: Duration::from_secs(3600),
            ..ReaperConfig::default()
        };
        let (reaper, ledger, clock) = setup_with(runtime.clone(), config);
        spawn_row(&ledger, &clock, "a", "short", 10001);
        clock.advance_secs(120);

        let cancel = CancellationToken::new();
        let reaper = Arc::new(reaper);
        let handle = tokio::spawn({
            let reaper = Arc::clone(&reaper);
            let cancel = cancel.clone();
            async move { reaper.run(cancel).await }
        });

        for _ in 0..50 {
            if !runtime.stopped.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*runtime.stopped.lock().unwrap(), ["a"]);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("run must return after cancel")
            .unwrap();
    }
}
