//! Periodic triggers and the per-process re-entrancy guard.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use lpf_storage::Store;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::Pipeline;

#[derive(Debug)]
struct Running {
    generation: u64,
    started_at: Instant,
}

#[derive(Debug, Default)]
struct GuardState {
    running: Option<Running>,
    next_generation: u64,
}

/// Keeps two ticks of the same job from overlapping inside one process. A
/// tick flagged as running for longer than the watchdog is taken over.
#[derive(Debug)]
pub struct TickGuard {
    name: &'static str,
    watchdog: Duration,
    state: Arc<Mutex<GuardState>>,
}

/// Held for the duration of a tick; releases the guard on drop unless the
/// watchdog handed it to a newer tick meanwhile.
#[derive(Debug)]
pub struct TickPermit {
    generation: u64,
    state: Arc<Mutex<GuardState>>,
}

impl TickGuard {
    pub fn new(name: &'static str, watchdog: Duration) -> Self {
        Self {
            name,
            watchdog,
            state: Arc::new(Mutex::new(GuardState::default())),
        }
    }

    pub fn try_enter(&self) -> Option<TickPermit> {
        self.try_enter_at(Instant::now())
    }

    pub fn try_enter_at(&self, now: Instant) -> Option<TickPermit> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(running) = &state.running {
            let elapsed = now.saturating_duration_since(running.started_at);
            if elapsed < self.watchdog {
                debug!(job = self.name, "previous tick still running; skipping");
                return None;
            }
            warn!(
                job = self.name,
                elapsed_secs = elapsed.as_secs(),
                "tick exceeded watchdog; taking over"
            );
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        state.running = Some(Running {
            generation,
            started_at: now,
        });
        Some(TickPermit {
            generation,
            state: self.state.clone(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .running
            .is_some()
    }
}

impl Drop for TickPermit {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state
            .running
            .as_ref()
            .is_some_and(|r| r.generation == self.generation)
        {
            state.running = None;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickKind {
    Fetch,
    Transfer,
    TransferMissing,
    TitleSweep,
}

async fn run_tick<S: Store>(pipeline: &Pipeline<S>, kind: TickKind) {
    match kind {
        TickKind::Fetch => {
            pipeline.fetch_tick().await;
        }
        TickKind::Transfer => {
            pipeline.transfer_tick().await;
        }
        TickKind::TransferMissing => {
            pipeline.transfer_missing_tick().await;
        }
        TickKind::TitleSweep => {
            pipeline.title_sweep_tick().await;
        }
    }
}

/// Builds the cron scheduler when enabled. The caller starts it.
pub async fn maybe_build_scheduler<S: Store>(
    pipeline: Arc<Pipeline<S>>,
    config: &SchedulerConfig,
) -> Result<Option<JobScheduler>> {
    if !config.enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let jobs = [
        (TickKind::Fetch, &config.fetch_cron),
        (TickKind::Transfer, &config.transfer_cron),
        (TickKind::TransferMissing, &config.transfer_missing_cron),
        (TickKind::TitleSweep, &config.title_sweep_cron),
    ];
    for (kind, cron) in jobs {
        let pipeline = pipeline.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                run_tick(&pipeline, kind).await;
            })
        })
        .with_context(|| format!("creating {kind:?} job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}
