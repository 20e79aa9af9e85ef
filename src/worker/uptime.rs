//! Uptime accounting.
//!
//! Every tick adds the tick length to the current cycle. Once a cycle passes
//! its refresh time the accumulated uptime is reported, any reward returned is
//! recorded, and a new cycle begins. A failed report leaves the cycle in place
//! so the next tick retries it.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::central_client::ApiError;
use crate::clock::Clock;
use crate::config::UptimeConfig;
use crate::local_storage::{RewardRecord, StorageError, UptimeState, UptimeStore};
use crate::models::{Reward, UptimeCycle, UptimeReport};

/// Cycles at or below this are rotated without contacting the server
pub const MIN_REPORTABLE_MS: i64 = 1_000;

#[async_trait]
pub trait UptimeReporter: Send + Sync {
    async fn report(&self, report: &UptimeReport) -> Result<Option<Reward>, ApiError>;
}

#[derive(Debug, Error)]
pub enum UptimeError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Uptime report failed: {0}")]
    Report(#[from] ApiError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Created,
    Incremented {
        uptime_ms: i64,
    },
    Rotated {
        duration_ms: i64,
        reported: bool,
        reward: Option<Reward>,
    },
    /// A previous tick was still running
    Skipped,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct UptimeRunner {
    tick: Duration,
    cycle_ms: i64,
    clock: Arc<dyn Clock>,
    store: Arc<dyn UptimeStore>,
    reporter: Arc<dyn UptimeReporter>,
    cached: Mutex<Option<UptimeState>>,
    in_flight: AtomicBool,
}

impl UptimeRunner {
    pub fn new(
        config: &UptimeConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn UptimeStore>,
        reporter: Arc<dyn UptimeReporter>,
    ) -> Self {
        Self {
            tick: config.tick(),
            cycle_ms: config.cycle_ms(),
            clock,
            store,
            reporter,
            cached: Mutex::new(None),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Current state, loading it from the store on first use
    pub fn state(&self) -> UptimeState {
        if let Some(state) = self.cached.lock().clone() {
            return state;
        }

        let mut state = match self.store.load() {
            Ok(state) => state,
            Err(e) => {
                warn!("Discarding unreadable uptime state: {}", e);
                UptimeState::default()
            }
        };
        if let Some(cycle) = state.cycle {
            if !cycle.is_valid() {
                warn!("Discarding invalid uptime cycle {:?}", cycle);
                state.cycle = None;
            }
        }
        state
    }

    fn commit(&self, state: UptimeState) -> Result<(), UptimeError> {
        *self.cached.lock() = Some(state.clone());
        self.store.save(&state)?;
        Ok(())
    }

    pub async fn tick(&self) -> Result<TickOutcome, UptimeError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("Uptime tick still in flight, skipping");
            return Ok(TickOutcome::Skipped);
        }
        let _in_flight = InFlight(&self.in_flight);

        let now = self.clock.now_ms();
        let mut state = self.state();

        let Some(mut cycle) = state.cycle else {
            state.cycle = Some(UptimeCycle::new(now, self.cycle_ms));
            self.commit(state)?;
            info!("Started uptime cycle");
            return Ok(TickOutcome::Created);
        };

        if !cycle.is_expired(now) {
            let tick_ms = self.tick.as_millis() as i64;
            cycle.uptime_ms = (cycle.uptime_ms + tick_ms).min(cycle.window_ms());
            cycle.updated_at = now;
            state.cycle = Some(cycle);
            self.commit(state)?;
            return Ok(TickOutcome::Incremented {
                uptime_ms: cycle.uptime_ms,
            });
        }

        let duration_ms = cycle.uptime_ms.clamp(0, cycle.window_ms());
        let reported = duration_ms > MIN_REPORTABLE_MS;
        let mut reward = None;

        if reported {
            let report = UptimeReport {
                duration_ms,
                started_at: cycle.created_at,
                ended_at: now,
            };
            reward = self.reporter.report(&report).await?;
            match &reward {
                Some(r) => {
                    info!("Uptime reward {} for {} ms", r.amount, duration_ms);
                    state.push_reward(RewardRecord {
                        reward: r.clone(),
                        cycle_started_at: cycle.created_at,
                        reported_at: now,
                        duration_ms,
                    });
                }
                None => info!("Uptime reported ({} ms), no reward", duration_ms),
            }
        } else {
            debug!("Uptime cycle too short to report ({} ms)", duration_ms);
        }

        state.cycle = Some(UptimeCycle::new(now, self.cycle_ms));
        self.commit(state)?;
        Ok(TickOutcome::Rotated {
            duration_ms,
            reported,
            reward,
        })
    }

    /// Tick on an interval until cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Uptime tracking every {:?}", self.tick);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let runner = self.clone();
            tokio::spawn(async move {
                match runner.tick().await {
                    Ok(outcome) => debug!("Uptime tick: {:?}", outcome),
                    Err(e) => warn!("Uptime tick failed: {}", e),
                }
            });
        }
        debug!("Uptime runner stopped");
    }
}
