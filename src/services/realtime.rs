use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::client::{ChannelError, DeviceChannel, RawUpdate, UpdateSource};
use crate::models::homekit::CharKey;
use crate::services::ingest::ChangeReconciler;
use crate::services::refs::AccessoryCache;
use crate::services::state::SharedState;
use crate::shutdown::Shutdown;

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub full_every_ticks: u64,
    pub batch_size: usize,
    pub error_backoff: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        PollSettings {
            interval: Duration::from_secs(10),
            full_every_ticks: 6,
            batch_size: 15,
            error_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("all {0} batch(es) of the {1} sweep failed")]
    AllBatchesFailed(usize, &'static str),
    /// The channel as a whole went away mid-sweep; remaining batches are not attempted.
    #[error("device channel became unavailable during the {0} sweep")]
    ChannelUnavailable(&'static str),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub batches: usize,
    pub failed_batches: usize,
    pub values: usize,
    pub changes: usize,
}

/// Outcome of one loop tick. Each sweep is isolated: a failed sweep is
/// recorded here and never prevents the other one from running.
#[derive(Debug, Default)]
pub struct TickReport {
    pub fast: Option<Result<SweepReport, PollError>>,
    pub full: Option<Result<SweepReport, PollError>>,
}

impl TickReport {
    pub fn failed_sweeps(&self) -> usize {
        [&self.fast, &self.full]
            .into_iter()
            .filter(|s| matches!(s, Some(Err(_))))
            .count()
    }

    /// Channel-level failure, as opposed to failures contained in a batch.
    pub fn channel_error(&self) -> Option<&PollError> {
        [&self.fast, &self.full]
            .into_iter()
            .filter_map(|s| match s {
                Some(Err(e @ PollError::ChannelUnavailable(_))) => Some(e),
                _ => None,
            })
            .next()
    }
}

pub struct PollingScheduler {
    channel: Arc<dyn DeviceChannel>,
    reconciler: Arc<ChangeReconciler>,
    state: SharedState,
    settings: PollSettings,
    monitored: Vec<CharKey>,
    fast: Vec<CharKey>,
}

impl PollingScheduler {
    pub fn new(
        channel: Arc<dyn DeviceChannel>,
        reconciler: Arc<ChangeReconciler>,
        state: SharedState,
        settings: PollSettings,
    ) -> Self {
        PollingScheduler {
            channel,
            reconciler,
            state,
            settings: PollSettings {
                batch_size: settings.batch_size.max(1),
                full_every_ticks: settings.full_every_ticks.max(1),
                ..settings
            },
            monitored: Vec::new(),
            fast: Vec::new(),
        }
    }

    /// Build the monitored set from accessory metadata: every characteristic
    /// that advertises event support.
    pub fn discover(&mut self, accessories: &AccessoryCache) -> usize {
        let monitored = accessories.monitored();
        self.fast = monitored
            .iter()
            .filter(|(_, t)| t.is_some_and(|t| t.is_fast_poll()))
            .map(|(k, _)| *k)
            .collect();
        self.monitored = monitored.into_iter().map(|(k, _)| k).collect();
        info!(
            "Polling: monitoring {} characteristic(s), {} on the fast cadence",
            self.monitored.len(),
            self.fast.len()
        );
        self.monitored.len()
    }

    pub fn monitored(&self) -> &[CharKey] {
        &self.monitored
    }

    /// Read `keys` in fixed-size batches; a failing batch does not stop the rest
    /// unless the channel itself has gone down.
    pub async fn sweep(&self, keys: &[CharKey], source: UpdateSource) -> Result<SweepReport, PollError> {
        let mut report = SweepReport::default();
        for batch in keys.chunks(self.settings.batch_size) {
            report.batches += 1;
            let values = match self.channel.batch_read(batch).await {
                Ok(v) => v,
                Err(ChannelError::Unavailable) => return Err(PollError::ChannelUnavailable(source.label())),
                Err(e) => {
                    report.failed_batches += 1;
                    warn!("{}: batch of {} failed: {}", source.label(), batch.len(), e);
                    if !self.channel.is_available() {
                        return Err(PollError::ChannelUnavailable(source.label()));
                    }
                    continue;
                }
            };
            for key in batch {
                let Some(value) = values.get(key) else { continue };
                if value.is_null() {
                    continue;
                }
                report.values += 1;
                let update = RawUpdate::new(*key, value.clone(), source);
                if self.reconciler.handle(update, Utc::now()).is_some() {
                    report.changes += 1;
                }
            }
        }

        if report.batches > 0 && report.failed_batches == report.batches {
            return Err(PollError::AllBatchesFailed(report.batches, source.label()));
        }
        debug!(
            "{}: {} value(s), {} change(s) in {} batch(es)",
            source.label(),
            report.values,
            report.changes,
            report.batches
        );
        Ok(report)
    }

    /// Fast sweep every tick, full sweep every `full_every_ticks`; both run
    /// regardless of how the other one went.
    pub async fn tick(&self, tick: u64) -> TickReport {
        let pruned = self.state.lock().prune_expired_overlays(Utc::now());
        if pruned > 0 {
            debug!("Polling: expired {} optimistic overlay(s)", pruned);
        }

        let mut report = TickReport::default();
        if !self.fast.is_empty() {
            let fast = self.sweep(&self.fast, UpdateSource::FastPoll).await;
            if let Err(e) = &fast {
                warn!("Polling: fast sweep failed: {}", e);
            }
            report.fast = Some(fast);
        }
        if tick % self.settings.full_every_ticks == 0 && !self.monitored.is_empty() {
            let full = self.sweep(&self.monitored, UpdateSource::Polling).await;
            match &full {
                Ok(_) => {
                    let c = self.reconciler.counters();
                    info!(
                        "Polling: full sweep done (events_received={}, polling_changes={})",
                        c.events_received, c.polling_changes
                    );
                }
                Err(e) => warn!("Polling: full sweep failed: {}", e),
            }
            report.full = Some(full);
        }
        report
    }

    pub async fn run(self, mut shutdown: Shutdown) {
        info!(
            "Polling loop started: interval={}s, full sweep every {} tick(s), batch size {}",
            self.settings.interval.as_secs(),
            self.settings.full_every_ticks,
            self.settings.batch_size
        );
        let mut tick: u64 = 0;
        while !shutdown.is_triggered() {
            if !shutdown.sleep(self.settings.interval).await {
                break;
            }
            if !self.channel.is_available() {
                debug!("Polling: device channel unavailable, skipping tick");
                continue;
            }
            let report = self.tick(tick).await;
            tick = tick.wrapping_add(1);
            if let Some(e) = report.channel_error() {
                warn!("Polling tick aborted: {}; retrying in {}s", e, self.settings.error_backoff.as_secs());
                if !shutdown.sleep(self.settings.error_backoff).await {
                    break;
                }
            }
        }
        info!("Polling loop stopped");
    }
}
