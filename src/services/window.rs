//! Open-window alarm derived from the temperature trend of a zone leader.
//!
//! States are CLOSED, OPEN and RESTING. A sharp drop while heating (or rise
//! while cooling) opens the alarm and arms a per-device timer; when the timer
//! fires while still OPEN the alarm moves to RESTING, which holds for the rest
//! period before the trend is evaluated again.

use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::models::state::{DeviceId, WindowStatus, ZoneMode};
use crate::services::notify::{deliver, ChangeOrigin, ChangeRecord, NotificationSink};
use crate::services::state::SharedState;
use crate::shutdown::Shutdown;

#[derive(Debug, Clone, Copy)]
pub struct WindowSettings {
    pub threshold_c: f64,
    pub lookback: TimeDelta,
    pub open_time: TimeDelta,
    pub rest_time: TimeDelta,
}

impl Default for WindowSettings {
    fn default() -> Self {
        WindowSettings {
            threshold_c: 1.0,
            lookback: TimeDelta::minutes(10),
            open_time: TimeDelta::minutes(15),
            rest_time: TimeDelta::minutes(15),
        }
    }
}

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct WindowOpenDetector {
    state: SharedState,
    sink: Arc<dyn NotificationSink>,
    settings: WindowSettings,
    shutdown: Shutdown,
    timers: Arc<Mutex<HashMap<DeviceId, TimerEntry>>>,
    generation: Arc<AtomicU64>,
}

/// Pure decision for one evaluation.
fn target_status(mode: Option<ZoneMode>, delta: f64, threshold: f64) -> WindowStatus {
    match mode {
        Some(ZoneMode::Heat) if delta <= -threshold => WindowStatus::Open,
        Some(ZoneMode::Cool) if delta >= threshold => WindowStatus::Open,
        _ => WindowStatus::Closed,
    }
}

impl WindowOpenDetector {
    pub fn new(
        state: SharedState,
        sink: Arc<dyn NotificationSink>,
        settings: WindowSettings,
        shutdown: Shutdown,
    ) -> Self {
        WindowOpenDetector {
            state,
            sink,
            settings,
            shutdown,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Recompute the alarm for a zone leader after a confirmed temperature change.
    /// Returns the new status when it changed.
    pub fn evaluate(&self, device_id: DeviceId, now: DateTime<Utc>) -> Option<WindowStatus> {
        let (change, target, zone_name) = {
            let mut st = self.state.lock();
            let current = st.confirmed(device_id)?.clone();
            let zone_name = st.zone_of(device_id).map(|z| z.name.clone()).unwrap_or_default();
            let since_update = current.window_lastupdate.map(|t| now - t);

            let target = match (current.window(), since_update) {
                (WindowStatus::Open, Some(age)) if age >= self.settings.open_time => WindowStatus::Resting,
                (WindowStatus::Resting, Some(age)) if age < self.settings.rest_time => return None,
                _ => {
                    let summary = match st.history_summary(device_id, self.settings.lookback, now) {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("Window check for device {} could not read history: {}", device_id, e);
                            return None;
                        }
                    };
                    if summary.count < 2 {
                        return None;
                    }
                    let earliest = summary.earliest.and_then(|s| s.temperature)?;
                    let latest = summary.latest.and_then(|s| s.temperature)?;
                    let delta = latest - earliest;
                    let mode = st.zone_active_mode(device_id);
                    debug!(
                        "Window check for device {}: delta={:.2} over {} samples, mode={:?}",
                        device_id, delta, summary.count, mode
                    );
                    target_status(mode, delta, self.settings.threshold_c)
                }
            };
            (st.set_window_status(device_id, target, now), target, zone_name)
        };

        if target == WindowStatus::Open {
            if change.is_some() {
                info!("Open window detected in zone '{}' (device {})", zone_name, device_id);
                self.arm(device_id);
            }
        } else {
            self.cancel(device_id);
        }

        let change = change?;
        deliver(
            self.sink.as_ref(),
            &ChangeRecord::from_change(&change, ChangeOrigin::Detector, now),
        );
        Some(target)
    }

    fn arm(&self, device_id: DeviceId) {
        if self.shutdown.is_triggered() {
            debug!("Not arming window timer for device {} during shutdown", device_id);
            return;
        }
        self.cancel(device_id);

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = self.settings.open_time.to_std().unwrap_or(Duration::ZERO);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut shutdown = this.shutdown.clone();
            if shutdown.sleep(delay).await {
                this.expire(device_id, generation, Utc::now());
            }
        });
        debug!("Window timer armed for device {} ({}s)", device_id, delay.as_secs());
        self.timers.lock().insert(device_id, TimerEntry { generation, handle });
    }

    fn expire(&self, device_id: DeviceId, generation: u64, now: DateTime<Utc>) {
        {
            let mut timers = self.timers.lock();
            match timers.get(&device_id) {
                Some(t) if t.generation == generation => {
                    timers.remove(&device_id);
                }
                _ => return,
            }
        }

        let change = {
            let mut st = self.state.lock();
            match st.confirmed(device_id).map(|s| s.window()) {
                Some(WindowStatus::Open) => st.set_window_status(device_id, WindowStatus::Resting, now),
                _ => None,
            }
        };
        if let Some(change) = change {
            info!("Window alarm for device {} moved to resting", device_id);
            deliver(
                self.sink.as_ref(),
                &ChangeRecord::from_change(&change, ChangeOrigin::Detector, now),
            );
        }
    }

    pub fn cancel(&self, device_id: DeviceId) {
        if let Some(t) = self.timers.lock().remove(&device_id) {
            t.handle.abort();
            debug!("Window timer cancelled for device {}", device_id);
        }
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<TimerEntry> = self.timers.lock().drain().map(|(_, t)| t).collect();
        for t in &drained {
            t.handle.abort();
        }
        drained.len()
    }

    pub fn has_timer(&self, device_id: DeviceId) -> bool {
        self.timers.lock().contains_key(&device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryRepository;
    use crate::models::homekit::CharType;
    use crate::models::state::{Field, ZoneId};
    use crate::services::state::StateStore;
    use crate::shutdown;
    use crate::test_support::RecordingSink;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    struct Fixture {
        state: SharedState,
        sink: Arc<RecordingSink>,
        detector: WindowOpenDetector,
        trigger: shutdown::ShutdownTrigger,
        device: DeviceId,
    }

    fn fixture(heating_state: i64) -> Fixture {
        let repo = Arc::new(MemoryRepository::new());
        let mut store = StateStore::new(repo.clone(), 10, 30);
        let device = store.get_or_create_device("RU0001", Some(1), None).unwrap();
        repo.insert_zone(ZoneId(1), "Living", Some(device), Some(3));
        repo.assign_zone(device, ZoneId(1));
        store.reload_registry().unwrap();
        store.update(device, CharType::CurrentHeatingCoolingState, &json!(heating_state), ts(1000));

        let state = store.into_shared();
        let sink = Arc::new(RecordingSink::default());
        let (trigger, shutdown) = shutdown::channel();
        let detector = WindowOpenDetector::new(state.clone(), sink.clone(), WindowSettings::default(), shutdown);
        Fixture {
            state,
            sink,
            detector,
            trigger,
            device,
        }
    }

    fn temps(f: &Fixture, samples: &[(i64, f64)]) {
        let mut st = f.state.lock();
        for (t, v) in samples {
            st.update(f.device, CharType::CurrentTemperature, &json!(v), ts(*t));
        }
    }

    #[test]
    fn thresholds() {
        assert_eq!(target_status(Some(ZoneMode::Heat), -1.5, 1.0), WindowStatus::Open);
        assert_eq!(target_status(Some(ZoneMode::Heat), -0.7, 1.0), WindowStatus::Closed);
        assert_eq!(target_status(Some(ZoneMode::Cool), 1.5, 1.0), WindowStatus::Open);
        assert_eq!(target_status(Some(ZoneMode::Cool), 0.3, 1.0), WindowStatus::Closed);
        assert_eq!(target_status(None, -5.0, 1.0), WindowStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn heating_drop_opens_and_arms_timer() {
        let f = fixture(1);
        temps(&f, &[(1940, 22.5), (1990, 21.0)]);

        assert_eq!(f.detector.evaluate(f.device, ts(2000)), Some(WindowStatus::Open));
        assert!(f.detector.has_timer(f.device));
        assert_eq!(f.state.lock().confirmed(f.device).unwrap().window(), WindowStatus::Open);
        assert_eq!(f.sink.records().last().unwrap().field, Field::Window);
    }

    #[tokio::test(start_paused = true)]
    async fn small_drop_stays_closed_without_timer() {
        let f = fixture(1);
        temps(&f, &[(1940, 22.0), (1990, 21.3)]);

        f.detector.evaluate(f.device, ts(2000));
        assert!(!f.detector.has_timer(f.device));
        assert_eq!(f.state.lock().confirmed(f.device).unwrap().window(), WindowStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn cooling_rise_opens() {
        let f = fixture(2);
        temps(&f, &[(1940, 21.0), (1990, 22.5)]);
        assert_eq!(f.detector.evaluate(f.device, ts(2000)), Some(WindowStatus::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn single_sample_is_a_noop() {
        let f = fixture(1);
        temps(&f, &[(1990, 21.0)]);
        assert_eq!(f.detector.evaluate(f.device, ts(2000)), None);
        assert!(f.state.lock().confirmed(f.device).unwrap().value(Field::Window).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_expiry_moves_to_resting() {
        let f = fixture(1);
        temps(&f, &[(1940, 22.5), (1990, 21.0)]);
        f.detector.evaluate(f.device, ts(2000));

        tokio::time::sleep(Duration::from_secs(15 * 60 + 1)).await;

        assert!(!f.detector.has_timer(f.device));
        assert_eq!(f.state.lock().confirmed(f.device).unwrap().window(), WindowStatus::Resting);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_open_is_forced_to_resting() {
        let f = fixture(1);
        temps(&f, &[(1940, 22.5), (1990, 21.0)]);
        f.detector.evaluate(f.device, ts(2000));

        assert_eq!(f.detector.evaluate(f.device, ts(3000)), Some(WindowStatus::Resting));
        assert!(!f.detector.has_timer(f.device));
    }

    #[tokio::test(start_paused = true)]
    async fn resting_holds_then_recomputes() {
        let f = fixture(1);
        f.state.lock().set_window_status(f.device, WindowStatus::Resting, ts(2000));
        temps(&f, &[(2400, 22.0), (2500, 22.1)]);

        assert_eq!(f.detector.evaluate(f.device, ts(2300)), None);
        assert_eq!(f.detector.evaluate(f.device, ts(2000 + 15 * 60)), Some(WindowStatus::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_cancels_pending_timer() {
        let f = fixture(1);
        temps(&f, &[(1940, 22.5), (1990, 21.0)]);
        f.detector.evaluate(f.device, ts(2000));
        assert!(f.detector.has_timer(f.device));

        temps(&f, &[(2100, 22.6)]);
        assert_eq!(f.detector.evaluate(f.device, ts(2110)), Some(WindowStatus::Closed));
        assert!(!f.detector.has_timer(f.device));
    }

    #[tokio::test(start_paused = true)]
    async fn no_timers_after_shutdown() {
        let f = fixture(1);
        f.trigger.trigger();
        temps(&f, &[(1940, 22.5), (1990, 21.0)]);
        assert_eq!(f.detector.evaluate(f.device, ts(2000)), Some(WindowStatus::Open));
        assert!(!f.detector.has_timer(f.device));
    }
}
