//! Single entry point for raw characteristic updates from every source.

use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::client::{RawUpdate, UpdateSource};
use crate::models::homekit::{CharKey, CharType};
use crate::models::state::FieldChange;
use crate::services::control::ScheduledWrites;
use crate::services::notify::{deliver, ChangeOrigin, ChangeRecord, NotificationSink};
use crate::services::refs::AccessoryCache;
use crate::services::state::SharedState;
use crate::services::window::WindowOpenDetector;
use crate::shutdown::Shutdown;

#[derive(Debug, Default)]
pub struct ChangeCounters {
    events_received: AtomicU64,
    polling_changes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub events_received: u64,
    pub polling_changes: u64,
}

impl ChangeCounters {
    fn record(&self, source: UpdateSource) {
        let counter = match source {
            UpdateSource::Event => &self.events_received,
            UpdateSource::FastPoll | UpdateSource::Polling => &self.polling_changes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            polling_changes: self.polling_changes.load(Ordering::Relaxed),
        }
    }
}

pub struct ChangeReconciler {
    state: SharedState,
    accessories: AccessoryCache,
    detector: WindowOpenDetector,
    sink: Arc<dyn NotificationSink>,
    scheduled: ScheduledWrites,
    char_map: Mutex<HashMap<CharKey, CharType>>,
    last_values: Mutex<HashMap<CharKey, Value>>,
    counters: ChangeCounters,
}

impl ChangeReconciler {
    pub fn new(
        state: SharedState,
        accessories: AccessoryCache,
        detector: WindowOpenDetector,
        sink: Arc<dyn NotificationSink>,
        scheduled: ScheduledWrites,
    ) -> Self {
        ChangeReconciler {
            state,
            accessories,
            detector,
            sink,
            scheduled,
            char_map: Mutex::new(HashMap::new()),
            last_values: Mutex::new(HashMap::new()),
            counters: ChangeCounters::default(),
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    fn resolve(&self, key: CharKey) -> Option<CharType> {
        if let Some(t) = self.char_map.lock().get(&key) {
            return Some(*t);
        }
        let found = self.accessories.char_type(key)?;
        self.char_map.lock().insert(key, found);
        Some(found)
    }

    /// Returns true when the value differs from the last one seen for `key`.
    fn is_new_value(&self, key: CharKey, value: &Value) -> bool {
        let mut last = self.last_values.lock();
        if last.get(&key) == Some(value) {
            return false;
        }
        last.insert(key, value.clone());
        true
    }

    pub fn handle(&self, update: RawUpdate, now: DateTime<Utc>) -> Option<FieldChange> {
        let (Some(aid), Some(iid), Some(value)) = (update.aid, update.iid, update.value) else {
            return None;
        };
        if value.is_null() {
            return None;
        }
        let key = CharKey::new(aid, iid);

        let Some(char_type) = self.resolve(key) else {
            debug!("Unknown characteristic {} ({}), ignoring", key, update.source.label());
            return None;
        };

        let (change, is_leader, serial, zone_id) = {
            let mut st = self.state.lock();
            let Some(device_id) = st.device_by_aid(aid) else {
                debug!("No device registered for accessory {}, ignoring {}", aid, key);
                return None;
            };
            // only remembered once it can reach a device
            if !self.is_new_value(key, &value) {
                return None;
            }
            let change = st.update(device_id, char_type, &value, now)?;
            if st.overlay_covers(device_id, change.field, now) {
                st.clear_optimistic(device_id);
            }
            let device = st.device(device_id);
            (
                change,
                st.is_zone_leader(device_id),
                device.map(|d| d.serial_number.clone()),
                device.and_then(|d| d.zone()),
            )
        };

        self.counters.record(update.source);
        debug!(
            "[{}] device {} {}: {:?} -> {}",
            update.source.label(),
            change.device_id,
            change.field,
            change.old,
            change.new
        );

        let origin = if self.scheduled.is_marked(change.device_id, now) {
            ChangeOrigin::Scheduled
        } else {
            ChangeOrigin::Device
        };
        let mut record = ChangeRecord::from_change(&change, origin, now);
        record.serial_number = serial;
        record.zone_id = zone_id;
        record.source = Some(update.source);
        deliver(self.sink.as_ref(), &record);

        if char_type == CharType::CurrentTemperature && is_leader {
            self.detector.evaluate(change.device_id, now);
        }
        Some(change)
    }

    /// Feed subscription events into `handle` until the stream closes or shutdown.
    pub async fn pump(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<RawUpdate>, mut shutdown: Shutdown) {
        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                update = events.recv() => match update {
                    Some(update) => {
                        self.handle(update, Utc::now());
                    }
                    None => {
                        debug!("Event stream closed");
                        break;
                    }
                },
            }
        }
        info!("Event pump stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryRepository;
    use crate::models::homekit::parse_accessories;
    use crate::models::state::{DeviceId, Field, FieldMap, FieldValue, WindowStatus, ZoneId};
    use crate::services::state::StateStore;
    use crate::services::window::WindowSettings;
    use crate::shutdown;
    use crate::client::DeviceChannel;
    use crate::test_support::{FakeChannel, RecordingSink};
    use chrono::TimeZone;
    use serde_json::json;

    const DOC: &str = r#"[
        {"aid":1,"services":[{"type":"4A","characteristics":[
            {"iid":10,"type":"11","perms":["pr","ev"]},
            {"iid":11,"type":"35","perms":["pr","pw","ev"]},
            {"iid":12,"type":"0F","perms":["pr","ev"]}
        ]}]},
        {"aid":2,"services":[{"type":"8A","characteristics":[
            {"iid":10,"type":"11","perms":["pr","ev"]}
        ]}]},
        {"aid":3,"services":[{"type":"8A","characteristics":[
            {"iid":10,"type":"11","perms":["pr","ev"]}
        ]}]}
    ]"#;

    struct Fixture {
        state: SharedState,
        sink: Arc<RecordingSink>,
        reconciler: ChangeReconciler,
        scheduled: ScheduledWrites,
        leader: DeviceId,
        sensor: DeviceId,
        _trigger: shutdown::ShutdownTrigger,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(MemoryRepository::new());
        let mut store = StateStore::new(repo.clone(), 10, 30);
        let leader = store.get_or_create_device("RU0001", Some(1), None).unwrap();
        let sensor = store.get_or_create_device("SENSOR1", Some(2), None).unwrap();
        repo.insert_zone(ZoneId(1), "Living", Some(leader), Some(3));
        repo.assign_zone(leader, ZoneId(1));
        repo.assign_zone(sensor, ZoneId(1));
        store.reload_registry().unwrap();

        let state = store.into_shared();
        let sink = Arc::new(RecordingSink::default());
        let (trigger, shutdown) = shutdown::channel();
        let detector = WindowOpenDetector::new(state.clone(), sink.clone(), WindowSettings::default(), shutdown);
        let scheduled = ScheduledWrites::default();
        let reconciler = ChangeReconciler::new(
            state.clone(),
            AccessoryCache::new(parse_accessories(DOC).unwrap()),
            detector,
            sink.clone(),
            scheduled.clone(),
        );
        Fixture {
            state,
            sink,
            reconciler,
            scheduled,
            leader,
            sensor,
            _trigger: trigger,
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn raw(aid: u64, iid: u64, value: Value, source: UpdateSource) -> RawUpdate {
        RawUpdate::new(CharKey::new(aid, iid), value, source)
    }

    #[tokio::test]
    async fn malformed_updates_are_dropped() {
        let f = fixture();
        let partial = RawUpdate {
            aid: Some(1),
            iid: None,
            value: Some(json!(20.0)),
            source: UpdateSource::Event,
        };
        assert!(f.reconciler.handle(partial, ts(0)).is_none());
        assert!(f.reconciler.handle(raw(1, 10, Value::Null, UpdateSource::Event), ts(0)).is_none());
        assert!(f.reconciler.handle(raw(1, 99, json!(1), UpdateSource::Event), ts(0)).is_none());
        assert!(f.sink.records().is_empty());
    }

    #[tokio::test]
    async fn duplicate_values_are_dropped_across_sources() {
        let f = fixture();
        assert!(f.reconciler.handle(raw(1, 11, json!(21.0), UpdateSource::Event), ts(100)).is_some());
        assert!(f.reconciler.handle(raw(1, 11, json!(21.0), UpdateSource::Polling), ts(110)).is_none());
        assert!(f.reconciler.handle(raw(1, 11, json!(21.5), UpdateSource::FastPoll), ts(120)).is_some());

        assert_eq!(
            f.reconciler.counters(),
            CounterSnapshot {
                events_received: 1,
                polling_changes: 1
            }
        );
        let records = f.sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].source, Some(UpdateSource::FastPoll));
        assert_eq!(records[1].serial_number.as_deref(), Some("RU0001"));
        assert_eq!(records[1].zone_id, Some(ZoneId(1)));
    }

    #[tokio::test]
    async fn values_for_unregistered_accessories_are_not_remembered() {
        let f = fixture();
        assert!(f.reconciler.handle(raw(3, 10, json!(21.0), UpdateSource::Event), ts(100)).is_none());

        let late = f.state.lock().get_or_create_device("SENSOR3", Some(3), None).unwrap();
        let change = f
            .reconciler
            .handle(raw(3, 10, json!(21.0), UpdateSource::Polling), ts(110))
            .expect("first value after registration is applied");
        assert_eq!(change.device_id, late);
        let stored = f.state.lock().get(late, ts(111)).and_then(|d| d.current_temperature());
        assert_eq!(stored, Some(21.0));
    }

    #[tokio::test]
    async fn confirmation_clears_overlay() {
        let f = fixture();
        f.state.lock().set_optimistic(
            f.leader,
            FieldMap::from([(Field::TargetTemperature, FieldValue::Float(22.0))]),
            ts(100),
        );
        f.reconciler.handle(raw(1, 11, json!(22.0), UpdateSource::Event), ts(105));
        assert!(!f.state.lock().overlay_covers(f.leader, Field::TargetTemperature, ts(106)));
    }

    #[tokio::test]
    async fn scheduled_writes_are_tagged() {
        let f = fixture();
        f.scheduled.mark(f.leader, ts(100));
        f.reconciler.handle(raw(1, 11, json!(19.0), UpdateSource::Event), ts(110));
        f.reconciler.handle(raw(1, 11, json!(20.0), UpdateSource::Event), ts(200));
        let origins: Vec<_> = f.sink.records().iter().map(|r| r.origin).collect();
        assert_eq!(origins, vec![ChangeOrigin::Scheduled, ChangeOrigin::Device]);
    }

    #[tokio::test]
    async fn window_detection_runs_for_leader_temperature_only() {
        let f = fixture();
        f.reconciler.handle(raw(1, 12, json!(1), UpdateSource::Event), ts(1000));

        // a non-leader in the same zone never trips the detector
        f.reconciler.handle(raw(2, 10, json!(22.5), UpdateSource::Event), ts(1940));
        f.reconciler.handle(raw(2, 10, json!(21.0), UpdateSource::Event), ts(1990));
        assert!(f.state.lock().confirmed(f.sensor).unwrap().value(Field::Window).is_none());

        f.reconciler.handle(raw(1, 10, json!(22.5), UpdateSource::Event), ts(1940));
        f.reconciler.handle(raw(1, 10, json!(21.0), UpdateSource::Polling), ts(1990));
        assert_eq!(f.state.lock().confirmed(f.leader).unwrap().window(), WindowStatus::Open);
    }

    #[tokio::test]
    async fn pump_forwards_events_until_shutdown() {
        let f = fixture();
        let reconciler = Arc::new(f.reconciler);
        let channel = FakeChannel::default();
        let (tx, rx) = mpsc::unbounded_channel();
        channel.subscribe(&[CharKey::new(1, 11)], tx).await.unwrap();

        let (trigger, stop) = shutdown::channel();
        let handle = tokio::spawn(reconciler.clone().pump(rx, stop));
        assert!(channel.emit(raw(1, 11, json!(23.0), UpdateSource::Event)));
        for _ in 0..10 {
            if reconciler.counters().events_received == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }

        trigger.trigger();
        handle.await.unwrap();
        assert_eq!(reconciler.counters().events_received, 1);
        assert_eq!(f.sink.records().len(), 1);
    }
}
