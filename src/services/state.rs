//! Canonical per-device state.
//!
//! Owns the in-memory device states, the bucket snapshots used to decide
//! whether a history row must be written, the optimistic overlays for local
//! writes, and the device/zone registry caches. All history persistence goes
//! through the injected [`Repository`]; persistence failures are logged and
//! never roll back the in-memory update.

use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::db::models::{Device, HistoryRecord, NewDevice, Zone};
use crate::db::repo::{Repository, StoreError};
use crate::models::homekit::{Accessory, CharType, DeviceType};
use crate::models::state::{
    DeviceId, DeviceState, Field, FieldChange, FieldMap, FieldValue, WindowStatus, ZoneId, ZoneMode,
};
use crate::utils::serde_enum_name;

pub type SharedState = Arc<Mutex<StateStore>>;

#[derive(Debug, Clone)]
struct BucketSnapshot {
    bucket: i64,
    fields: FieldMap,
}

#[derive(Debug, Clone)]
struct Overlay {
    fields: FieldMap,
    set_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub fields: FieldMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistorySample {
    pub at: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub window: Option<i64>,
    pub window_lastupdate: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistorySummary {
    pub count: usize,
    pub earliest: Option<HistorySample>,
    pub latest: Option<HistorySample>,
}

pub struct StateStore {
    repo: Arc<dyn Repository>,
    bucket_secs: i64,
    optimistic_timeout: TimeDelta,
    states: HashMap<DeviceId, DeviceState>,
    snapshots: HashMap<DeviceId, BucketSnapshot>,
    overlays: HashMap<DeviceId, Overlay>,
    devices: BTreeMap<DeviceId, Device>,
    by_serial: HashMap<String, DeviceId>,
    by_aid: HashMap<u64, DeviceId>,
    zones: BTreeMap<ZoneId, Zone>,
}

impl StateStore {
    pub fn new(repo: Arc<dyn Repository>, bucket_secs: u64, optimistic_timeout_secs: u64) -> Self {
        StateStore {
            repo,
            bucket_secs: bucket_secs.max(1) as i64,
            optimistic_timeout: TimeDelta::seconds(optimistic_timeout_secs as i64),
            states: HashMap::new(),
            snapshots: HashMap::new(),
            overlays: HashMap::new(),
            devices: BTreeMap::new(),
            by_serial: HashMap::new(),
            by_aid: HashMap::new(),
            zones: BTreeMap::new(),
        }
    }

    pub fn into_shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    fn bucket_of(&self, ts: DateTime<Utc>) -> i64 {
        ts.timestamp().div_euclid(self.bucket_secs)
    }

    // =====================
    // State reads and writes
    // =====================

    /// Merged view: real state with any unexpired overlay fields substituted.
    pub fn get(&self, device_id: DeviceId, now: DateTime<Utc>) -> Option<DeviceState> {
        let overlay = self.overlays.get(&device_id).filter(|o| now - o.set_at < self.optimistic_timeout);
        let mut merged = match (self.states.get(&device_id), overlay) {
            (Some(s), _) => s.clone(),
            (None, Some(_)) => DeviceState::default(),
            (None, None) => return None,
        };
        if let Some(o) = overlay {
            merged.fields.extend(o.fields.iter().map(|(f, v)| (*f, *v)));
        }
        Some(merged)
    }

    /// Confirmed state only, ignoring any overlay.
    pub fn confirmed(&self, device_id: DeviceId) -> Option<&DeviceState> {
        self.states.get(&device_id)
    }

    pub fn update(
        &mut self,
        device_id: DeviceId,
        char_type: CharType,
        raw: &serde_json::Value,
        ts: DateTime<Utc>,
    ) -> Option<FieldChange> {
        let field = char_type.field();
        let Some(new) = field.coerce(raw) else {
            debug!("Ignoring {:?} payload {} for device {}: not a {} value", char_type, raw, device_id, field);
            return None;
        };
        self.set_field(device_id, field, new, ts)
    }

    /// Apply one field value directly; returns `None` when it is unchanged.
    pub fn set_field(
        &mut self,
        device_id: DeviceId,
        field: Field,
        new: FieldValue,
        ts: DateTime<Utc>,
    ) -> Option<FieldChange> {
        let state = self.states.entry(device_id).or_default();
        let old = state.value(field);
        if old == Some(new) {
            return None;
        }
        state.fields.insert(field, new);
        state.last_update = Some(ts);

        self.save_history(device_id, ts, false);
        Some(FieldChange {
            device_id,
            field,
            old,
            new,
        })
    }

    pub fn set_window_status(
        &mut self,
        device_id: DeviceId,
        status: WindowStatus,
        now: DateTime<Utc>,
    ) -> Option<FieldChange> {
        let state = self.states.entry(device_id).or_default();
        let new = FieldValue::Int(status.code());
        let old = state.value(Field::Window);
        if old == Some(new) {
            return None;
        }
        state.fields.insert(Field::Window, new);
        state.window_lastupdate = Some(now);
        state.last_update = Some(now);
        info!("Device {} window status -> {:?}", device_id, status);

        self.save_history(device_id, now, false);
        Some(FieldChange {
            device_id,
            field: Field::Window,
            old,
            new,
        })
    }

    fn save_history(&mut self, device_id: DeviceId, ts: DateTime<Utc>, force: bool) {
        let Some(state) = self.states.get(&device_id) else { return };
        let snapshot = self.snapshots.get(&device_id);
        if !force && snapshot.is_some_and(|s| s.fields == state.fields) {
            return;
        }

        // never reopen a bucket older than the one last written
        let bucket = snapshot.map_or(self.bucket_of(ts), |s| s.bucket.max(self.bucket_of(ts)));
        let record = HistoryRecord {
            device_id,
            bucket,
            recorded_at: ts,
            fields: state.fields.clone(),
            window_lastupdate: state.window_lastupdate,
        };
        match self.repo.upsert_history(&record) {
            Ok(()) => {
                self.snapshots.insert(
                    device_id,
                    BucketSnapshot {
                        bucket,
                        fields: record.fields,
                    },
                );
            }
            Err(e) => warn!("Saving history for device {} failed: {}", device_id, e),
        }
    }

    /// Write the current state of every device regardless of the snapshot.
    pub fn flush_all(&mut self, ts: DateTime<Utc>) -> usize {
        let ids: Vec<DeviceId> = self.states.keys().copied().collect();
        for id in &ids {
            self.save_history(*id, ts, true);
        }
        ids.len()
    }

    // =====================
    // Optimistic overlay
    // =====================

    pub fn set_optimistic(&mut self, device_id: DeviceId, fields: FieldMap, ts: DateTime<Utc>) {
        debug!("Optimistic state for device {}: {:?}", device_id, fields);
        match self.overlays.get_mut(&device_id) {
            Some(o) => {
                o.fields.extend(fields);
                o.set_at = ts;
            }
            None => {
                self.overlays.insert(device_id, Overlay { fields, set_at: ts });
            }
        }
    }

    /// Drop the overlay; returns the number of fields the device contradicted.
    pub fn clear_optimistic(&mut self, device_id: DeviceId) -> usize {
        let Some(overlay) = self.overlays.remove(&device_id) else { return 0 };
        let actual = self.states.get(&device_id);
        let mut mismatches = 0;
        for (field, predicted) in &overlay.fields {
            let Some(confirmed) = actual.and_then(|s| s.value(*field)) else { continue };
            if confirmed != *predicted {
                info!(
                    "Optimistic state was overridden by device {}: {}: predicted={}, actual={}",
                    device_id, field, predicted, confirmed
                );
                mismatches += 1;
            }
        }
        debug!("Cleared optimistic state for device {}", device_id);
        mismatches
    }

    pub fn overlay_covers(&self, device_id: DeviceId, field: Field, now: DateTime<Utc>) -> bool {
        self.overlays
            .get(&device_id)
            .is_some_and(|o| now - o.set_at < self.optimistic_timeout && o.fields.contains_key(&field))
    }

    pub fn prune_expired_overlays(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<DeviceId> = self
            .overlays
            .iter()
            .filter(|(_, o)| now - o.set_at >= self.optimistic_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.clear_optimistic(*id);
        }
        expired.len()
    }

    // =====================
    // History queries
    // =====================

    pub fn query_history(
        &self,
        device_id: DeviceId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let inverted = matches!((start, end), (Some(s), Some(e)) if s > e);
        if inverted || limit <= 0 {
            return Ok(Vec::new());
        }
        let rows = self.repo.history(device_id, start, end, limit, offset.max(0))?;
        Ok(rows
            .into_iter()
            .map(|r| HistoryEntry {
                at: r.recorded_at,
                fields: r.fields,
            })
            .collect())
    }

    /// Temperature samples within the trailing `age`; rows without a
    /// temperature reading are not samples.
    pub fn history_summary(
        &self,
        device_id: DeviceId,
        age: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<HistorySummary, StoreError> {
        let rows = self.repo.history(device_id, Some(now - age), None, i64::MAX, 0)?;
        let samples: Vec<HistorySample> = rows
            .iter()
            .filter_map(|r| {
                let temperature = r.fields.get(&Field::CurrentTemperature)?.as_f64();
                Some(HistorySample {
                    at: r.recorded_at,
                    temperature: Some(temperature),
                    window: r.fields.get(&Field::Window).map(|v| v.as_i64()),
                    window_lastupdate: r.window_lastupdate,
                })
            })
            .collect();
        Ok(HistorySummary {
            count: samples.len(),
            latest: samples.first().cloned(),
            earliest: samples.last().cloned(),
        })
    }

    /// Rebuild states and snapshots from the newest history bucket per device.
    pub fn restore(&mut self) -> Result<usize, StoreError> {
        let latest = self.repo.latest_history()?;
        for rec in &latest {
            self.states.insert(
                rec.device_id,
                DeviceState {
                    fields: rec.fields.clone(),
                    window_lastupdate: rec.window_lastupdate,
                    last_update: Some(rec.recorded_at),
                },
            );
            self.snapshots.insert(
                rec.device_id,
                BucketSnapshot {
                    bucket: rec.bucket,
                    fields: rec.fields.clone(),
                },
            );
        }
        Ok(latest.len())
    }

    // =====================
    // Registry
    // =====================

    pub fn reload_registry(&mut self) -> Result<(), StoreError> {
        let devices = self.repo.devices()?;
        let zones = self.repo.zones()?;

        self.devices.clear();
        self.by_serial.clear();
        self.by_aid.clear();
        for d in devices {
            self.index_device(d);
        }
        self.zones = zones.into_iter().map(|z| (z.id(), z)).collect();
        Ok(())
    }

    pub fn reload_zones(&mut self) -> Result<(), StoreError> {
        self.zones = self.repo.zones()?.into_iter().map(|z| (z.id(), z)).collect();
        Ok(())
    }

    fn index_device(&mut self, d: Device) {
        let id = d.id();
        if let Some(prev) = self.devices.get(&id).and_then(Device::instance_ref) {
            if Some(prev) != d.instance_ref() {
                self.by_aid.remove(&prev);
            }
        }
        if let Some(aid) = d.instance_ref() {
            self.by_aid.insert(aid, id);
        }
        self.by_serial.insert(d.serial_number.clone(), id);
        self.devices.insert(id, d);
    }

    /// Stable id for a serial number; the instance ref is updated in place.
    pub fn get_or_create_device(
        &mut self,
        serial: &str,
        aid: Option<u64>,
        accessory: Option<&Accessory>,
    ) -> Result<DeviceId, StoreError> {
        let aid = aid.filter(|a| *a > 0);
        if let Some(id) = self.by_serial.get(serial).copied() {
            let current = self.devices.get(&id).and_then(Device::instance_ref);
            if aid.is_none() || current == aid {
                return Ok(id);
            }
        }

        let device_type = DeviceType::infer(serial, accessory);
        let new = NewDevice {
            serial_number: serial.to_string(),
            aid: aid.map(|a| a as i64),
            device_type: serde_enum_name(&device_type).unwrap_or_else(|| "unknown".to_string()),
            name: accessory.and_then(Accessory::name),
            model: accessory.and_then(Accessory::model),
            manufacturer: accessory.and_then(Accessory::manufacturer),
        };
        let device = self.repo.upsert_device(&new)?;
        let id = device.id();
        self.index_device(device);
        Ok(id)
    }

    pub fn device(&self, device_id: DeviceId) -> Option<&Device> {
        self.devices.get(&device_id)
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.keys().copied().collect()
    }

    pub fn device_by_aid(&self, aid: u64) -> Option<DeviceId> {
        self.by_aid.get(&aid).copied()
    }

    pub fn zone(&self, zone_id: ZoneId) -> Option<&Zone> {
        self.zones.get(&zone_id)
    }

    pub fn zone_of(&self, device_id: DeviceId) -> Option<&Zone> {
        self.devices
            .get(&device_id)
            .and_then(Device::zone)
            .and_then(|z| self.zones.get(&z))
    }

    pub fn is_zone_leader(&self, device_id: DeviceId) -> bool {
        self.zone_of(device_id).is_some_and(|z| z.leader() == Some(device_id))
    }

    pub fn zone_devices(&self, zone_id: ZoneId) -> Vec<DeviceId> {
        self.devices
            .values()
            .filter(|d| d.zone() == Some(zone_id))
            .map(Device::id)
            .collect()
    }

    /// Active thermal mode for a zone leader, honouring circuit drivers.
    pub fn zone_active_mode(&self, leader: DeviceId) -> Option<ZoneMode> {
        let own = self.states.get(&leader).and_then(DeviceState::active_mode);
        let Some(zone) = self.zone_of(leader).filter(|z| z.is_circuit_driver) else {
            return own;
        };
        let zone_id = zone.id();
        own.or_else(|| {
            self.zone_devices(zone_id)
                .into_iter()
                .filter_map(|id| self.states.get(&id).and_then(DeviceState::active_mode))
                .find(|m| *m == ZoneMode::Heat)
        })
    }
}

/// Zone accessors the scheduler consumes.
pub trait ZoneDirectory: Send + Sync {
    fn tracked_mode(&self, zone_id: ZoneId) -> Option<ZoneMode>;
    fn leader(&self, zone_id: ZoneId) -> Option<DeviceId>;
    fn refresh(&self);
}

impl ZoneDirectory for Mutex<StateStore> {
    fn tracked_mode(&self, zone_id: ZoneId) -> Option<ZoneMode> {
        self.lock()
            .zone(zone_id)
            .and_then(|z| z.tracked_mode)
            .and_then(ZoneMode::from_code)
    }

    fn leader(&self, zone_id: ZoneId) -> Option<DeviceId> {
        self.lock().zone(zone_id).and_then(Zone::leader)
    }

    fn refresh(&self) {
        if let Err(e) = self.lock().reload_zones() {
            warn!("Reloading zones failed: {}", e);
        }
    }
}
