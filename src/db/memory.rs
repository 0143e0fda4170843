use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;

use crate::db::models::{Device, HistoryRecord, NewDevice, ScheduleRow, Zone};
use crate::db::repo::{Repository, StoreError};
use crate::models::state::DeviceId;
#[cfg(test)]
use {crate::models::state::ZoneId, chrono::NaiveTime};

#[derive(Default)]
struct Tables {
    devices: BTreeMap<i64, Device>,
    zones: BTreeMap<i64, Zone>,
    history: BTreeMap<(i64, i64), HistoryRecord>,
    schedules: BTreeMap<i64, ScheduleRow>,
    config: BTreeMap<String, String>,
    next_device_id: i64,
}

/// Volatile repository with the same row semantics as the Postgres one.
#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Row setup the engine itself never performs; zones and schedules are
/// managed outside this process.
#[cfg(test)]
impl MemoryRepository {
    pub fn insert_zone(&self, zone_id: ZoneId, name: &str, leader: Option<DeviceId>, tracked_mode: Option<i32>) {
        self.tables.lock().zones.insert(
            zone_id.0,
            Zone {
                zone_id: zone_id.0,
                name: name.to_string(),
                leader_device_id: leader.map(|d| d.0),
                is_circuit_driver: false,
                tracked_mode,
            },
        );
    }

    pub fn set_circuit_driver(&self, zone_id: ZoneId, flag: bool) {
        if let Some(z) = self.tables.lock().zones.get_mut(&zone_id.0) {
            z.is_circuit_driver = flag;
        }
    }

    pub fn set_tracked_mode(&self, zone_id: ZoneId, mode: Option<i32>) {
        if let Some(z) = self.tables.lock().zones.get_mut(&zone_id.0) {
            z.tracked_mode = mode;
        }
    }

    pub fn assign_zone(&self, device_id: DeviceId, zone_id: ZoneId) {
        if let Some(d) = self.tables.lock().devices.get_mut(&device_id.0) {
            d.zone_id = Some(zone_id.0);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_schedule(
        &self,
        schedule_id: i64,
        zone_id: ZoneId,
        schedule_type: i32,
        day_of_week: Option<i32>,
        day_type: Option<&str>,
        start_time: NaiveTime,
        temperature: f64,
    ) {
        self.tables.lock().schedules.insert(
            schedule_id,
            ScheduleRow {
                schedule_id,
                zone_id: zone_id.0,
                schedule_type,
                day_of_week,
                day_type: day_type.map(str::to_string),
                start_time,
                temperature,
                enabled: true,
            },
        );
    }

    pub fn set_config(&self, key: &str, value: &str) {
        self.tables.lock().config.insert(key.to_string(), value.to_string());
    }

    pub fn history_len(&self, device_id: DeviceId) -> usize {
        self.tables
            .lock()
            .history
            .keys()
            .filter(|(d, _)| *d == device_id.0)
            .count()
    }
}

impl Repository for MemoryRepository {
    fn upsert_history(&self, record: &HistoryRecord) -> Result<(), StoreError> {
        self.tables
            .lock()
            .history
            .insert((record.device_id.0, record.bucket), record.clone());
        Ok(())
    }

    fn latest_history(&self) -> Result<Vec<HistoryRecord>, StoreError> {
        let tables = self.tables.lock();
        let mut latest: BTreeMap<i64, &HistoryRecord> = BTreeMap::new();
        for ((device, _), rec) in tables.history.iter() {
            // keys iterate in bucket order, so the last one wins
            latest.insert(*device, rec);
        }
        Ok(latest.into_values().cloned().collect())
    }

    fn history(
        &self,
        device_id: DeviceId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        let tables = self.tables.lock();
        let mut rows: Vec<HistoryRecord> = tables
            .history
            .range((device_id.0, i64::MIN)..=(device_id.0, i64::MAX))
            .map(|(_, r)| r)
            .filter(|r| start.is_none_or(|s| r.recorded_at >= s))
            .filter(|r| end.is_none_or(|e| r.recorded_at <= e))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at).then(b.bucket.cmp(&a.bucket)));
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    fn devices(&self) -> Result<Vec<Device>, StoreError> {
        Ok(self.tables.lock().devices.values().cloned().collect())
    }

    fn upsert_device(&self, new: &NewDevice) -> Result<Device, StoreError> {
        let mut tables = self.tables.lock();
        let now = Utc::now();
        if let Some(dev) = tables
            .devices
            .values_mut()
            .find(|d| d.serial_number == new.serial_number)
        {
            if new.aid.is_some() && dev.aid != new.aid {
                dev.aid = new.aid;
                dev.updated_at = now;
            }
            return Ok(dev.clone());
        }

        tables.next_device_id += 1;
        let dev = Device {
            device_id: tables.next_device_id,
            serial_number: new.serial_number.clone(),
            aid: new.aid,
            device_type: new.device_type.clone(),
            name: new.name.clone(),
            model: new.model.clone(),
            manufacturer: new.manufacturer.clone(),
            zone_id: None,
            created_at: now,
            updated_at: now,
        };
        tables.devices.insert(dev.device_id, dev.clone());
        Ok(dev)
    }

    fn zones(&self) -> Result<Vec<Zone>, StoreError> {
        Ok(self.tables.lock().zones.values().cloned().collect())
    }

    fn enabled_schedules(&self) -> Result<Vec<ScheduleRow>, StoreError> {
        Ok(self
            .tables
            .lock()
            .schedules
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect())
    }

    fn config_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.tables.lock().config.get(key).cloned())
    }
}
