//! Diesel model structs for the device registry, bucketed state history and
//! the externally maintained zone/schedule tables.

use chrono::{DateTime, NaiveTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::state::{DeviceId, Field, FieldMap, FieldValue, ZoneId};
use crate::schema;

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::devices, primary_key(device_id))]
pub struct Device {
    pub device_id: i64,
    pub serial_number: String,
    pub aid: Option<i64>,
    pub device_type: String,
    pub name: Option<String>,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub zone_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    pub fn id(&self) -> DeviceId {
        DeviceId(self.device_id)
    }

    pub fn zone(&self) -> Option<ZoneId> {
        self.zone_id.map(ZoneId)
    }

    /// Accessory instance id, ignoring unset or zero references.
    pub fn instance_ref(&self) -> Option<u64> {
        self.aid.filter(|a| *a > 0).map(|a| a as u64)
    }
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::devices)]
pub struct NewDevice {
    pub serial_number: String,
    pub aid: Option<i64>,
    pub device_type: String,
    pub name: Option<String>,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::zones, primary_key(zone_id))]
pub struct Zone {
    pub zone_id: i64,
    pub name: String,
    pub leader_device_id: Option<i64>,
    pub is_circuit_driver: bool,
    pub tracked_mode: Option<i32>,
}

impl Zone {
    pub fn id(&self) -> ZoneId {
        ZoneId(self.zone_id)
    }

    pub fn leader(&self) -> Option<DeviceId> {
        self.leader_device_id.map(DeviceId)
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::zone_schedules)]
pub struct ScheduleRow {
    pub schedule_id: i64,
    pub zone_id: i64,
    pub schedule_type: i32,
    pub day_of_week: Option<i32>,
    pub day_type: Option<String>,
    pub start_time: NaiveTime,
    pub temperature: f64,
    pub enabled: bool,
}

/// One persisted history bucket, in domain form.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub device_id: DeviceId,
    pub bucket: i64,
    pub recorded_at: DateTime<Utc>,
    pub fields: FieldMap,
    pub window_lastupdate: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = schema::device_state_history, primary_key(device_id, bucket), treat_none_as_null = true)]
pub struct HistoryRow {
    pub device_id: i64,
    pub bucket: i64,
    pub recorded_at: DateTime<Utc>,
    pub current_temperature: Option<f64>,
    pub target_temperature: Option<f64>,
    pub current_heating_cooling_state: Option<i64>,
    pub target_heating_cooling_state: Option<i64>,
    pub heating_threshold_temperature: Option<f64>,
    pub cooling_threshold_temperature: Option<f64>,
    pub temperature_display_units: Option<i64>,
    pub battery_level: Option<i64>,
    pub status_low_battery: Option<i64>,
    pub humidity: Option<i64>,
    pub target_humidity: Option<i64>,
    pub active_state: Option<i64>,
    pub valve_position: Option<i64>,
    pub window: Option<i64>,
    pub window_lastupdate: Option<DateTime<Utc>>,
}

fn float(fields: &FieldMap, f: Field) -> Option<f64> {
    fields.get(&f).map(|v| v.as_f64())
}

fn int(fields: &FieldMap, f: Field) -> Option<i64> {
    fields.get(&f).map(|v| v.as_i64())
}

impl From<&HistoryRecord> for HistoryRow {
    fn from(r: &HistoryRecord) -> Self {
        let f = &r.fields;
        HistoryRow {
            device_id: r.device_id.0,
            bucket: r.bucket,
            recorded_at: r.recorded_at,
            current_temperature: float(f, Field::CurrentTemperature),
            target_temperature: float(f, Field::TargetTemperature),
            current_heating_cooling_state: int(f, Field::CurrentHeatingCoolingState),
            target_heating_cooling_state: int(f, Field::TargetHeatingCoolingState),
            heating_threshold_temperature: float(f, Field::HeatingThresholdTemperature),
            cooling_threshold_temperature: float(f, Field::CoolingThresholdTemperature),
            temperature_display_units: int(f, Field::TemperatureDisplayUnits),
            battery_level: int(f, Field::BatteryLevel),
            status_low_battery: int(f, Field::StatusLowBattery),
            humidity: int(f, Field::Humidity),
            target_humidity: int(f, Field::TargetHumidity),
            active_state: int(f, Field::ActiveState),
            valve_position: int(f, Field::ValvePosition),
            window: int(f, Field::Window),
            window_lastupdate: r.window_lastupdate,
        }
    }
}

impl From<HistoryRow> for HistoryRecord {
    fn from(row: HistoryRow) -> Self {
        let floats = [
            (Field::CurrentTemperature, row.current_temperature),
            (Field::TargetTemperature, row.target_temperature),
            (Field::HeatingThresholdTemperature, row.heating_threshold_temperature),
            (Field::CoolingThresholdTemperature, row.cooling_threshold_temperature),
        ];
        let ints = [
            (Field::CurrentHeatingCoolingState, row.current_heating_cooling_state),
            (Field::TargetHeatingCoolingState, row.target_heating_cooling_state),
            (Field::TemperatureDisplayUnits, row.temperature_display_units),
            (Field::BatteryLevel, row.battery_level),
            (Field::StatusLowBattery, row.status_low_battery),
            (Field::Humidity, row.humidity),
            (Field::TargetHumidity, row.target_humidity),
            (Field::ActiveState, row.active_state),
            (Field::ValvePosition, row.valve_position),
            (Field::Window, row.window),
        ];

        let mut fields = FieldMap::new();
        for (f, v) in floats {
            if let Some(v) = v {
                fields.insert(f, FieldValue::Float(v));
            }
        }
        for (f, v) in ints {
            if let Some(v) = v {
                fields.insert(f, FieldValue::Int(v));
            }
        }

        HistoryRecord {
            device_id: DeviceId(row.device_id),
            bucket: row.bucket,
            recorded_at: row.recorded_at,
            fields,
            window_lastupdate: row.window_lastupdate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn history_row_keeps_field_domains() {
        let mut fields = FieldMap::new();
        fields.insert(Field::CurrentTemperature, FieldValue::Float(20.5));
        fields.insert(Field::Humidity, FieldValue::Int(48));
        fields.insert(Field::Window, FieldValue::Int(1));
        let record = HistoryRecord {
            device_id: DeviceId(7),
            bucket: 170_000_000,
            recorded_at: Utc.timestamp_opt(1_700_000_003, 0).unwrap(),
            fields,
            window_lastupdate: None,
        };

        let row = HistoryRow::from(&record);
        assert_eq!(row.current_temperature, Some(20.5));
        assert_eq!(row.humidity, Some(48));
        assert_eq!(row.target_temperature, None);
        assert_eq!(HistoryRecord::from(row), record);
    }

    #[test]
    fn zero_aid_is_not_an_instance_ref() {
        let now = Utc::now();
        let mut d = Device {
            device_id: 1,
            serial_number: "RU1".into(),
            aid: Some(0),
            device_type: "thermostat".into(),
            name: None,
            model: None,
            manufacturer: None,
            zone_id: None,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(d.instance_ref(), None);
        d.aid = Some(221);
        assert_eq!(d.instance_ref(), Some(221));
    }
}
