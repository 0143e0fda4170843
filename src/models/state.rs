use chrono::{DateTime, Utc};
use core::fmt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub i64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId(pub i64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tracked device-state fields. Every history row is a snapshot of these.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    CurrentTemperature,
    TargetTemperature,
    CurrentHeatingCoolingState,
    TargetHeatingCoolingState,
    HeatingThresholdTemperature,
    CoolingThresholdTemperature,
    TemperatureDisplayUnits,
    BatteryLevel,
    StatusLowBattery,
    Humidity,
    TargetHumidity,
    ActiveState,
    ValvePosition,
    Window,
}

impl Field {
    pub const ALL: [Field; 14] = [
        Field::CurrentTemperature,
        Field::TargetTemperature,
        Field::CurrentHeatingCoolingState,
        Field::TargetHeatingCoolingState,
        Field::HeatingThresholdTemperature,
        Field::CoolingThresholdTemperature,
        Field::TemperatureDisplayUnits,
        Field::BatteryLevel,
        Field::StatusLowBattery,
        Field::Humidity,
        Field::TargetHumidity,
        Field::ActiveState,
        Field::ValvePosition,
        Field::Window,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::CurrentTemperature => "current_temperature",
            Field::TargetTemperature => "target_temperature",
            Field::CurrentHeatingCoolingState => "current_heating_cooling_state",
            Field::TargetHeatingCoolingState => "target_heating_cooling_state",
            Field::HeatingThresholdTemperature => "heating_threshold_temperature",
            Field::CoolingThresholdTemperature => "cooling_threshold_temperature",
            Field::TemperatureDisplayUnits => "temperature_display_units",
            Field::BatteryLevel => "battery_level",
            Field::StatusLowBattery => "status_low_battery",
            Field::Humidity => "humidity",
            Field::TargetHumidity => "target_humidity",
            Field::ActiveState => "active_state",
            Field::ValvePosition => "valve_position",
            Field::Window => "window",
        }
    }

    pub fn from_name(name: &str) -> Option<Field> {
        Field::ALL.into_iter().find(|f| f.name() == name)
    }

    /// Temperatures are continuous; everything else is an integer code or percentage.
    pub fn is_continuous(self) -> bool {
        matches!(
            self,
            Field::CurrentTemperature
                | Field::TargetTemperature
                | Field::HeatingThresholdTemperature
                | Field::CoolingThresholdTemperature
        )
    }

    /// Coerce a raw characteristic payload into this field's value domain.
    pub fn coerce(self, raw: &Value) -> Option<FieldValue> {
        if self.is_continuous() {
            return raw.as_f64().map(FieldValue::Float);
        }
        match raw {
            Value::Bool(b) => Some(FieldValue::Int(i64::from(*b))),
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.round() as i64))
                .map(FieldValue::Int),
            _ => None,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
}

impl FieldValue {
    pub fn as_f64(self) -> f64 {
        match self {
            FieldValue::Int(v) => v as f64,
            FieldValue::Float(v) => v,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            FieldValue::Int(v) => v,
            FieldValue::Float(v) => v.round() as i64,
        }
    }

    pub fn to_json(self) -> Value {
        match self {
            FieldValue::Int(v) => Value::from(v),
            FieldValue::Float(v) => Value::from(v),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{:?}", v),
        }
    }
}

pub type FieldMap = BTreeMap<Field, FieldValue>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowStatus {
    Closed,
    Open,
    Resting,
}

impl WindowStatus {
    pub fn code(self) -> i64 {
        match self {
            WindowStatus::Closed => 0,
            WindowStatus::Open => 1,
            WindowStatus::Resting => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<WindowStatus> {
        match code {
            0 => Some(WindowStatus::Closed),
            1 => Some(WindowStatus::Open),
            2 => Some(WindowStatus::Resting),
            _ => None,
        }
    }
}

/// HAP heating/cooling state codes, shared by current and target mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZoneMode {
    Off,
    Heat,
    Cool,
    Auto,
}

impl ZoneMode {
    pub fn code(self) -> i32 {
        match self {
            ZoneMode::Off => 0,
            ZoneMode::Heat => 1,
            ZoneMode::Cool => 2,
            ZoneMode::Auto => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<ZoneMode> {
        match code {
            0 => Some(ZoneMode::Off),
            1 => Some(ZoneMode::Heat),
            2 => Some(ZoneMode::Cool),
            3 => Some(ZoneMode::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    pub fields: FieldMap,
    pub window_lastupdate: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
}

impl DeviceState {
    pub fn value(&self, field: Field) -> Option<FieldValue> {
        self.fields.get(&field).copied()
    }

    pub fn current_temperature(&self) -> Option<f64> {
        self.value(Field::CurrentTemperature).map(FieldValue::as_f64)
    }

    pub fn window(&self) -> WindowStatus {
        self.value(Field::Window)
            .and_then(|v| WindowStatus::from_code(v.as_i64()))
            .unwrap_or(WindowStatus::Closed)
    }

    /// Active thermal mode as reported by the device, if it is running at all.
    pub fn active_mode(&self) -> Option<ZoneMode> {
        self.value(Field::CurrentHeatingCoolingState)
            .and_then(|v| ZoneMode::from_code(v.as_i64() as i32))
            .filter(|m| matches!(m, ZoneMode::Heat | ZoneMode::Cool))
    }
}

/// One applied field change, as returned by `StateStore::update`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub device_id: DeviceId,
    pub field: Field,
    pub old: Option<FieldValue>,
    pub new: FieldValue,
}
