//! Accessory metadata as exposed by a HomeKit bridge, plus the closed catalogue
//! of characteristic types this engine tracks.
//!
//! Notes
//! - Type identifiers arrive either as full UUIDs (any case) or as HAP short
//!   forms such as `"11"`. Both normalise to the upper-case full form.
//! - Only Apple-base UUIDs resolve to a [`CharType`]; vendor UUIDs are kept
//!   verbatim but never tracked.

use core::fmt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::state::Field;

const HAP_BASE_SUFFIX: &str = "-0000-1000-8000-0026BB765291";

// Service short codes
pub const SERVICE_ACCESSORY_INFORMATION: u32 = 0x3E;
pub const SERVICE_THERMOSTAT: u32 = 0x4A;
pub const SERVICE_TEMPERATURE_SENSOR: u32 = 0x8A;
pub const SERVICE_HUMIDITY_SENSOR: u32 = 0x82;

// AccessoryInformation characteristic short codes
const INFO_MANUFACTURER: u32 = 0x20;
const INFO_MODEL: u32 = 0x21;
const INFO_NAME: u32 = 0x23;
const INFO_SERIAL_NUMBER: u32 = 0x30;

// =====================
// Identifiers
// =====================

/// Address of one characteristic: accessory instance id + characteristic instance id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharKey {
    pub aid: u64,
    pub iid: u64,
}

impl CharKey {
    pub fn new(aid: u64, iid: u64) -> Self {
        CharKey { aid, iid }
    }
}

impl fmt::Display for CharKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.aid, self.iid)
    }
}

/// Normalise a HAP type identifier to the upper-case full UUID form.
pub fn normalize_uuid(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.is_empty() && trimmed.len() <= 8 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        format!("{:0>8}{}", trimmed.to_ascii_uppercase(), HAP_BASE_SUFFIX)
    } else {
        trimmed.to_ascii_uppercase()
    }
}

/// Short code of an Apple-base UUID (`00000011-0000-1000-8000-0026BB765291` → `0x11`).
pub fn short_code(raw: &str) -> Option<u32> {
    let full = normalize_uuid(raw);
    let prefix = full.strip_suffix(HAP_BASE_SUFFIX)?;
    u32::from_str_radix(prefix, 16).ok()
}

// =====================
// Characteristic catalogue
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum CharType {
    CurrentHeatingCoolingState,
    CoolingThresholdTemperature,
    CurrentRelativeHumidity,
    CurrentTemperature,
    HeatingThresholdTemperature,
    TargetHeatingCoolingState,
    TargetRelativeHumidity,
    TargetTemperature,
    TemperatureDisplayUnits,
    BatteryLevel,
    StatusLowBattery,
    Active,
}

/// Sorted by short code so lookups can binary search.
static CHAR_TABLE: [(u32, CharType); 12] = [
    (0x0D, CharType::CoolingThresholdTemperature),
    (0x0F, CharType::CurrentHeatingCoolingState),
    (0x10, CharType::CurrentRelativeHumidity),
    (0x11, CharType::CurrentTemperature),
    (0x12, CharType::HeatingThresholdTemperature),
    (0x33, CharType::TargetHeatingCoolingState),
    (0x34, CharType::TargetRelativeHumidity),
    (0x35, CharType::TargetTemperature),
    (0x36, CharType::TemperatureDisplayUnits),
    (0x68, CharType::BatteryLevel),
    (0x79, CharType::StatusLowBattery),
    (0xB0, CharType::Active),
];

impl CharType {
    pub fn from_uuid(raw: &str) -> Option<CharType> {
        let code = short_code(raw)?;
        CHAR_TABLE
            .binary_search_by_key(&code, |(c, _)| *c)
            .ok()
            .map(|idx| CHAR_TABLE[idx].1)
    }

    pub fn short_code(self) -> u32 {
        CHAR_TABLE
            .iter()
            .find(|(_, t)| *t == self)
            .map(|(c, _)| *c)
            .unwrap_or_default()
    }

    pub fn uuid(self) -> String {
        format!("{:08X}{}", self.short_code(), HAP_BASE_SUFFIX)
    }

    /// Device-state field this characteristic feeds.
    pub fn field(self) -> Field {
        match self {
            CharType::CurrentHeatingCoolingState => Field::CurrentHeatingCoolingState,
            CharType::CoolingThresholdTemperature => Field::CoolingThresholdTemperature,
            CharType::CurrentRelativeHumidity => Field::Humidity,
            CharType::CurrentTemperature => Field::CurrentTemperature,
            CharType::HeatingThresholdTemperature => Field::HeatingThresholdTemperature,
            CharType::TargetHeatingCoolingState => Field::TargetHeatingCoolingState,
            CharType::TargetRelativeHumidity => Field::TargetHumidity,
            CharType::TargetTemperature => Field::TargetTemperature,
            CharType::TemperatureDisplayUnits => Field::TemperatureDisplayUnits,
            CharType::BatteryLevel => Field::BatteryLevel,
            CharType::StatusLowBattery => Field::StatusLowBattery,
            CharType::Active => Field::ActiveState,
        }
    }

    /// Writable characteristic that sets `field`, if any.
    pub fn for_field(field: Field) -> Option<CharType> {
        match field {
            Field::TargetTemperature => Some(CharType::TargetTemperature),
            Field::TargetHeatingCoolingState => Some(CharType::TargetHeatingCoolingState),
            Field::HeatingThresholdTemperature => Some(CharType::HeatingThresholdTemperature),
            Field::CoolingThresholdTemperature => Some(CharType::CoolingThresholdTemperature),
            Field::TargetHumidity => Some(CharType::TargetRelativeHumidity),
            Field::TemperatureDisplayUnits => Some(CharType::TemperatureDisplayUnits),
            Field::ActiveState => Some(CharType::Active),
            _ => None,
        }
    }

    /// Humidity readings drift fastest and are polled every tick.
    pub fn is_fast_poll(self) -> bool {
        matches!(self, CharType::CurrentRelativeHumidity | CharType::TargetRelativeHumidity)
    }
}

// =====================
// Accessory metadata
// =====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Characteristic {
    pub iid: u64,
    #[serde(rename = "type")]
    pub char_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default)]
    pub perms: Vec<String>,
}

impl Characteristic {
    pub fn supports_events(&self) -> bool {
        self.perms.iter().any(|p| p == "ev")
    }

    pub fn tracked_type(&self) -> Option<CharType> {
        CharType::from_uuid(&self.char_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iid: Option<u64>,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub characteristics: Vec<Characteristic>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accessory {
    pub aid: u64,
    #[serde(default)]
    pub services: Vec<Service>,
}

impl Accessory {
    pub fn has_service(&self, code: u32) -> bool {
        self.services.iter().any(|s| short_code(&s.service_type) == Some(code))
    }

    fn info_string(&self, code: u32) -> Option<String> {
        self.services
            .iter()
            .filter(|s| short_code(&s.service_type) == Some(SERVICE_ACCESSORY_INFORMATION))
            .flat_map(|s| s.characteristics.iter())
            .find(|c| short_code(&c.char_type) == Some(code))
            .and_then(|c| c.value.as_ref())
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    pub fn serial_number(&self) -> Option<String> {
        self.info_string(INFO_SERIAL_NUMBER).filter(|s| !s.is_empty())
    }

    pub fn name(&self) -> Option<String> {
        self.info_string(INFO_NAME)
    }

    pub fn model(&self) -> Option<String> {
        self.info_string(INFO_MODEL)
    }

    pub fn manufacturer(&self) -> Option<String> {
        self.info_string(INFO_MANUFACTURER)
    }

    pub fn characteristics(&self) -> impl Iterator<Item = (CharKey, &Characteristic)> + '_ {
        self.services
            .iter()
            .flat_map(move |s| s.characteristics.iter().map(move |c| (CharKey::new(self.aid, c.iid), c)))
    }

    /// Characteristic of the given tracked type, if this accessory exposes one.
    pub fn find(&self, wanted: CharType) -> Option<CharKey> {
        self.characteristics()
            .find(|(_, c)| c.tracked_type() == Some(wanted))
            .map(|(key, _)| key)
    }
}

#[derive(Deserialize)]
struct AccessoryDocument {
    accessories: Vec<Accessory>,
}

/// Parse accessory metadata as served by `/accessories` (wrapped) or as a bare list.
/// The shape is picked from the first token so errors carry the full JSON path.
pub fn parse_accessories(json: &str) -> Result<Vec<Accessory>, serde_path_to_error::Error<serde_json::Error>> {
    let de = &mut serde_json::Deserializer::from_str(json);
    if json.trim_start().starts_with('[') {
        serde_path_to_error::deserialize(de)
    } else {
        let doc: AccessoryDocument = serde_path_to_error::deserialize(de)?;
        Ok(doc.accessories)
    }
}

// =====================
// Device types
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Thermostat,
    RadiatorValve,
    InternetBridge,
    WirelessReceiver,
    SmartAcControl,
    TemperatureSensor,
    HumiditySensor,
    Unknown,
}

static SERIAL_PREFIXES: [(&str, DeviceType); 5] = [
    ("RU", DeviceType::Thermostat),
    ("VA", DeviceType::RadiatorValve),
    ("IB", DeviceType::InternetBridge),
    ("WR", DeviceType::WirelessReceiver),
    ("SU", DeviceType::SmartAcControl),
];

impl DeviceType {
    pub fn from_serial_prefix(serial: &str) -> DeviceType {
        SERIAL_PREFIXES
            .iter()
            .find(|(prefix, _)| serial.starts_with(prefix))
            .map(|(_, t)| *t)
            .unwrap_or(DeviceType::Unknown)
    }

    /// Service signature wins; the serial prefix table is the fallback.
    pub fn infer(serial: &str, accessory: Option<&Accessory>) -> DeviceType {
        if let Some(acc) = accessory {
            if acc.has_service(SERVICE_THERMOSTAT) {
                return DeviceType::Thermostat;
            }
            if acc.has_service(SERVICE_TEMPERATURE_SENSOR) {
                return DeviceType::TemperatureSensor;
            }
            if acc.has_service(SERVICE_HUMIDITY_SENSOR) {
                return DeviceType::HumiditySensor;
            }
        }
        DeviceType::from_serial_prefix(serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_service(name: &str) -> Service {
        Service {
            iid: Some(1),
            service_type: "0000003e-0000-1000-8000-0026bb765291".into(),
            characteristics: vec![Characteristic {
                iid: 2,
                char_type: "00000023-0000-1000-8000-0026bb765291".into(),
                value: Some(Value::String(name.into())),
                perms: vec!["pr".into()],
            }],
        }
    }

    #[test]
    fn normalizes_short_and_mixed_case_uuids() {
        assert_eq!(normalize_uuid("11"), "00000011-0000-1000-8000-0026BB765291");
        assert_eq!(
            normalize_uuid("00000011-0000-1000-8000-0026bb765291"),
            "00000011-0000-1000-8000-0026BB765291"
        );
        assert_eq!(CharType::from_uuid("11"), Some(CharType::CurrentTemperature));
        assert_eq!(
            CharType::from_uuid("00000035-0000-1000-8000-0026BB765291"),
            Some(CharType::TargetTemperature)
        );
    }

    #[test]
    fn vendor_uuids_are_not_tracked() {
        assert_eq!(CharType::from_uuid("E44673A0-247B-4360-8A76-DB9DA69C0101"), None);
        assert_eq!(CharType::from_uuid("FFFFFFFF-FFFF-FFFF-FFFF-FFFFFFFFFFFF"), None);
    }

    #[test]
    fn every_catalogue_entry_round_trips_through_its_uuid() {
        for (_, t) in CHAR_TABLE.iter() {
            assert_eq!(CharType::from_uuid(&t.uuid()), Some(*t));
        }
    }

    #[test]
    fn device_type_prefers_service_signature() {
        let acc = Accessory {
            aid: 901,
            services: vec![
                info_service("Temp Sensor"),
                Service {
                    iid: None,
                    service_type: "0000008a-0000-1000-8000-0026bb765291".into(),
                    characteristics: vec![],
                },
            ],
        };
        assert_eq!(DeviceType::infer("RU0001ABC", Some(&acc)), DeviceType::TemperatureSensor);
        assert_eq!(acc.name().as_deref(), Some("Temp Sensor"));
    }

    #[test]
    fn device_type_falls_back_to_serial_prefix() {
        let acc = Accessory {
            aid: 905,
            services: vec![info_service("Wireless Receiver")],
        };
        assert_eq!(DeviceType::infer("WR0108A26XYZ777", Some(&acc)), DeviceType::WirelessReceiver);
        assert_eq!(DeviceType::infer("VA0210A26XYZ999", None), DeviceType::RadiatorValve);
        assert_eq!(DeviceType::infer("XX0000", None), DeviceType::Unknown);
    }

    #[test]
    fn parses_wrapped_and_bare_documents() {
        let wrapped = r#"{"accessories":[{"aid":1,"services":[{"type":"4A","characteristics":[{"iid":10,"type":"11","perms":["pr","ev"]}]}]}]}"#;
        let list = parse_accessories(wrapped).expect("wrapped parses");
        assert_eq!(list.len(), 1);
        assert!(list[0].has_service(SERVICE_THERMOSTAT));
        assert_eq!(list[0].find(CharType::CurrentTemperature), Some(CharKey::new(1, 10)));

        let bare = r#"[{"aid":2}]"#;
        assert_eq!(parse_accessories(bare).expect("bare parses")[0].aid, 2);
    }

    #[test]
    fn malformed_documents_report_path() {
        let bad = r#"{"accessories":[{"aid":"one"}]}"#;
        let err = parse_accessories(bad).unwrap_err();
        assert_eq!(err.path().to_string(), "accessories[0].aid");

        let bad = r#"[{"aid":1},{"aid":2,"services":[{"type":"4A","characteristics":[{"iid":-1}]}]}]"#;
        let err = parse_accessories(bad).unwrap_err();
        assert!(err.path().to_string().starts_with("[1].services[0].characteristics[0].iid"));

        let missing = r#"{"devices":[]}"#;
        assert!(parse_accessories(missing).is_err());
    }
}
