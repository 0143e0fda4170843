use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;

use crate::client::UpdateSource;
use crate::models::state::{DeviceId, Field, FieldChange, FieldValue, ZoneId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    Device,
    Scheduled,
    Detector,
}

/// Normalised change record handed to the notification sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeRecord {
    pub device_id: DeviceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<ZoneId>,
    pub field: Field,
    pub old: Option<FieldValue>,
    pub new: FieldValue,
    pub origin: ChangeOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<UpdateSource>,
    pub at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn from_change(change: &FieldChange, origin: ChangeOrigin, at: DateTime<Utc>) -> Self {
        ChangeRecord {
            device_id: change.device_id,
            serial_number: None,
            zone_id: None,
            field: change.field,
            old: change.old,
            new: change.new,
            origin,
            source: None,
            at,
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("serializing change record failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("sink closed")]
    Closed,
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, record: &ChangeRecord) -> Result<(), NotifyError>;
}

/// Deliver to the sink, logging failures instead of propagating them.
pub fn deliver(sink: &dyn NotificationSink, record: &ChangeRecord) {
    if let Err(e) = sink.notify(record) {
        warn!("Notification for device {} ({}) failed: {}", record.device_id, record.field, e);
    }
}

/// Writes every change record as one JSON line to the debug log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, record: &ChangeRecord) -> Result<(), NotifyError> {
        debug!("change {}", serde_json::to_string(record)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn change_record_serializes_flat() {
        let change = FieldChange {
            device_id: DeviceId(4),
            field: Field::TargetTemperature,
            old: Some(FieldValue::Float(20.0)),
            new: FieldValue::Float(21.0),
        };
        let mut rec = ChangeRecord::from_change(&change, ChangeOrigin::Scheduled, Utc.timestamp_opt(0, 0).unwrap());
        rec.source = Some(UpdateSource::FastPoll);
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["device_id"], 4);
        assert_eq!(v["field"], "target_temperature");
        assert_eq!(v["old"], 20.0);
        assert_eq!(v["origin"], "scheduled");
        assert_eq!(v["source"], "FAST-POLL");
        assert!(v.get("zone_id").is_none());
    }

    struct Broken;

    impl NotificationSink for Broken {
        fn notify(&self, _record: &ChangeRecord) -> Result<(), NotifyError> {
            Err(NotifyError::Closed)
        }
    }

    #[test]
    fn deliver_swallows_sink_errors() {
        let change = FieldChange {
            device_id: DeviceId(1),
            field: Field::Window,
            old: None,
            new: FieldValue::Int(1),
        };
        deliver(&Broken, &ChangeRecord::from_change(&change, ChangeOrigin::Detector, Utc::now()));
        assert!(LogNotifier.notify(&ChangeRecord::from_change(&change, ChangeOrigin::Device, Utc::now())).is_ok());
    }
}
