//! Setpoint write path: maps requested fields to writable characteristics,
//! records an optimistic prediction and issues the write through the channel.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::client::{ChannelError, DeviceChannel};
use crate::models::homekit::{CharKey, CharType};
use crate::models::state::{DeviceId, FieldMap};
use crate::services::refs::AccessoryCache;
use crate::services::state::SharedState;

const SCHEDULED_GRACE_SECS: i64 = 30;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriteOrigin {
    Manual,
    Scheduled,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
    #[error("device {0} has no accessory instance reference")]
    NoInstanceRef(DeviceId),
    #[error("device {0} exposes no writable characteristic for the requested fields")]
    NothingToWrite(DeviceId),
    #[error("write to device {device} failed: {source}")]
    Channel {
        device: DeviceId,
        #[source]
        source: ChannelError,
    },
}

#[async_trait]
pub trait SetpointWriter: Send + Sync {
    async fn apply_setpoint(&self, device_id: DeviceId, fields: FieldMap, origin: WriteOrigin) -> Result<(), ControlError>;
}

/// Devices currently undergoing a scheduler-initiated write.
#[derive(Clone)]
pub struct ScheduledWrites {
    marks: Arc<Mutex<HashMap<DeviceId, DateTime<Utc>>>>,
    grace: TimeDelta,
}

impl Default for ScheduledWrites {
    fn default() -> Self {
        ScheduledWrites {
            marks: Arc::new(Mutex::new(HashMap::new())),
            grace: TimeDelta::seconds(SCHEDULED_GRACE_SECS),
        }
    }
}

impl ScheduledWrites {
    pub fn mark(&self, device_id: DeviceId, now: DateTime<Utc>) {
        let mut marks = self.marks.lock();
        marks.retain(|_, at| now - *at < self.grace);
        marks.insert(device_id, now);
    }

    pub fn is_marked(&self, device_id: DeviceId, now: DateTime<Utc>) -> bool {
        self.marks
            .lock()
            .get(&device_id)
            .is_some_and(|at| now - *at < self.grace)
    }
}

pub struct DeviceController {
    state: SharedState,
    channel: Arc<dyn DeviceChannel>,
    accessories: AccessoryCache,
    scheduled: ScheduledWrites,
}

impl DeviceController {
    pub fn new(
        state: SharedState,
        channel: Arc<dyn DeviceChannel>,
        accessories: AccessoryCache,
        scheduled: ScheduledWrites,
    ) -> Self {
        DeviceController {
            state,
            channel,
            accessories,
            scheduled,
        }
    }

    fn instance_ref(&self, device_id: DeviceId) -> Result<u64, ControlError> {
        let mut st = self.state.lock();
        let device = st.device(device_id).ok_or(ControlError::UnknownDevice(device_id))?;
        if let Some(aid) = device.instance_ref() {
            return Ok(aid);
        }
        // the registry may be stale after re-pairing
        if let Err(e) = st.reload_registry() {
            debug!("Registry reload for device {} failed: {}", device_id, e);
        }
        st.device(device_id)
            .and_then(|d| d.instance_ref())
            .ok_or(ControlError::NoInstanceRef(device_id))
    }

    fn plan_writes(&self, aid: u64, fields: &FieldMap) -> (Vec<(CharKey, Value)>, FieldMap) {
        let accessories = self.accessories.snapshot();
        let accessory = accessories.iter().find(|a| a.aid == aid);
        let mut writes = Vec::new();
        let mut written = FieldMap::new();
        for (field, value) in fields {
            let key = CharType::for_field(*field).and_then(|ct| accessory.and_then(|a| a.find(ct)));
            match key {
                Some(key) => {
                    writes.push((key, value.to_json()));
                    written.insert(*field, *value);
                }
                None => debug!("No writable characteristic for {} on accessory {}", field, aid),
            }
        }
        (writes, written)
    }
}

#[async_trait]
impl SetpointWriter for DeviceController {
    async fn apply_setpoint(&self, device_id: DeviceId, fields: FieldMap, origin: WriteOrigin) -> Result<(), ControlError> {
        let aid = self.instance_ref(device_id)?;
        let (writes, written) = self.plan_writes(aid, &fields);
        if writes.is_empty() {
            return Err(ControlError::NothingToWrite(device_id));
        }

        let now = Utc::now();
        if origin == WriteOrigin::Scheduled {
            self.scheduled.mark(device_id, now);
        }
        self.state.lock().set_optimistic(device_id, written, now);

        if let Err(source) = self.channel.batch_write(&writes).await {
            self.state.lock().clear_optimistic(device_id);
            return Err(ControlError::Channel {
                device: device_id,
                source,
            });
        }
        info!("Wrote {} characteristic(s) to device {} ({:?})", writes.len(), device_id, origin);
        Ok(())
    }
}
