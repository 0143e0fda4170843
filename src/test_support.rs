//! In-memory doubles shared by the unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::mpsc;

use crate::client::{ChannelError, DeviceChannel, RawUpdate};
use crate::models::homekit::{Accessory, CharKey};
use crate::models::state::{DeviceId, FieldMap};
use crate::services::control::{ControlError, SetpointWriter, WriteOrigin};
use crate::services::notify::{ChangeRecord, NotificationSink, NotifyError};

#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<ChangeRecord>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<ChangeRecord> {
        self.records.lock().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, record: &ChangeRecord) -> Result<(), NotifyError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

struct ChannelState {
    accessories: Vec<Accessory>,
    values: BTreeMap<CharKey, Value>,
    reads: Vec<Vec<CharKey>>,
    writes: Vec<Vec<(CharKey, Value)>>,
    failing_reads: HashSet<usize>,
    fail_writes: bool,
    available: bool,
    subscriber: Option<mpsc::UnboundedSender<RawUpdate>>,
}

pub struct FakeChannel {
    inner: Mutex<ChannelState>,
}

impl Default for FakeChannel {
    fn default() -> Self {
        FakeChannel {
            inner: Mutex::new(ChannelState {
                accessories: Vec::new(),
                values: BTreeMap::new(),
                reads: Vec::new(),
                writes: Vec::new(),
                failing_reads: HashSet::new(),
                fail_writes: false,
                available: true,
                subscriber: None,
            }),
        }
    }
}

impl FakeChannel {
    pub fn with_accessories(accessories: Vec<Accessory>) -> Self {
        let channel = FakeChannel::default();
        channel.inner.lock().accessories = accessories;
        channel
    }

    pub fn set_value(&self, key: CharKey, value: Value) {
        self.inner.lock().values.insert(key, value);
    }

    /// Fail the batch reads with these 0-based call indices.
    pub fn fail_read_calls(&self, calls: &[usize]) {
        self.inner.lock().failing_reads.extend(calls.iter().copied());
    }

    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
    }

    pub fn reads(&self) -> Vec<Vec<CharKey>> {
        self.inner.lock().reads.clone()
    }

    pub fn writes(&self) -> Vec<Vec<(CharKey, Value)>> {
        self.inner.lock().writes.clone()
    }

    /// Push an unsolicited event to the subscriber, if any. Returns false when nobody listens.
    pub fn emit(&self, update: RawUpdate) -> bool {
        match &self.inner.lock().subscriber {
            Some(tx) => tx.send(update).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl DeviceChannel for FakeChannel {
    fn is_available(&self) -> bool {
        self.inner.lock().available
    }

    async fn accessories(&self) -> Result<Vec<Accessory>, ChannelError> {
        let st = self.inner.lock();
        if !st.available {
            return Err(ChannelError::Unavailable);
        }
        Ok(st.accessories.clone())
    }

    async fn batch_read(&self, keys: &[CharKey]) -> Result<BTreeMap<CharKey, Value>, ChannelError> {
        let mut st = self.inner.lock();
        let call = st.reads.len();
        st.reads.push(keys.to_vec());
        if !st.available {
            return Err(ChannelError::Unavailable);
        }
        if st.failing_reads.contains(&call) {
            return Err(ChannelError::Transport(format!("read call {} failed", call)));
        }
        Ok(keys
            .iter()
            .filter_map(|k| st.values.get(k).map(|v| (*k, v.clone())))
            .collect())
    }

    async fn batch_write(&self, writes: &[(CharKey, Value)]) -> Result<(), ChannelError> {
        let mut st = self.inner.lock();
        if st.fail_writes {
            return Err(ChannelError::Transport("write refused".into()));
        }
        st.writes.push(writes.to_vec());
        for (key, value) in writes {
            st.values.insert(*key, value.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, _keys: &[CharKey], sink: mpsc::UnboundedSender<RawUpdate>) -> Result<(), ChannelError> {
        self.inner.lock().subscriber = Some(sink);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingWriter {
    calls: Mutex<Vec<(DeviceId, FieldMap, WriteOrigin)>>,
    fail: Mutex<bool>,
}

impl RecordingWriter {
    pub fn calls(&self) -> Vec<(DeviceId, FieldMap, WriteOrigin)> {
        self.calls.lock().clone()
    }

    pub fn fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }
}

#[async_trait]
impl SetpointWriter for RecordingWriter {
    async fn apply_setpoint(&self, device_id: DeviceId, fields: FieldMap, origin: WriteOrigin) -> Result<(), ControlError> {
        if *self.fail.lock() {
            return Err(ControlError::Channel {
                device: device_id,
                source: ChannelError::Unavailable,
            });
        }
        self.calls.lock().push((device_id, fields, origin));
        Ok(())
    }
}
