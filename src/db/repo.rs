use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::models::{Device, HistoryRecord, NewDevice, ScheduleRow, Zone};
use crate::models::state::DeviceId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("database connection failed: {0}")]
    Connection(#[from] diesel::ConnectionError),
    #[error("{0}")]
    Other(String),
}

/// Durable rows the engine reads and writes.
///
/// Calls are synchronous and expected to be fast; callers run them inline
/// while holding the state lock.
pub trait Repository: Send + Sync {
    /// Insert or replace the row keyed by `(device_id, bucket)`.
    fn upsert_history(&self, record: &HistoryRecord) -> Result<(), StoreError>;

    /// Most recent bucket for every device that has history.
    fn latest_history(&self) -> Result<Vec<HistoryRecord>, StoreError>;

    /// Rows for one device, newest first, `recorded_at` bounds inclusive.
    fn history(
        &self,
        device_id: DeviceId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<HistoryRecord>, StoreError>;

    fn devices(&self) -> Result<Vec<Device>, StoreError>;

    /// Create the device by serial number, or update its instance ref in place.
    fn upsert_device(&self, new: &NewDevice) -> Result<Device, StoreError>;

    fn zones(&self) -> Result<Vec<Zone>, StoreError>;

    fn enabled_schedules(&self) -> Result<Vec<ScheduleRow>, StoreError>;

    fn config_value(&self, key: &str) -> Result<Option<String>, StoreError>;
}
