use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::info;
use parking_lot::Mutex;

use crate::db::models::{Device, HistoryRecord, HistoryRow, NewDevice, ScheduleRow, Zone};
use crate::db::repo::{Repository, StoreError};
use crate::models::state::DeviceId;
use crate::schema;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Postgres-backed repository over a single connection.
pub struct PgRepository {
    conn: Mutex<PgConnection>,
}

impl PgRepository {
    pub fn connect(database_url: &str) -> Result<Self, StoreError> {
        let conn = PgConnection::establish(database_url)?;
        Ok(PgRepository { conn: Mutex::new(conn) })
    }

    pub fn apply_migrations(&self) -> Result<(), String> {
        let mut conn = self.conn.lock();
        match conn.run_pending_migrations(MIGRATIONS) {
            Ok(applied) => {
                if applied.is_empty() {
                    info!("Database schema is up to date; no migrations were applied");
                } else {
                    let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                    info!("Applied {} database migration(s): {}", applied.len(), names);
                }
                Ok(())
            }
            Err(e) => Err(format!("Applying database migrations failed: {}", e)),
        }
    }
}

impl Repository for PgRepository {
    fn upsert_history(&self, record: &HistoryRecord) -> Result<(), StoreError> {
        use schema::device_state_history::dsl as H;

        let row = HistoryRow::from(record);
        let mut conn = self.conn.lock();
        diesel::insert_into(H::device_state_history)
            .values(&row)
            .on_conflict((H::device_id, H::bucket))
            .do_update()
            .set(&row)
            .execute(&mut *conn)?;
        Ok(())
    }

    fn latest_history(&self) -> Result<Vec<HistoryRecord>, StoreError> {
        use schema::device_state_history::dsl as H;

        let mut conn = self.conn.lock();
        let rows: Vec<HistoryRow> = H::device_state_history
            .order((H::device_id.asc(), H::bucket.desc()))
            .distinct_on(H::device_id)
            .select(HistoryRow::as_select())
            .load(&mut *conn)?;
        Ok(rows.into_iter().map(HistoryRecord::from).collect())
    }

    fn history(
        &self,
        device_id: DeviceId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        use schema::device_state_history::dsl as H;

        let mut query = H::device_state_history
            .filter(H::device_id.eq(device_id.0))
            .select(HistoryRow::as_select())
            .into_boxed();
        if let Some(start) = start {
            query = query.filter(H::recorded_at.ge(start));
        }
        if let Some(end) = end {
            query = query.filter(H::recorded_at.le(end));
        }

        let mut conn = self.conn.lock();
        let rows: Vec<HistoryRow> = query
            .order((H::recorded_at.desc(), H::bucket.desc()))
            .limit(limit)
            .offset(offset)
            .load(&mut *conn)?;
        Ok(rows.into_iter().map(HistoryRecord::from).collect())
    }

    fn devices(&self) -> Result<Vec<Device>, StoreError> {
        use schema::devices::dsl as D;

        let mut conn = self.conn.lock();
        Ok(D::devices.order(D::device_id.asc()).select(Device::as_select()).load(&mut *conn)?)
    }

    fn upsert_device(&self, new: &NewDevice) -> Result<Device, StoreError> {
        use schema::devices::dsl as D;

        let mut conn = self.conn.lock();
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            let existing: Option<Device> = D::devices
                .filter(D::serial_number.eq(&new.serial_number))
                .select(Device::as_select())
                .first(conn)
                .optional()?;

            match existing {
                Some(dev) if new.aid.is_some() && dev.aid != new.aid => diesel::update(D::devices.find(dev.device_id))
                    .set((D::aid.eq(new.aid), D::updated_at.eq(diesel::dsl::now)))
                    .returning(Device::as_returning())
                    .get_result(conn),
                Some(dev) => Ok(dev),
                None => diesel::insert_into(D::devices)
                    .values(new)
                    .returning(Device::as_returning())
                    .get_result(conn),
            }
        })
        .map_err(StoreError::from)
    }

    fn zones(&self) -> Result<Vec<Zone>, StoreError> {
        use schema::zones::dsl as Z;

        let mut conn = self.conn.lock();
        Ok(Z::zones.order(Z::zone_id.asc()).select(Zone::as_select()).load(&mut *conn)?)
    }

    fn enabled_schedules(&self) -> Result<Vec<ScheduleRow>, StoreError> {
        use schema::zone_schedules::dsl as S;

        let mut conn = self.conn.lock();
        Ok(S::zone_schedules
            .filter(S::enabled.eq(true))
            .order(S::schedule_id.asc())
            .select(ScheduleRow::as_select())
            .load(&mut *conn)?)
    }

    fn config_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        use schema::app_config::dsl as C;

        let mut conn = self.conn.lock();
        Ok(C::app_config
            .filter(C::key.eq(key))
            .select(C::value)
            .first::<String>(&mut *conn)
            .optional()?)
    }
}
