//! Calendar-grid setpoint application for zones in AUTO mode.
//!
//! Notes
//! - Slots are 5 minutes wide. The loop wakes every minute and applies only on
//!   slot boundaries, plus one unconditional pass at startup.
//! - The bulk pass applies every matching entry of every schedule type. The
//!   separate `current_schedule_temperature` lookup ranks types instead
//!   (all-day, then weekday/weekend, then day-of-week).
//! - A zone switched into AUTO gets its latest applicable entry on the next
//!   minute tick. `latest_applicable` only looks back as far as yesterday.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDateTime, NaiveTime, TimeDelta, Timelike, Utc};
use chrono_tz::Tz;
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::db::models::ScheduleRow;
use crate::db::repo::Repository;
use crate::models::state::{Field, FieldMap, FieldValue, ZoneId, ZoneMode};
use crate::services::control::{SetpointWriter, WriteOrigin};
use crate::services::state::ZoneDirectory;
use crate::shutdown::Shutdown;

const SLOT_MINUTES: u32 = 5;
const DEDUP_WINDOW_SECS: i64 = 240;
const DEDUP_RETENTION_SECS: i64 = 600;
const TIMEZONE_TTL_SECS: i64 = 3600;
const TIMEZONE_KEY: &str = "timezone";

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("schedule {0}: unknown schedule type {1}")]
    UnknownType(i64, i32),
    #[error("schedule {0}: day_of_week missing or out of range")]
    BadDayOfWeek(i64),
    #[error("schedule {0}: day_type must be 'weekday' or 'weekend'")]
    BadDayType(i64),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DayClass {
    Weekday,
    Weekend,
}

impl DayClass {
    fn of(weekday: u32) -> DayClass {
        if weekday < 5 { DayClass::Weekday } else { DayClass::Weekend }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScheduleKind {
    /// Monday = 0
    DayOfWeek(u32),
    WeekdayWeekend(DayClass),
    AllDay,
}

impl ScheduleKind {
    fn applies_on(self, weekday: u32) -> bool {
        match self {
            ScheduleKind::DayOfWeek(d) => d == weekday,
            ScheduleKind::WeekdayWeekend(class) => class == DayClass::of(weekday),
            ScheduleKind::AllDay => true,
        }
    }

    fn priority(self) -> u8 {
        match self {
            ScheduleKind::AllDay => 3,
            ScheduleKind::WeekdayWeekend(_) => 2,
            ScheduleKind::DayOfWeek(_) => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub schedule_id: i64,
    pub zone_id: ZoneId,
    pub kind: ScheduleKind,
    pub time: NaiveTime,
    pub temperature: f64,
}

impl TryFrom<ScheduleRow> for ScheduleEntry {
    type Error = ScheduleError;

    fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
        let kind = match row.schedule_type {
            3 => ScheduleKind::AllDay,
            2 => match row.day_type.as_deref() {
                Some("weekday") => ScheduleKind::WeekdayWeekend(DayClass::Weekday),
                Some("weekend") => ScheduleKind::WeekdayWeekend(DayClass::Weekend),
                _ => return Err(ScheduleError::BadDayType(row.schedule_id)),
            },
            1 => match row.day_of_week {
                Some(d @ 0..=6) => ScheduleKind::DayOfWeek(d as u32),
                _ => return Err(ScheduleError::BadDayOfWeek(row.schedule_id)),
            },
            other => return Err(ScheduleError::UnknownType(row.schedule_id, other)),
        };
        Ok(ScheduleEntry {
            schedule_id: row.schedule_id,
            zone_id: ZoneId(row.zone_id),
            kind,
            time: row.start_time,
            temperature: row.temperature,
        })
    }
}

/// Floor a local time to its 5-minute slot.
pub fn slot_of(local: NaiveDateTime) -> NaiveTime {
    let minute = local.minute() - local.minute() % SLOT_MINUTES;
    NaiveTime::from_hms_opt(local.hour(), minute, 0).unwrap_or_default()
}

pub fn on_slot_boundary(local: NaiveDateTime) -> bool {
    local.minute() % SLOT_MINUTES == 0
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReport {
    pub matched: usize,
    pub applied: usize,
    pub deduplicated: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct TemperatureScheduler {
    repo: Arc<dyn Repository>,
    zones: Arc<dyn ZoneDirectory>,
    writer: Arc<dyn SetpointWriter>,
    applied: HashMap<(ZoneId, i64, NaiveTime), DateTime<Utc>>,
    modes: HashMap<ZoneId, Option<ZoneMode>>,
    timezone: Option<(Tz, DateTime<Utc>)>,
}

impl TemperatureScheduler {
    pub fn new(repo: Arc<dyn Repository>, zones: Arc<dyn ZoneDirectory>, writer: Arc<dyn SetpointWriter>) -> Self {
        TemperatureScheduler {
            repo,
            zones,
            writer,
            applied: HashMap::new(),
            modes: HashMap::new(),
            timezone: None,
        }
    }

    fn timezone(&mut self, now: DateTime<Utc>) -> Tz {
        if let Some((tz, fetched)) = self.timezone {
            if now - fetched < TimeDelta::seconds(TIMEZONE_TTL_SECS) {
                return tz;
            }
        }
        let tz = match self.repo.config_value(TIMEZONE_KEY) {
            Ok(Some(name)) => name.parse::<Tz>().unwrap_or_else(|_| {
                warn!("Invalid timezone '{}' in app_config, using UTC", name);
                Tz::UTC
            }),
            Ok(None) => Tz::UTC,
            Err(e) => {
                warn!("Reading timezone failed: {}; using UTC", e);
                Tz::UTC
            }
        };
        self.timezone = Some((tz, now));
        tz
    }

    pub fn local_time(&mut self, now: DateTime<Utc>) -> NaiveDateTime {
        let tz = self.timezone(now);
        now.with_timezone(&tz).naive_local()
    }

    fn load_entries(&self) -> Vec<ScheduleEntry> {
        let rows = match self.repo.enabled_schedules() {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Loading schedules failed: {}", e);
                return Vec::new();
            }
        };
        rows.into_iter()
            .filter_map(|row| match ScheduleEntry::try_from(row) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Ignoring schedule row: {}", e);
                    None
                }
            })
            .collect()
    }

    fn prune_applied(&mut self, now: DateTime<Utc>) {
        self.applied
            .retain(|_, at| now - *at <= TimeDelta::seconds(DEDUP_RETENTION_SECS));
    }

    /// Apply every enabled entry matching the slot `now` falls into.
    pub async fn run_once(&mut self, now: DateTime<Utc>) -> ApplyReport {
        let local = self.local_time(now);
        let slot = slot_of(local);
        let weekday = local.weekday().num_days_from_monday();
        self.zones.refresh();

        let matches: Vec<ScheduleEntry> = self
            .load_entries()
            .into_iter()
            .filter(|e| e.time == slot && e.kind.applies_on(weekday))
            .collect();

        let mut report = ApplyReport {
            matched: matches.len(),
            ..ApplyReport::default()
        };
        for entry in matches {
            let key = (entry.zone_id, entry.schedule_id, slot);
            if self
                .applied
                .get(&key)
                .is_some_and(|at| now - *at < TimeDelta::seconds(DEDUP_WINDOW_SECS))
            {
                report.deduplicated += 1;
                continue;
            }

            if self.zones.tracked_mode(entry.zone_id) != Some(ZoneMode::Auto) {
                debug!("Schedule {}: zone {} not in AUTO, skipping", entry.schedule_id, entry.zone_id);
                report.skipped += 1;
                continue;
            }
            let Some(leader) = self.zones.leader(entry.zone_id) else {
                warn!("Schedule {}: zone {} has no leader device", entry.schedule_id, entry.zone_id);
                report.failed += 1;
                continue;
            };

            let fields = FieldMap::from([(Field::TargetTemperature, FieldValue::Float(entry.temperature))]);
            match self.writer.apply_setpoint(leader, fields, WriteOrigin::Scheduled).await {
                Ok(()) => {
                    info!(
                        "Schedule {} applied: zone {} -> {:.1}C at {}",
                        entry.schedule_id,
                        entry.zone_id,
                        entry.temperature,
                        slot.format("%H:%M")
                    );
                    self.applied.insert(key, now);
                    self.prune_applied(now);
                    report.applied += 1;
                }
                Err(e) => {
                    warn!("Schedule {} for zone {} failed: {}", entry.schedule_id, entry.zone_id, e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Minute tick: runs the bulk pass only on slot boundaries unless forced.
    pub async fn tick(&mut self, now: DateTime<Utc>, force: bool) -> Option<ApplyReport> {
        let local = self.local_time(now);
        if !force && !on_slot_boundary(local) {
            return None;
        }
        Some(self.run_once(now).await)
    }

    /// Most recent entry for `zone` that should be in effect at `now`, looking
    /// back through today and then yesterday.
    pub fn latest_applicable(&mut self, zone_id: ZoneId, now: DateTime<Utc>) -> Option<ScheduleEntry> {
        let local = self.local_time(now);
        let today = local.weekday().num_days_from_monday();
        let yesterday = (today + 6) % 7;
        let entries: Vec<ScheduleEntry> = self
            .load_entries()
            .into_iter()
            .filter(|e| e.zone_id == zone_id)
            .collect();

        let pick = |day: u32, upto: Option<NaiveTime>| {
            entries
                .iter()
                .filter(|e| e.kind.applies_on(day) && upto.is_none_or(|t| e.time <= t))
                .max_by_key(|e| (e.time, e.schedule_id))
                .cloned()
        };
        pick(today, Some(local.time())).or_else(|| pick(yesterday, None))
    }

    /// Apply the latest applicable entry to zones that switched into AUTO since
    /// the previous call. The first observation of a zone only records its mode.
    pub async fn catch_up_switched_zones(&mut self, now: DateTime<Utc>) -> usize {
        self.zones.refresh();
        let zones: BTreeSet<ZoneId> = self.load_entries().iter().map(|e| e.zone_id).collect();

        let mut applied = 0;
        for zone_id in zones {
            let mode = self.zones.tracked_mode(zone_id);
            let previous = self.modes.insert(zone_id, mode);
            let switched = mode == Some(ZoneMode::Auto) && previous.is_some_and(|p| p != Some(ZoneMode::Auto));
            if !switched {
                continue;
            }
            let Some(entry) = self.latest_applicable(zone_id, now) else {
                debug!("Zone {} switched to AUTO with no applicable schedule", zone_id);
                continue;
            };
            let Some(leader) = self.zones.leader(zone_id) else {
                warn!("Zone {} switched to AUTO but has no leader device", zone_id);
                continue;
            };
            let fields = FieldMap::from([(Field::TargetTemperature, FieldValue::Float(entry.temperature))]);
            match self.writer.apply_setpoint(leader, fields, WriteOrigin::Scheduled).await {
                Ok(()) => {
                    info!(
                        "Zone {} switched to AUTO: applied schedule {} ({:.1}C from {})",
                        zone_id,
                        entry.schedule_id,
                        entry.temperature,
                        entry.time.format("%H:%M")
                    );
                    applied += 1;
                }
                Err(e) => warn!("Zone {} AUTO catch-up failed: {}", zone_id, e),
            }
        }
        applied
    }

    /// Temperature scheduled for the exact slot of `local`, ranked by schedule type.
    pub fn current_schedule_temperature(&self, zone_id: ZoneId, local: NaiveDateTime) -> Option<f64> {
        let slot = slot_of(local);
        let weekday = local.weekday().num_days_from_monday();
        self.load_entries()
            .into_iter()
            .filter(|e| e.zone_id == zone_id && e.time == slot && e.kind.applies_on(weekday))
            .max_by_key(|e| (e.kind.priority(), e.schedule_id))
            .map(|e| e.temperature)
    }

    pub async fn run(mut self, mut shutdown: Shutdown) {
        info!("Scheduler started");
        self.catch_up_switched_zones(Utc::now()).await;
        let report = self.run_once(Utc::now()).await;
        info!("Scheduler startup pass: {:?}", report);

        while !shutdown.is_triggered() {
            let now = Utc::now();
            let into_minute = ChronoDuration::seconds(i64::from(now.second()));
            let wait = (ChronoDuration::minutes(1) - into_minute)
                .to_std()
                .unwrap_or(Duration::from_secs(60));
            if !shutdown.sleep(wait).await {
                break;
            }
            self.catch_up_switched_zones(Utc::now()).await;
            if let Some(report) = self.tick(Utc::now(), false).await {
                if report.matched > 0 {
                    info!("Scheduler pass: {:?}", report);
                }
            }
        }
        info!("Scheduler stopped");
    }
}
