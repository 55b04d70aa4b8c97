use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{Datelike, Days, Duration, Months, NaiveDate, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use super::{Store, StoreError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsageKind {
    Requests,
    Tokens,
}

impl UsageKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requests" => Some(Self::Requests),
            "tokens" => Some(Self::Tokens),
            _ => None,
        }
    }

    fn value_expr(self) -> &'static str {
        match self {
            Self::Requests => "COUNT(DISTINCT request_id)",
            Self::Tokens => "COALESCE(SUM(total_tokens), 0)",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrendUnit {
    Day,
    Week,
    Month,
}

impl TrendUnit {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TrendDataset {
    pub label: String,
    pub data: Vec<u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TrendReport {
    pub labels: Vec<String>,
    pub datasets: Vec<TrendDataset>,
    pub start_date: String,
    pub end_date: String,
}

/// `[date, value]` pair, serialized as a two-element array.
#[derive(Clone, Debug, Serialize)]
pub struct HeatmapCell(pub String, pub u64);

#[derive(Clone, Debug, Serialize)]
pub struct ModelSuccessRate {
    pub successful_requests: u64,
    pub total_requests: u64,
    pub success_rate: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct DailySuccessRate {
    pub date: String,
    pub models: BTreeMap<String, ModelSuccessRate>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SuccessRateReport {
    pub stats: Vec<DailySuccessRate>,
    pub models: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct HourlySuccessRate {
    pub hour: u32,
    pub models: BTreeMap<String, ModelSuccessRate>,
}

#[derive(Clone, Debug, Serialize)]
pub struct HourlySuccessRateReport {
    pub stats: Vec<HourlySuccessRate>,
    pub models: Vec<String>,
}

pub(crate) fn parse_timezone(name: &str) -> Result<Tz, StoreError> {
    name.parse::<Tz>()
        .map_err(|_| StoreError::InvalidTimezone(name.to_string()))
}

/// Fixed `±HH:MM` modifier for SQLite's strftime, taken from the zone's
/// current UTC offset. DST transitions inside a window shift by at most
/// one hour, which matches the behavior of the sibling statistics UIs.
fn tz_offset_modifier(tz: Tz) -> String {
    let offset = tz.offset_from_utc_datetime(&Utc::now().naive_utc()).fix();
    let secs = offset.local_minus_utc();
    let hours = secs / 3600;
    let minutes = (secs.abs() % 3600) / 60;
    format!("{hours:+03}:{minutes:02}")
}

fn local_midnight_ts(tz: Tz, date: NaiveDate) -> f64 {
    let naive = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    match tz.from_local_datetime(&naive).earliest() {
        Some(dt) => dt.timestamp() as f64,
        None => Utc.from_utc_datetime(&naive).timestamp() as f64,
    }
}

fn shift_months(date: NaiveDate, offset: i32) -> NaiveDate {
    if offset >= 0 {
        date.checked_add_months(Months::new(offset as u32))
            .unwrap_or(date)
    } else {
        date.checked_sub_months(Months::new(offset.unsigned_abs()))
            .unwrap_or(date)
    }
}

struct TrendWindow {
    labels: Vec<String>,
    start_ts: f64,
    end_ts: f64,
    group_by_format: &'static str,
    start_date: String,
    end_date: String,
}

fn trend_window(unit: TrendUnit, offset: i32, num_periods: u32, tz: Tz) -> TrendWindow {
    let num_periods = num_periods.max(1) as u64;
    let today = Utc::now().with_timezone(&tz).date_naive();

    match unit {
        TrendUnit::Day => {
            let current = today
                .checked_add_signed(Duration::days(i64::from(offset)))
                .unwrap_or(today);
            let start = current
                .checked_sub_days(Days::new(num_periods - 1))
                .unwrap_or(current);
            let labels = (0..num_periods)
                .filter_map(|i| start.checked_add_days(Days::new(i)))
                .map(|d| d.format("%Y-%m-%d").to_string())
                .collect();
            let end_exclusive = current.checked_add_days(Days::new(1)).unwrap_or(current);
            TrendWindow {
                labels,
                start_ts: local_midnight_ts(tz, start),
                end_ts: local_midnight_ts(tz, end_exclusive),
                group_by_format: "%Y-%m-%d",
                start_date: start.format("%Y-%m-%d").to_string(),
                end_date: current.format("%Y-%m-%d").to_string(),
            }
        }
        TrendUnit::Week => {
            let shifted = today
                .checked_add_signed(Duration::weeks(i64::from(offset)))
                .unwrap_or(today);
            let week_start = shifted
                .checked_sub_days(Days::new(u64::from(
                    shifted.weekday().num_days_from_monday(),
                )))
                .unwrap_or(shifted);
            let start = week_start
                .checked_sub_days(Days::new(7 * (num_periods - 1)))
                .unwrap_or(week_start);
            let labels = (0..num_periods)
                .filter_map(|i| start.checked_add_days(Days::new(7 * i)))
                .map(|d| d.format("%Y-%W").to_string())
                .collect();
            let end_exclusive = week_start
                .checked_add_days(Days::new(7))
                .unwrap_or(week_start);
            TrendWindow {
                labels,
                start_ts: local_midnight_ts(tz, start),
                end_ts: local_midnight_ts(tz, end_exclusive),
                group_by_format: "%Y-%W",
                start_date: start.format("%Y-%m-%d").to_string(),
                end_date: end_exclusive
                    .checked_sub_days(Days::new(1))
                    .unwrap_or(end_exclusive)
                    .format("%Y-%m-%d")
                    .to_string(),
            }
        }
        TrendUnit::Month => {
            let this_month = today.with_day(1).unwrap_or(today);
            let current = shift_months(this_month, offset);
            let start = shift_months(current, -((num_periods as i32) - 1));
            let labels = (0..num_periods)
                .map(|i| shift_months(start, i as i32).format("%Y-%m").to_string())
                .collect();
            let end_exclusive = shift_months(current, 1);
            TrendWindow {
                labels,
                start_ts: local_midnight_ts(tz, start),
                end_ts: local_midnight_ts(tz, end_exclusive),
                group_by_format: "%Y-%m",
                start_date: start.format("%Y-%m").to_string(),
                end_date: current.format("%Y-%m").to_string(),
            }
        }
    }
}

impl Store {
    /// Successful call count per principal, derived from the request log.
    pub async fn per_principal_call_counts(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT principal_alias, COUNT(DISTINCT request_id)
                 FROM request_logs
                 WHERE is_success = 1
                 GROUP BY principal_alias",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut out = BTreeMap::new();
            for row in rows {
                let (alias, count) = row?;
                out.insert(alias, count.max(0) as u64);
            }
            Ok(out)
        })
        .await
    }

    /// Per-day totals over the past 365 days in the caller's zone.
    pub async fn daily_usage_heatmap(
        &self,
        kind: UsageKind,
        timezone: &str,
    ) -> Result<Vec<HeatmapCell>, StoreError> {
        let tz = parse_timezone(timezone)?;
        let offset_modifier = tz_offset_modifier(tz);
        let end_ts = super::now_epoch();
        let start_ts = end_ts - 365.0 * 86_400.0;

        self.call(move |conn| {
            let sql = format!(
                "SELECT strftime('%Y-%m-%d', request_time, 'unixepoch', '{offset_modifier}') AS day,
                        {value}
                 FROM request_logs
                 WHERE is_success = 1 AND request_time >= ?1 AND request_time <= ?2
                 GROUP BY day
                 ORDER BY day",
                value = kind.value_expr(),
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params![start_ts, end_ts], |row| {
                Ok(HeatmapCell(
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?.max(0) as u64,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// Per-period, per-model counts over `(unit, offset, num_periods)`.
    pub async fn usage_trend(
        &self,
        unit: TrendUnit,
        offset: i32,
        num_periods: u32,
        kind: UsageKind,
        timezone: &str,
    ) -> Result<TrendReport, StoreError> {
        let tz = parse_timezone(timezone)?;
        let offset_modifier = tz_offset_modifier(tz);
        let window = trend_window(unit, offset, num_periods, tz);

        self.call(move |conn| {
            let sql = format!(
                "SELECT strftime('{group_by}', request_time, 'unixepoch', '{offset_modifier}') AS period_label,
                        model_name,
                        {value}
                 FROM request_logs
                 WHERE is_success = 1 AND request_time >= ?1 AND request_time < ?2
                 GROUP BY period_label, model_name",
                group_by = window.group_by_format,
                value = kind.value_expr(),
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params![window.start_ts, window.end_ts], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?.max(0) as u64,
                ))
            })?;

            let mut by_period: HashMap<String, BTreeMap<String, u64>> = HashMap::new();
            let mut models = BTreeSet::new();
            for row in rows {
                let (period, model, value) = row?;
                let Some(period) = period else { continue };
                by_period.entry(period).or_default().insert(model.clone(), value);
                models.insert(model);
            }

            let datasets = models
                .into_iter()
                .map(|model| {
                    let data = window
                        .labels
                        .iter()
                        .map(|label| {
                            by_period
                                .get(label)
                                .and_then(|m| m.get(&model))
                                .copied()
                                .unwrap_or(0)
                        })
                        .collect();
                    TrendDataset { label: model, data }
                })
                .collect();

            Ok(TrendReport {
                labels: window.labels,
                datasets,
                start_date: window.start_date,
                end_date: window.end_date,
            })
        })
        .await
    }

    /// Per-day, per-model success rates over the past `days` days.
    pub async fn success_rate(
        &self,
        days: u32,
        timezone: &str,
    ) -> Result<SuccessRateReport, StoreError> {
        let tz = parse_timezone(timezone)?;
        let offset_modifier = tz_offset_modifier(tz);
        let days = days.max(1) as u64;
        let today = Utc::now().with_timezone(&tz).date_naive();
        let start = today
            .checked_sub_days(Days::new(days - 1))
            .unwrap_or(today);
        let end_exclusive = today.checked_add_days(Days::new(1)).unwrap_or(today);
        let start_ts = local_midnight_ts(tz, start);
        let end_ts = local_midnight_ts(tz, end_exclusive);
        let dates: Vec<String> = (0..days)
            .filter_map(|i| start.checked_add_days(Days::new(i)))
            .map(|d| d.format("%Y-%m-%d").to_string())
            .collect();

        self.call(move |conn| {
            let sql = format!(
                "SELECT strftime('%Y-%m-%d', request_time, 'unixepoch', '{offset_modifier}') AS day,
                        model_name,
                        SUM(is_success),
                        COUNT(*)
                 FROM request_logs
                 WHERE request_time >= ?1 AND request_time < ?2
                 GROUP BY day, model_name",
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params![start_ts, end_ts], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?.max(0) as u64,
                    row.get::<_, i64>(3)?.max(0) as u64,
                ))
            })?;

            let mut by_day: HashMap<String, BTreeMap<String, ModelSuccessRate>> = HashMap::new();
            let mut models = BTreeSet::new();
            for row in rows {
                let (day, model, successful, total) = row?;
                let Some(day) = day else { continue };
                by_day
                    .entry(day)
                    .or_default()
                    .insert(model.clone(), model_rate(successful, total));
                models.insert(model);
            }

            let stats = dates
                .into_iter()
                .map(|date| DailySuccessRate {
                    models: by_day.remove(&date).unwrap_or_default(),
                    date,
                })
                .collect();

            Ok(SuccessRateReport {
                stats,
                models: models.into_iter().collect(),
            })
        })
        .await
    }

    /// Success rates partitioned by hour-of-day in the caller's zone.
    pub async fn success_rate_hourly(
        &self,
        days: u32,
        timezone: &str,
    ) -> Result<HourlySuccessRateReport, StoreError> {
        let tz = parse_timezone(timezone)?;
        let offset_modifier = tz_offset_modifier(tz);
        let end_ts = super::now_epoch();
        let start_ts = end_ts - f64::from(days.max(1)) * 86_400.0;

        self.call(move |conn| {
            let sql = format!(
                "SELECT CAST(strftime('%H', request_time, 'unixepoch', '{offset_modifier}') AS INTEGER) AS hour,
                        model_name,
                        SUM(is_success),
                        COUNT(*)
                 FROM request_logs
                 WHERE request_time >= ?1 AND request_time <= ?2
                 GROUP BY hour, model_name",
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params![start_ts, end_ts], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?.max(0) as u64,
                    row.get::<_, i64>(3)?.max(0) as u64,
                ))
            })?;

            let mut by_hour: HashMap<u32, BTreeMap<String, ModelSuccessRate>> = HashMap::new();
            let mut models = BTreeSet::new();
            for row in rows {
                let (hour, model, successful, total) = row?;
                let hour = hour.clamp(0, 23) as u32;
                by_hour
                    .entry(hour)
                    .or_default()
                    .insert(model.clone(), model_rate(successful, total));
                models.insert(model);
            }

            let stats = (0..24)
                .map(|hour| HourlySuccessRate {
                    hour,
                    models: by_hour.remove(&hour).unwrap_or_default(),
                })
                .collect();

            Ok(HourlySuccessRateReport {
                stats,
                models: models.into_iter().collect(),
            })
        })
        .await
    }
}

fn model_rate(successful: u64, total: u64) -> ModelSuccessRate {
    let success_rate = if total == 0 {
        0.0
    } else {
        successful as f64 / total as f64 * 100.0
    };
    ModelSuccessRate {
        successful_requests: successful,
        total_requests: total,
        success_rate,
    }
}
