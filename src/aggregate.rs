//! Time-bucketed aggregation and summary statistics over reading windows.
//!
//! Buckets align to the UTC calendar: an hour bucket is `[HH:00, HH+1:00)`,
//! a week bucket starts Monday 00:00, a month bucket on the 1st. SQLite has
//! no calendar truncation, so the window is fetched ordered and folded here.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use std::collections::BTreeMap;

use crate::models::reading::{AggregateBucket, ChannelStats, Granularity, Reading};
use crate::store::iso_from;

/// Truncate an instant to the start of its bucket.
pub fn bucket_start(granularity: Granularity, t: DateTime<Utc>) -> DateTime<Utc> {
    let date = t.date_naive();
    match granularity {
        Granularity::Minute => Utc
            .with_ymd_and_hms(date.year(), date.month(), date.day(), t.hour(), t.minute(), 0)
            .single()
            .unwrap_or(t),
        Granularity::Hour => Utc
            .with_ymd_and_hms(date.year(), date.month(), date.day(), t.hour(), 0, 0)
            .single()
            .unwrap_or(t),
        Granularity::Day => midnight(date),
        Granularity::Week => {
            let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
            midnight(monday)
        }
        Granularity::Month => {
            midnight(NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date))
        }
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(date.year(), date.month(), date.day(), 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

#[derive(Default)]
struct ChannelAccum {
    min: f64,
    max: f64,
    sum: f64,
    count: i64,
}

impl ChannelAccum {
    fn push(&mut self, v: f64) {
        if self.count == 0 {
            self.min = v;
            self.max = v;
        } else {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        self.sum += v;
        self.count += 1;
    }

    fn finish(&self) -> Option<ChannelStats> {
        if self.count == 0 {
            return None;
        }
        Some(ChannelStats {
            min: self.min,
            max: self.max,
            avg: self.sum / self.count as f64,
            count: self.count,
        })
    }
}

#[derive(Default)]
struct BucketAccum {
    count: i64,
    ph: ChannelAccum,
    turbidity: ChannelAccum,
    tds: ChannelAccum,
}

/// Fold an ascending reading window into calendar-aligned buckets. Empty
/// buckets are omitted; channels only aggregate samples with `_valid=true`.
pub fn aggregate(readings: &[Reading], granularity: Granularity) -> Vec<AggregateBucket> {
    let mut buckets: BTreeMap<i64, BucketAccum> = BTreeMap::new();
    for r in readings {
        let Some(t) = DateTime::from_timestamp_millis(r.timestamp_ms) else {
            continue;
        };
        let key = bucket_start(granularity, t).timestamp_millis();
        let acc = buckets.entry(key).or_default();
        acc.count += 1;
        if r.ph_valid && let Some(v) = r.ph {
            acc.ph.push(v);
        }
        if r.turbidity_valid && let Some(v) = r.turbidity {
            acc.turbidity.push(v);
        }
        if r.tds_valid && let Some(v) = r.tds {
            acc.tds.push(v);
        }
    }
    buckets
        .into_iter()
        .filter_map(|(key_ms, acc)| {
            let start = DateTime::from_timestamp_millis(key_ms)?;
            let key = iso_from(start);
            Some(AggregateBucket {
                bucket_key: key.clone(),
                timestamp: key,
                count: acc.count,
                ph: acc.ph.finish(),
                turbidity: acc.turbidity.finish(),
                tds: acc.tds.finish(),
            })
        })
        .collect()
}

/// Extended per-channel summary used by report bundles.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChannelSummary {
    pub count: i64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub median: f64,
    pub stddev: f64,
}

pub fn channel_summary(values: &[f64]) -> Option<ChannelSummary> {
    if values.is_empty() {
        return None;
    }
    let count = values.len();
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let min = sorted[0];
    let max = sorted[count - 1];
    let sum: f64 = sorted.iter().sum();
    let avg = sum / count as f64;
    let median = if count % 2 == 0 {
        (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
    } else {
        sorted[count / 2]
    };
    let variance = sorted.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / count as f64;
    Some(ChannelSummary {
        count: count as i64,
        min,
        max,
        avg,
        median,
        stddev: variance.sqrt(),
    })
}

/// `(in_range / total) * 100` over valid samples; `None` with no samples.
pub fn compliance_percent(values: &[f64], in_range: impl Fn(f64) -> bool) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let ok = values.iter().filter(|v| in_range(**v)).count();
    Some(ok as f64 / values.len() as f64 * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(device: &str, ts_ms: i64, ph: f64) -> Reading {
        Reading {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device.to_string(),
            timestamp_ms: ts_ms,
            ph: Some(ph),
            turbidity: Some(1.0),
            tds: Some(200.0),
            ph_valid: true,
            turbidity_valid: true,
            tds_valid: true,
            is_deleted: false,
            created_at: crate::store::now_iso(),
        }
    }

    fn ms(s: &str) -> i64 {
        crate::store::parse_iso(s).unwrap().timestamp_millis()
    }

    #[test]
    fn minute_buckets_align_and_average() {
        let t0 = ms("2026-03-01T14:05:00Z");
        let readings = vec![
            reading("D1", t0, 7.0),
            reading("D1", t0 + 30_000, 7.2),
            reading("D1", t0 + 60_000, 7.4),
            reading("D1", t0 + 90_000, 7.8),
        ];
        let buckets = aggregate(&readings, Granularity::Minute);
        assert_eq!(buckets.len(), 2);

        let b1 = &buckets[0];
        assert_eq!(b1.bucket_key, "2026-03-01T14:05:00Z");
        assert_eq!(b1.count, 2);
        let ph = b1.ph.as_ref().unwrap();
        assert!((ph.avg - 7.1).abs() < 1e-9);
        assert_eq!(ph.min, 7.0);
        assert_eq!(ph.max, 7.2);

        let b2 = &buckets[1];
        assert_eq!(b2.count, 2);
        let ph = b2.ph.as_ref().unwrap();
        assert!((ph.avg - 7.6).abs() < 1e-9);
        assert_eq!(ph.min, 7.4);
        assert_eq!(ph.max, 7.8);
    }

    #[test]
    fn bucket_counts_cover_the_window() {
        let t0 = ms("2026-03-01T23:59:00Z");
        let readings: Vec<Reading> = (0..10)
            .map(|i| reading("D1", t0 + i * 30_000, 7.0))
            .collect();
        let buckets = aggregate(&readings, Granularity::Day);
        let total: i64 = buckets.iter().map(|b| b.count).sum();
        assert_eq!(total, 10);
        assert_eq!(buckets.len(), 2); // window straddles midnight
    }

    #[test]
    fn week_starts_monday_month_starts_first() {
        // 2026-03-04 is a Wednesday.
        let wed = crate::store::parse_iso("2026-03-04T13:30:45Z").unwrap();
        assert_eq!(
            iso_from(bucket_start(Granularity::Week, wed)),
            "2026-03-02T00:00:00Z"
        );
        assert_eq!(
            iso_from(bucket_start(Granularity::Month, wed)),
            "2026-03-01T00:00:00Z"
        );
        assert_eq!(
            iso_from(bucket_start(Granularity::Hour, wed)),
            "2026-03-04T13:00:00Z"
        );
    }

    #[test]
    fn invalid_channels_are_excluded() {
        let t0 = ms("2026-03-01T10:00:00Z");
        let mut r = reading("D1", t0, 7.0);
        r.ph_valid = false;
        let buckets = aggregate(&[r], Granularity::Hour);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].count, 1);
        assert!(buckets[0].ph.is_none());
        assert!(buckets[0].turbidity.is_some());
    }

    #[test]
    fn summary_median_and_stddev() {
        let s = channel_summary(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(s.median, 2.5);
        assert_eq!(s.avg, 2.5);
        assert!((s.stddev - 1.118_033_988_749_895).abs() < 1e-9);
        let s = channel_summary(&[5.0, 1.0, 3.0]).unwrap();
        assert_eq!(s.median, 3.0);
        assert!(channel_summary(&[]).is_none());
    }

    #[test]
    fn compliance_is_a_percentage() {
        let pct = compliance_percent(&[7.0, 7.2, 9.5, 6.0], |v| (6.5..=8.5).contains(&v));
        assert_eq!(pct, Some(50.0));
        assert_eq!(compliance_percent(&[], |_| true), None);
    }
}
