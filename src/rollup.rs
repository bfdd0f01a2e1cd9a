use jiff::Zoned;
use serde::{Deserialize, Serialize};

use crate::codec::Batch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Bucket {
    Day,
    Week,
    Month,
}

impl Bucket {
    pub const ALL: [Bucket; 3] = [Bucket::Day, Bucket::Week, Bucket::Month];

    /// Period this bucket covers at `now`.
    /// Day: `YYYY-MM-DD`, Week: ISO `YYYY-WW`, Month: `YYYY-MM`
    pub fn period(self, now: &Zoned) -> String {
        match self {
            Self::Day => now.strftime("%Y-%m-%d").to_string(),
            Self::Week => {
                let iso = now.date().iso_week_date();
                format!("{:04}-{:02}", iso.year(), iso.week())
            }
            Self::Month => now.strftime("%Y-%m").to_string(),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "day" | "daily" => Self::Day,
            "week" | "weekly" => Self::Week,
            "month" | "monthly" => Self::Month,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RollupKey {
    pub bucket: Bucket,
    pub period: String,
    pub sensor: String,
}

/// Increment for one bucket produced by one batch.
/// Never a running total, see [`crate::storage::RollupWriteMode`].
#[derive(Debug, Clone, PartialEq)]
pub struct RollupRecord {
    pub key: RollupKey,
    pub sum: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rollup {
    pub sum: f64,
    pub day: RollupKey,
    pub week: RollupKey,
    pub month: RollupKey,
}

impl Rollup {
    pub fn records(&self) -> [RollupRecord; 3] {
        [&self.day, &self.week, &self.month].map(|key| RollupRecord {
            key: key.clone(),
            sum: self.sum,
        })
    }
}

/// Sums a batch and keys it by processing time, not by reading timestamps.
pub fn aggregate(batch: &Batch, now: &Zoned) -> Rollup {
    // naive left to right, order dependent on purpose
    let sum = batch.readings.iter().fold(0.0, |acc, r| acc + r.v);

    let key = |bucket: Bucket| RollupKey {
        bucket,
        period: bucket.period(now),
        sensor: batch.sensor.clone(),
    };

    Rollup {
        sum,
        day: key(Bucket::Day),
        week: key(Bucket::Week),
        month: key(Bucket::Month),
    }
}
