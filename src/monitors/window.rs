use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Time-bounded series of samples with an on-demand mean
#[derive(Debug, Clone)]
pub struct RollingWindow {
    length: TimeDelta,
    points: VecDeque<(DateTime<Utc>, f64)>,
}

impl RollingWindow {
    pub fn new(length: Duration) -> Self {
        Self {
            length: TimeDelta::from_std(length).unwrap_or(TimeDelta::MAX),
            points: VecDeque::new(),
        }
    }

    /// Append a sample and drop everything at or before `timestamp - length`.
    pub fn add(&mut self, timestamp: DateTime<Utc>, value: f64) {
        self.points.push_back((timestamp, value));
        self.trim(timestamp);
    }

    pub fn trim(&mut self, now: DateTime<Utc>) {
        let Some(cutoff) = now.checked_sub_signed(self.length) else {
            return;
        };
        while let Some((oldest, _)) = self.points.front() {
            if *oldest > cutoff {
                break;
            }
            self.points.pop_front();
        }
    }

    /// Mean of the retained points, 0.0 when empty.
    pub fn average(&self) -> f64 {
        if self.points.is_empty() {
            return 0.0;
        }
        self.points.iter().map(|(_, value)| value).sum::<f64>() / self.points.len() as f64
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn newest(&self) -> Option<DateTime<Utc>> {
        self.points.back().map(|(timestamp, _)| *timestamp)
    }

    /// No retained sample is younger than the window length.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.newest()
            .is_none_or(|newest| now.signed_duration_since(newest) > self.length)
    }
}
