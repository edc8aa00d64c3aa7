// SPDX-License-Identifier: Apache-2.0

//! Time-keyed aggregation cache.
//!
//! Accumulates integer deltas under `(primary_key, secondary_key)` and
//! drains either when the time key rolls over or when the owning file goes
//! stale. Ordered maps keep the serialised `key=value` output stable.

use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct AggregationCache {
    buckets: BTreeMap<String, BTreeMap<String, i64>>,
    last_time_key: String,
}

impl AggregationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn last_time_key(&self) -> &str {
        &self.last_time_key
    }

    /// Observe the time key of the current line. If it differs from the
    /// cached key, the prior bucket is serialised and cleared; the returned
    /// records belong to the *old* time key.
    pub fn roll(&mut self, time_key: &str, host: Option<&str>, withtime: bool) -> Vec<String> {
        let mut flushed = Vec::new();
        if !self.last_time_key.is_empty() && time_key != self.last_time_key {
            flushed = self.serialize(host, withtime);
            self.buckets.clear();
        }
        self.last_time_key = time_key.to_string();
        flushed
    }

    /// Fold one callback result into the bucket.
    pub fn accumulate(&mut self, key: String, deltas: Vec<(String, i64)>) {
        let bucket = self.buckets.entry(key).or_default();
        for (k, delta) in deltas {
            *bucket.entry(k).or_insert(0) += delta;
        }
    }

    /// Drain everything regardless of time-key equality (staleness flush and
    /// shutdown path).
    pub fn flush(&mut self, host: Option<&str>, withtime: bool) -> Vec<String> {
        if self.buckets.is_empty() {
            return Vec::new();
        }
        let out = self.serialize(host, withtime);
        self.buckets.clear();
        out
    }

    /// One record per primary key: `host SP lasttime SP pkey k=v k=v ...`,
    /// with the host and time prefixes subject to their flags.
    fn serialize(&self, host: Option<&str>, withtime: bool) -> Vec<String> {
        self.buckets
            .iter()
            .map(|(pkey, bucket)| {
                let mut s = String::new();
                if let Some(host) = host {
                    s.push_str(host);
                    s.push(' ');
                }
                if withtime {
                    s.push_str(&self.last_time_key);
                    s.push(' ');
                }
                s.push_str(pkey);
                for (k, v) in bucket {
                    s.push(' ');
                    s.push_str(k);
                    s.push('=');
                    s.push_str(&v.to_string());
                }
                s
            })
            .collect()
    }
}
