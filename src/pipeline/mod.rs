// SPDX-License-Identifier: Apache-2.0

//! Per-file transformation pipelines.
//!
//! Exactly one pipeline kind is active per watched file. A line enters,
//! zero or more records leave. Nothing a pipeline does can take the process
//! down; evaluation failures drop the one line and are logged.

pub mod aggregate;
pub mod script;
pub mod split;
pub mod timefmt;

use tracing::warn;

use crate::pipeline::aggregate::AggregationCache;
use crate::pipeline::script::{ScriptCall, ScriptHost, ScriptReturn};
use crate::pipeline::split::{absidx, split};
use crate::pipeline::timefmt::to_iso8601;

/// One record produced by a pipeline, before routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emitted {
    pub payload: Vec<u8>,
    /// False for aggregation flushes, which do not map to file bytes and
    /// must not advance the persisted offset.
    pub offset_bearing: bool,
    /// Normalised time key attached to the record, when the file declares
    /// one. Used for index templating.
    pub time_key: Option<String>,
}

impl Emitted {
    fn from_line(payload: Vec<u8>, time_key: Option<String>) -> Self {
        Self {
            payload,
            offset_bearing: true,
            time_key,
        }
    }

    fn from_flush(payload: String, time_key: &str) -> Self {
        Self {
            payload: payload.into_bytes(),
            offset_bearing: false,
            time_key: Some(time_key.to_string()),
        }
    }
}

enum Kind {
    Raw,
    Transform(Box<dyn ScriptHost>),
    Grep(Box<dyn ScriptHost>),
    Filter(Vec<i32>),
    Aggregate {
        host: Box<dyn ScriptHost>,
        cache: AggregationCache,
    },
}

#[derive(Clone, Copy)]
enum KindTag {
    Raw,
    Transform,
    Grep,
    Filter,
    Aggregate,
}

pub struct Pipeline {
    kind: Kind,
    host: String,
    withhost: bool,
    withtime: bool,
    timeidx: Option<i32>,
}

impl Pipeline {
    pub fn raw(host: String, withhost: bool, withtime: bool, timeidx: Option<i32>) -> Self {
        Self::new(Kind::Raw, host, withhost, withtime, timeidx)
    }

    pub fn transform(
        script: Box<dyn ScriptHost>,
        host: String,
        withhost: bool,
        withtime: bool,
        timeidx: Option<i32>,
    ) -> Self {
        Self::new(Kind::Transform(script), host, withhost, withtime, timeidx)
    }

    pub fn grep(
        script: Box<dyn ScriptHost>,
        host: String,
        withhost: bool,
        withtime: bool,
        timeidx: Option<i32>,
    ) -> Self {
        Self::new(Kind::Grep(script), host, withhost, withtime, timeidx)
    }

    pub fn filter(
        fields: Vec<i32>,
        host: String,
        withhost: bool,
        withtime: bool,
        timeidx: Option<i32>,
    ) -> Self {
        Self::new(Kind::Filter(fields), host, withhost, withtime, timeidx)
    }

    pub fn aggregate(
        script: Box<dyn ScriptHost>,
        host: String,
        withhost: bool,
        withtime: bool,
        timeidx: Option<i32>,
    ) -> Self {
        Self::new(
            Kind::Aggregate {
                host: script,
                cache: AggregationCache::new(),
            },
            host,
            withhost,
            withtime,
            timeidx,
        )
    }

    fn new(kind: Kind, host: String, withhost: bool, withtime: bool, timeidx: Option<i32>) -> Self {
        Self {
            kind,
            host,
            withhost,
            withtime,
            timeidx,
        }
    }

    fn tag(&self) -> KindTag {
        match self.kind {
            Kind::Raw => KindTag::Raw,
            Kind::Transform(_) => KindTag::Transform,
            Kind::Grep(_) => KindTag::Grep,
            Kind::Filter(_) => KindTag::Filter,
            Kind::Aggregate { .. } => KindTag::Aggregate,
        }
    }

    fn host_prefix(&self) -> Option<&str> {
        if self.withhost {
            Some(&self.host)
        } else {
            None
        }
    }

    /// Run one line through the pipeline. `line` carries its trailing
    /// newline when the source had one; scripted and field kinds see the
    /// line without it.
    pub fn process_line(&mut self, file: &str, line: &[u8]) -> Vec<Emitted> {
        match self.tag() {
            KindTag::Raw => vec![Emitted::from_line(line.to_vec(), None)],
            KindTag::Transform => self.process_transform(file, line),
            KindTag::Grep => self.process_grep(file, line),
            KindTag::Filter => self.process_filter(file, line),
            KindTag::Aggregate => self.process_aggregate(file, line),
        }
    }

    fn process_transform(&mut self, file: &str, line: &[u8]) -> Vec<Emitted> {
        let text = String::from_utf8_lossy(strip_newline(line)).into_owned();
        let withhost = self.withhost;
        let host = self.host.clone();
        let Kind::Transform(script) = &mut self.kind else {
            unreachable!()
        };
        match script.evaluate(ScriptCall::Transform { line: &text }) {
            Ok(ScriptReturn::Line(out)) => {
                let payload = if withhost {
                    format!("{host} {out}")
                } else {
                    out
                };
                vec![Emitted::from_line(payload.into_bytes(), None)]
            }
            Ok(ScriptReturn::Drop) => Vec::new(),
            Ok(_) => {
                warn!(file, "transform returned an unexpected shape");
                Vec::new()
            }
            Err(e) => {
                warn!(file, error = %e, "transform failed, line dropped");
                Vec::new()
            }
        }
    }

    fn process_grep(&mut self, file: &str, line: &[u8]) -> Vec<Emitted> {
        let Some((fields, time_key)) = self.split_fields(file, line) else {
            return Vec::new();
        };
        let withhost = self.withhost;
        let host = self.host.clone();
        let Kind::Grep(script) = &mut self.kind else {
            unreachable!()
        };
        match script.evaluate(ScriptCall::Grep { fields: &fields }) {
            Ok(ScriptReturn::Fields(out)) => {
                let payload = join_with_host(withhost.then_some(host.as_str()), out.iter());
                vec![Emitted::from_line(payload.into_bytes(), time_key)]
            }
            Ok(ScriptReturn::Drop) => Vec::new(),
            Ok(_) => {
                warn!(file, "grep returned an unexpected shape");
                Vec::new()
            }
            Err(e) => {
                warn!(file, error = %e, "grep failed, line dropped");
                Vec::new()
            }
        }
    }

    fn process_filter(&mut self, file: &str, line: &[u8]) -> Vec<Emitted> {
        let Some((fields, time_key)) = self.split_fields(file, line) else {
            return Vec::new();
        };
        let Kind::Filter(selectors) = &self.kind else {
            unreachable!()
        };
        let mut selected = Vec::with_capacity(selectors.len());
        for sel in selectors {
            match absidx(*sel, fields.len()) {
                Some(i) => selected.push(fields[i].clone()),
                None => {
                    warn!(file, selector = sel, "filter index out of range, line dropped");
                    return Vec::new();
                }
            }
        }
        let payload = join_with_host(self.host_prefix(), selected.iter());
        vec![Emitted::from_line(payload.into_bytes(), time_key)]
    }

    fn process_aggregate(&mut self, file: &str, line: &[u8]) -> Vec<Emitted> {
        let Some((fields, time_key)) = self.split_fields(file, line) else {
            return Vec::new();
        };
        // aggregate requires timeidx; the loader enforces it
        let Some(time_key) = time_key else {
            warn!(file, "aggregate line without a time key, dropped");
            return Vec::new();
        };

        let withtime = self.withtime;
        let host = self.withhost.then(|| self.host.clone());
        let Kind::Aggregate { host: script, cache } = &mut self.kind else {
            unreachable!()
        };

        // Rollover happens before evaluation: the flushed records belong to
        // the previous time key even when this line's callback fails.
        let old_key = cache.last_time_key().to_string();
        let out: Vec<Emitted> = cache
            .roll(&time_key, host.as_deref(), withtime)
            .into_iter()
            .map(|payload| Emitted::from_flush(payload, &old_key))
            .collect();

        match script.evaluate(ScriptCall::Aggregate { fields: &fields }) {
            Ok(ScriptReturn::Deltas { key, deltas }) => {
                cache.accumulate(key, deltas);
            }
            Ok(_) => {
                warn!(file, "aggregate returned an unexpected shape");
            }
            Err(e) => {
                warn!(file, error = %e, "aggregate failed, line dropped");
            }
        }
        out
    }

    /// Drain the aggregation cache regardless of time-key equality. No-op
    /// for other kinds.
    pub fn flush_stale(&mut self) -> Vec<Emitted> {
        let host = self.withhost.then(|| self.host.clone());
        let withtime = self.withtime;
        match &mut self.kind {
            Kind::Aggregate { cache, .. } if !cache.is_empty() => {
                let time_key = cache.last_time_key().to_string();
                cache
                    .flush(host.as_deref(), withtime)
                    .into_iter()
                    .map(|payload| Emitted::from_flush(payload, &time_key))
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn has_pending_aggregation(&self) -> bool {
        matches!(&self.kind, Kind::Aggregate { cache, .. } if !cache.is_empty())
    }

    /// Split the line and normalise the declared time field in place.
    /// Returns None when the line must be dropped.
    fn split_fields(&self, file: &str, line: &[u8]) -> Option<(Vec<String>, Option<String>)> {
        let text = String::from_utf8_lossy(strip_newline(line));
        let mut fields = split(&text);

        let mut time_key = None;
        if let Some(timeidx) = self.timeidx {
            let Some(i) = absidx(timeidx, fields.len()) else {
                warn!(file, timeidx, "time field out of range, line dropped");
                return None;
            };
            let Some(iso) = to_iso8601(&fields[i]) else {
                warn!(file, value = %fields[i], "malformed timestamp, line dropped");
                return None;
            };
            fields[i] = iso.clone();
            time_key = Some(iso);
        }

        Some((fields, time_key))
    }
}

fn strip_newline(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\n') => &line[..line.len() - 1],
        _ => line,
    }
}

fn join_with_host<'a>(host: Option<&str>, parts: impl Iterator<Item = &'a String>) -> String {
    let mut s = String::new();
    if let Some(host) = host {
        s.push_str(host);
    }
    for part in parts {
        if !s.is_empty() {
            s.push(' ');
        }
        s.push_str(part);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::script::ScriptError;

    struct FnHost<F>(F);

    impl<F> ScriptHost for FnHost<F>
    where
        F: FnMut(ScriptCall<'_>) -> Result<ScriptReturn, ScriptError> + Send,
    {
        fn evaluate(&mut self, call: ScriptCall<'_>) -> Result<ScriptReturn, ScriptError> {
            (self.0)(call)
        }
    }

    fn line(s: &str) -> Vec<u8> {
        let mut v = s.as_bytes().to_vec();
        v.push(b'\n');
        v
    }

    #[test]
    fn raw_payload_is_verbatim() {
        let mut p = Pipeline::raw("host1".into(), true, true, None);
        let out = p.process_line("f", &line("abcd"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload, b"abcd\n");
        assert!(out[0].offset_bearing);
        assert_eq!(out[0].time_key, None);
    }

    #[test]
    fn transform_prefixes_host_and_drops_nil() {
        let script = FnHost(|call: ScriptCall<'_>| {
            let ScriptCall::Transform { line } = call else {
                panic!("wrong call kind")
            };
            if line.starts_with("[error]") {
                Ok(ScriptReturn::Line(line.to_string()))
            } else {
                Ok(ScriptReturn::Drop)
            }
        });
        let mut p = Pipeline::transform(Box::new(script), "h".into(), true, true, None);

        let out = p.process_line("f", &line("[error] this"));
        assert_eq!(out[0].payload, b"h [error] this");

        let out = p.process_line("f", &line("[debug] that"));
        assert!(out.is_empty());
    }

    #[test]
    fn transform_without_host_prefix() {
        let script = FnHost(|call: ScriptCall<'_>| {
            let ScriptCall::Transform { line } = call else {
                panic!("wrong call kind")
            };
            Ok(ScriptReturn::Line(line.to_string()))
        });
        let mut p = Pipeline::transform(Box::new(script), "h".into(), false, true, None);
        let out = p.process_line("f", &line("[error] this"));
        assert_eq!(out[0].payload, b"[error] this");
    }

    #[test]
    fn filter_selects_fields_in_order() {
        let mut p = Pipeline::filter(vec![4, 5, 6, -1], "hh".into(), true, true, Some(4));
        let out = p.process_line(
            "f",
            &line("- - - [2/Apr/2015:12:05:05] \"GET / HTTP/1.0\" 200 - - 95555"),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(
            String::from_utf8(out[0].payload.clone()).unwrap(),
            "hh 2015-04-02T12:05:05 GET / HTTP/1.0 200 95555"
        );
        assert_eq!(out[0].time_key.as_deref(), Some("2015-04-02T12:05:05"));
    }

    #[test]
    fn filter_out_of_range_drops_line() {
        let mut p = Pipeline::filter(vec![9], "h".into(), true, true, None);
        assert!(p.process_line("f", &line("a b c")).is_empty());
    }

    #[test]
    fn malformed_timestamp_drops_line() {
        let mut p = Pipeline::filter(vec![1], "h".into(), true, true, Some(2));
        assert!(p.process_line("f", &line("a not-a-time c")).is_empty());
    }

    #[test]
    fn grep_joins_returned_fields() {
        let script = FnHost(|call: ScriptCall<'_>| {
            let ScriptCall::Grep { fields } = call else {
                panic!("wrong call kind")
            };
            Ok(ScriptReturn::Fields(vec![
                fields[3].clone(),
                format!("\"{}\"", fields[4]),
                fields[5].clone(),
            ]))
        });
        let mut p = Pipeline::grep(Box::new(script), "h".into(), true, true, Some(4));
        let out = p.process_line(
            "f",
            &line("- - - [2/Apr/2015:12:05:05] \"GET / HTTP/1.0\" 200"),
        );
        assert_eq!(
            String::from_utf8(out[0].payload.clone()).unwrap(),
            "h 2015-04-02T12:05:05 \"GET / HTTP/1.0\" 200"
        );
    }

    #[test]
    fn script_failure_drops_only_the_line() {
        let script = FnHost(|_: ScriptCall<'_>| Err(ScriptError::Eval("boom".into())));
        let mut p = Pipeline::transform(Box::new(script), "h".into(), true, true, None);
        assert!(p.process_line("f", &line("x")).is_empty());

        // The pipeline is still usable afterwards.
        let script = FnHost(|_: ScriptCall<'_>| Ok(ScriptReturn::Line("y".into())));
        let mut p = Pipeline::transform(Box::new(script), "h".into(), true, true, None);
        assert_eq!(p.process_line("f", &line("x"))[0].payload, b"h y");
    }

    fn aggregate_pipeline() -> Pipeline {
        let script = FnHost(|call: ScriptCall<'_>| {
            let ScriptCall::Aggregate { fields } = call else {
                panic!("wrong call kind")
            };
            // key from the last field, one count per status field
            Ok(ScriptReturn::Deltas {
                key: fields[fields.len() - 1].clone(),
                deltas: vec![(format!("status_{}", fields[2]), 1)],
            })
        });
        Pipeline::aggregate(Box::new(script), "h".into(), true, true, Some(2))
    }

    #[test]
    fn aggregate_rollover_emits_prior_bucket() {
        let mut p = aggregate_pipeline();

        assert!(p
            .process_line("f", &line("- [2/Apr/2015:12:05:04] 200 10086"))
            .is_empty());
        assert!(p
            .process_line("f", &line("- [2/Apr/2015:12:05:04] 200 10086"))
            .is_empty());

        let out = p.process_line("f", &line("- [2/Apr/2015:12:05:05] 404 95555"));
        assert_eq!(out.len(), 1);
        assert_eq!(
            String::from_utf8(out[0].payload.clone()).unwrap(),
            "h 2015-04-02T12:05:04 10086 status_200=2"
        );
        assert!(!out[0].offset_bearing);
        assert_eq!(out[0].time_key.as_deref(), Some("2015-04-02T12:05:04"));
    }

    #[test]
    fn aggregate_stale_flush() {
        let mut p = aggregate_pipeline();
        p.process_line("f", &line("- [2/Apr/2015:12:05:04] 200 10086"));
        assert!(p.has_pending_aggregation());

        let out = p.flush_stale();
        assert_eq!(out.len(), 1);
        assert_eq!(
            String::from_utf8(out[0].payload.clone()).unwrap(),
            "h 2015-04-02T12:05:04 10086 status_200=1"
        );
        assert!(!p.has_pending_aggregation());
        assert!(p.flush_stale().is_empty());
    }
}
