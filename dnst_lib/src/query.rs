use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::fakeip::FakeIpPool;

/// Verbose threshold for a query's trace output, ordered from most to
/// least chatty. A rule/action/matcher trace line is kept only when its
/// own level is `>=` the query's current threshold -- mirrors
/// `Trace.verbose_lvl` in the distilled source exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Verbosity {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Err = 3,
    None = 4,
}

impl Verbosity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(Verbosity::Debug),
            "info" => Some(Verbosity::Info),
            "warn" => Some(Verbosity::Warn),
            "err" => Some(Verbosity::Err),
            "none" => Some(Verbosity::None),
            _ => None,
        }
    }
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Warn
    }
}

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

/// Accumulates formatted trace lines for one query, flushed to the
/// structured logger after each rule the way the distilled source
/// flushes `trace_logs` after `DNSTRule.apply`.
#[derive(Debug, Default)]
pub struct TraceBuffer {
    lines: Vec<String>,
}

impl TraceBuffer {
    /// Record a line if `level` clears the query's verbose threshold.
    /// `msg` is a closure so callers can defer expensive formatting --
    /// the same trick as the distilled source's `lambda: ...` producers.
    pub fn push(&mut self, threshold: Verbosity, level: Verbosity, msg: impl FnOnce() -> String) {
        if level >= threshold {
            let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
            self.lines.push(format!("[{now}] level={level:?} {}", msg()));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Flush the buffer into a single tracing event carrying the query
    /// id, then clear it, preserving the "lines for one rule emitted
    /// contiguously" ordering guarantee without a hand-rolled sink.
    pub fn flush(&mut self, query_id: u64) {
        if self.lines.is_empty() {
            return;
        }
        let block = self.lines.join("\n");
        tracing::debug!(query_id, "{block}");
        self.lines.clear();
    }
}

/// The unit of work fed into the rule engine. IPv4-only (see Non-goals).
#[derive(Debug)]
pub struct Query {
    pub query_id: u64,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub qname: String,
    pub qtype: QType,
    pub raw_query: Bytes,
    pub verbose_level: Verbosity,
    pub answer: Vec<(Ipv4Addr, u32)>,
    pub trace: TraceBuffer,
    pub fake_pool_ref: Option<Arc<FakeIpPool>>,
}

/// Only `A` is processed by the core; anything else short-circuits to
/// NXDOMAIN at the binary-crate boundary before a `Query` is even built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QType {
    A,
    Other,
}

impl Query {
    pub fn new(
        src_ip: Ipv4Addr,
        src_port: u16,
        qname: &str,
        qtype: QType,
        raw_query: Bytes,
        verbose_level: Verbosity,
    ) -> Self {
        let qname = qname.trim_end_matches('.').to_ascii_lowercase();
        Query {
            query_id: NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed),
            src_ip,
            src_port,
            qname,
            qtype,
            raw_query,
            verbose_level,
            answer: Vec::new(),
            trace: TraceBuffer::default(),
            fake_pool_ref: None,
        }
    }

    pub fn has_answer(&self) -> bool {
        !self.answer.is_empty()
    }

    pub fn set_verbose(&mut self, level: Verbosity) {
        self.verbose_level = level;
    }

    pub fn trace(&mut self, level: Verbosity, msg: impl FnOnce() -> String) {
        let threshold = self.verbose_level;
        self.trace.push(threshold, level, msg);
    }

    /// Called after every rule, matching `DNSTQuery.trace_flush`.
    pub fn flush_trace(&mut self) {
        self.trace.flush(self.query_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qname_is_lowercased_and_dotless() {
        let q = Query::new(
            Ipv4Addr::new(1, 2, 3, 4),
            5353,
            "WWW.Example.COM.",
            QType::A,
            Bytes::new(),
            Verbosity::Warn,
        );
        assert_eq!(q.qname, "www.example.com");
    }

    #[test]
    fn has_answer_reflects_answer_vec() {
        let mut q = Query::new(
            Ipv4Addr::new(1, 2, 3, 4),
            5353,
            "foo",
            QType::A,
            Bytes::new(),
            Verbosity::Warn,
        );
        assert!(!q.has_answer());
        q.answer.push((Ipv4Addr::new(9, 9, 9, 9), 60));
        assert!(q.has_answer());
    }

    #[test]
    fn verbosity_ordering_filters_low_severity_below_threshold() {
        assert!(Verbosity::Err >= Verbosity::Warn);
        assert!(Verbosity::Debug < Verbosity::Warn);
    }
}
