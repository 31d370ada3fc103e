//! Pending REST request/response correlation.
//!
//! Every outbound request that expects a response is tracked by an
//! [`RrId`] until the response (or a synthetic teardown response)
//! arrives. Records carry a typed continuation instead of a callback
//! pointer; the response dispatcher matches on [`RrKind`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Round trips slower than this are logged.
const GUARD_TIME: Duration = Duration::from_secs(5);

/// Correlation id of one pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RrId(u64);

impl std::fmt::Display for RrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rr-{}", self.0)
    }
}

/// What to do with the response. The owning conversation, when any, is
/// carried by the record itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RrKind {
    /// `GET /calls/config`
    CallConfig,
    /// `POST .../call/flows[/v2]`
    PostFlows,
    /// `PUT .../local_sdp`
    LocalSdp { flowid: String },
    /// `DELETE` of a ghost flow after a flows POST.
    GhostDelete,
    /// `DELETE` of a regular flow; response is only logged.
    FlowDelete,
}

/// One pending request.
#[derive(Debug)]
pub(crate) struct RrRecord {
    pub id: RrId,
    pub kind: RrKind,
    /// Owning conversation, when the request belongs to a call.
    pub convid: Option<String>,
    /// `METHOD path`, for logs.
    pub debug: String,
    pub ts_req: Instant,
}

/// The table of pending requests, plus running round-trip statistics.
#[derive(Debug, Default)]
pub(crate) struct RrTable {
    next_id: u64,
    pending: HashMap<RrId, RrRecord>,
    total: u64,
    acc: Duration,
    max: Duration,
}

impl RrTable {
    pub fn alloc(&mut self, convid: Option<&str>, kind: RrKind, debug: String) -> RrId {
        self.next_id += 1;
        let id = RrId(self.next_id);
        self.total += 1;
        let debug_info = &debug;
        tracing::debug!(%id, pending = self.pending.len() + 1, %debug_info, "rr alloc");
        self.pending.insert(
            id,
            RrRecord {
                id,
                kind,
                convid: convid.map(str::to_string),
                debug,
                ts_req: Instant::now(),
            },
        );
        id
    }

    /// Unlink a pending request so a late response is dropped.
    pub fn cancel(&mut self, id: RrId) -> Option<RrRecord> {
        let record = self.pending.remove(&id);
        if record.is_some() {
            tracing::debug!(%id, "rr cancelled");
        }
        record
    }

    /// Consume a pending request on response arrival, recording the
    /// round-trip time and warning past the guard time.
    pub fn take_response(&mut self, id: RrId) -> Option<RrRecord> {
        let record = self.pending.remove(&id)?;

        let rtt = record.ts_req.elapsed();
        if rtt > GUARD_TIME {
            tracing::warn!(
                rtt_ms = rtt.as_millis() as u64,
                guard_ms = GUARD_TIME.as_millis() as u64,
                debug = %record.debug,
                "slow request"
            );
        }
        self.acc += rtt;
        if rtt > self.max {
            self.max = rtt;
        }
        tracing::debug!(
            rtt_ms = rtt.as_millis() as u64,
            avg_ms = (self.acc.as_millis() as f64 / self.total.max(1) as f64) as u64,
            max_ms = self.max.as_millis() as u64,
            debug = %record.debug,
            "rr response"
        );

        Some(record)
    }

    #[cfg(test)]
    pub fn contains(&self, id: RrId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Cancel every request owned by one conversation.
    pub fn cancel_for_call(&mut self, convid: &str) -> Vec<RrRecord> {
        let ids: Vec<RrId> = self
            .pending
            .values()
            .filter(|r| r.convid.as_deref() == Some(convid))
            .map(|r| r.id)
            .collect();
        ids.into_iter().filter_map(|id| self.cancel(id)).collect()
    }

    /// Take every pending request, for the synthetic teardown responses.
    pub fn drain_all(&mut self) -> Vec<RrRecord> {
        let mut records: Vec<RrRecord> = self.pending.drain().map(|(_, r)| r).collect();
        records.sort_by_key(|r| r.id.0);
        records
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn alloc_take_roundtrip() {
        let mut table = RrTable::default();
        let id = table.alloc(Some("cv1"), RrKind::CallConfig, "GET /calls/config".into());
        assert!(table.contains(id));
        let record = table.take_response(id).unwrap();
        assert_eq!(record.kind, RrKind::CallConfig);
        assert!(!table.contains(id));
        assert!(table.take_response(id).is_none());
    }

    #[test]
    fn cancel_drops_late_response() {
        let mut table = RrTable::default();
        let id = table.alloc(None, RrKind::CallConfig, "GET /calls/config".into());
        assert!(table.cancel(id).is_some());
        assert!(table.take_response(id).is_none());
    }

    #[test]
    fn cancel_for_call_only_touches_that_call() {
        let mut table = RrTable::default();
        let a = table.alloc(
            Some("cv1"),
            RrKind::PostFlows,
            "POST /conversations/cv1/call/flows".into(),
        );
        let b = table.alloc(
            Some("cv2"),
            RrKind::PostFlows,
            "POST /conversations/cv2/call/flows".into(),
        );
        let cancelled = table.cancel_for_call("cv1");
        assert_eq!(cancelled.len(), 1);
        assert!(!table.contains(a));
        assert!(table.contains(b));
    }

    #[test]
    fn drain_is_ordered_and_complete() {
        let mut table = RrTable::default();
        let a = table.alloc(None, RrKind::CallConfig, "GET /calls/config".into());
        let b = table.alloc(None, RrKind::CallConfig, "GET /calls/config".into());
        let drained = table.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, a);
        assert_eq!(drained[1].id, b);
        assert_eq!(table.outstanding(), 0);
    }
}
