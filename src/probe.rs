use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::Stream;

tokio::task_local! {
    /// Probe of the attempt currently polled on this task. Hooks that run
    /// inside the client (resolver, connector) find their attempt through it.
    pub(crate) static ACTIVE_PROBE: Arc<PhaseProbe>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    DnsStart,
    DnsDone,
    /// A fresh connection finished connecting. Never set for pooled reuse.
    Acquired,
    /// The last piece of the request body was taken by the transport.
    Written,
    FirstByte,
}

/// Lifecycle timestamps of one attempt, as nanosecond offsets from the
/// dispatch start. Zero means "not observed"; each mark is set at most once.
#[derive(Debug)]
pub struct PhaseProbe {
    origin: Instant,
    dns_start: AtomicU64,
    dns_done: AtomicU64,
    acquired: AtomicU64,
    written: AtomicU64,
    first_byte: AtomicU64,
}

/// Phase breakdown of one attempt. `conn + write + wait + read` never exceeds
/// the attempt's total duration; `dns` is part of `conn`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Phases {
    pub dns: Duration,
    pub conn: Duration,
    pub write: Duration,
    pub wait: Duration,
    pub read: Duration,
}

impl PhaseProbe {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(origin: Instant) -> Self {
        Self {
            origin,
            dns_start: AtomicU64::new(0),
            dns_done: AtomicU64::new(0),
            acquired: AtomicU64::new(0),
            written: AtomicU64::new(0),
            first_byte: AtomicU64::new(0),
        }
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// Offset of "now" from the origin, never zero.
    pub fn offset(&self) -> u64 {
        (self.origin.elapsed().as_nanos() as u64).max(1)
    }

    pub fn mark(&self, mark: Mark) {
        self.mark_at(mark, self.offset());
    }

    pub fn mark_at(&self, mark: Mark, offset: u64) {
        let _ = self
            .slot(mark)
            .compare_exchange(0, offset.max(1), Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn get(&self, mark: Mark) -> Option<u64> {
        match self.slot(mark).load(Ordering::Acquire) {
            0 => None,
            offset => Some(offset),
        }
    }

    fn slot(&self, mark: Mark) -> &AtomicU64 {
        match mark {
            Mark::DnsStart => &self.dns_start,
            Mark::DnsDone => &self.dns_done,
            Mark::Acquired => &self.acquired,
            Mark::Written => &self.written,
            Mark::FirstByte => &self.first_byte,
        }
    }

    /// Derive phases for an attempt that ended at offset `finished`.
    ///
    /// Without a first response byte only the phases observed before the
    /// failure are reported. With one, unobserved marks collapse onto the
    /// last earlier mark so the breakdown stays monotone: a reused
    /// connection is acquired at the dispatch start, and a request without
    /// a body is written as soon as it is acquired.
    pub fn phases(&self, finished: u64) -> Phases {
        let dns = match (self.get(Mark::DnsStart), self.get(Mark::DnsDone)) {
            (Some(start), Some(done)) => done.saturating_sub(start),
            _ => 0,
        };
        let acquired = self.get(Mark::Acquired);
        let written = self.get(Mark::Written);

        let Some(first_byte) = self.get(Mark::FirstByte) else {
            let conn = acquired.unwrap_or(0);
            let write = match (acquired, written) {
                (Some(a), Some(w)) => w.saturating_sub(a),
                _ => 0,
            };
            return Phases {
                dns: nanos(dns),
                conn: nanos(conn),
                write: nanos(write),
                ..Phases::default()
            };
        };

        let finished = finished.max(first_byte);
        let acquired = acquired
            .or(self.get(Mark::DnsDone))
            .unwrap_or(0)
            .min(first_byte);
        let written = written.unwrap_or(acquired).clamp(acquired, first_byte);

        Phases {
            dns: nanos(dns.min(acquired)),
            conn: nanos(acquired),
            write: nanos(written - acquired),
            wait: nanos(first_byte - written),
            read: nanos(finished - first_byte),
        }
    }
}

impl Default for PhaseProbe {
    fn default() -> Self {
        Self::new()
    }
}

fn nanos(n: u64) -> Duration {
    Duration::from_nanos(n)
}

/// Size of the pieces an upload is handed to the transport in. The transport
/// only asks for the next piece once its write buffer has room, so the end
/// of the stream trails the bytes actually written by at most that buffer.
pub(crate) const UPLOAD_CHUNK: usize = 16 * 1024;

/// Request body that marks `Written` once the transport has taken the last
/// piece of the payload.
pub(crate) struct ProbedBody {
    payload: Bytes,
    probe: Arc<PhaseProbe>,
}

impl ProbedBody {
    pub(crate) fn new(payload: Bytes, probe: Arc<PhaseProbe>) -> Self {
        Self { payload, probe }
    }
}

impl Stream for ProbedBody {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.payload.is_empty() {
            self.probe.mark(Mark::Written);
            return Poll::Ready(None);
        }
        let take = self.payload.len().min(UPLOAD_CHUNK);
        let chunk = self.payload.split_to(take);
        Poll::Ready(Some(Ok(chunk)))
    }
}

impl Drop for ProbedBody {
    // With a declared length the transport drops the body after the last
    // piece instead of polling it to the end.
    fn drop(&mut self) {
        if self.payload.is_empty() {
            self.probe.mark(Mark::Written);
        }
    }
}
