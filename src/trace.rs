use crate::prelude::*;

pub mod prelude {
    pub use super::{DebugState, TraceEntry, TraceRing, DEBUG_LINES, IDLE_DOMAIN, PRINT_CHUNK};
}

/// Placeholder domain id under which idle decisions are recorded.
pub const IDLE_DOMAIN: DomainId = DomainId(0x7FFF);

/// Capacity of each per-PCPU debug ring.
pub const DEBUG_LINES: usize = 50_000;

/// Entries printed per pump while draining a ring.
pub const PRINT_CHUNK: usize = 250;

/// One dispatch decision, as recorded for offline inspection.
#[derive(Clone, Copy)]
#[derive(Debug)]
pub struct TraceEntry {
    pub domain: DomainId,
    pub vcpu: VcpuId,
    /// Dispatcher's own latency at that decision.
    pub now_delta: Time,
    /// Quantum handed out.
    pub quantum: Time,
    /// Remaining local budget of the chosen VCPU.
    pub local_cputime: Time,
    /// Wall time consumed since the previous dispatch.
    pub allocated: Time,
}

/// Bounded per-PCPU ring of dispatch decisions. Recording stops when the
/// ring is full; draining resets it.
#[derive(Debug)]
pub struct TraceRing {
    entries: Vec<TraceEntry>,
    print_index: usize,
}

/// Collect/print state machine, driven from the control surface (the
/// debugging putinfo toggle) and pumped by dispatches on PCPU 0.
#[derive(Clone, Copy)]
#[derive(Debug)]
#[derive(PartialEq, Eq)]
pub enum DebugState {
    Idle,
    Collecting,
    /// A ring filled up; collection stopped until the next drain.
    Saturated,
    /// Draining ring contents, one PCPU at a time.
    Printing { cpu: PcpuId },
}

impl TraceRing {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            print_index: 0,
        }
    }

    /// Record an entry. Returns false when the ring is full.
    pub fn record(&mut self, entry: TraceEntry) -> bool {
        if self.entries.len() >= DEBUG_LINES {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn last(&self) -> Option<&TraceEntry> {
        self.entries.last()
    }

    /// Next chunk of at most [`PRINT_CHUNK`] entries; the ring resets
    /// once fully drained.
    pub fn drain_chunk(&mut self) -> Vec<TraceEntry> {
        let start = self.print_index;
        let end = usize::min(start + PRINT_CHUNK, self.entries.len());
        let chunk = self.entries[start..end].to_vec();

        self.print_index = end;
        if self.print_index >= self.entries.len() {
            self.entries.clear();
            self.print_index = 0;
        }

        chunk
    }

    pub fn is_drained(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl DebugState {
    /// Control-surface toggle: Idle starts collecting; Collecting (or a
    /// saturated ring) moves on to printing.
    pub fn toggle(&mut self, first_cpu: PcpuId) {
        *self = match *self {
            DebugState::Idle => DebugState::Collecting,
            DebugState::Collecting | DebugState::Saturated =>
                DebugState::Printing { cpu: first_cpu },
            printing => printing,
        };
    }
}

// =============================================================================

#[test]
fn ring_is_bounded() {
    let mut ring = TraceRing::new();
    let entry = TraceEntry {
        domain: DomainId(1),
        vcpu: VcpuId(0),
        now_delta: Time::zero(),
        quantum: Time::micros(200),
        local_cputime: Time::zero(),
        allocated: Time::zero(),
    };

    for _ in 0..DEBUG_LINES {
        assert!(ring.record(entry));
    }
    assert!(!ring.record(entry));
    assert_eq!(ring.len(), DEBUG_LINES);
}

#[test]
fn drain_chunks_are_bounded_and_reset() {
    let mut ring = TraceRing::new();
    let entry = TraceEntry {
        domain: DomainId(1),
        vcpu: VcpuId(0),
        now_delta: Time::zero(),
        quantum: Time::micros(200),
        local_cputime: Time::zero(),
        allocated: Time::zero(),
    };

    for _ in 0..(PRINT_CHUNK + 10) {
        ring.record(entry);
    }

    assert_eq!(ring.drain_chunk().len(), PRINT_CHUNK);
    assert!(!ring.is_drained());
    assert_eq!(ring.drain_chunk().len(), 10);
    assert!(ring.is_drained());
    assert_eq!(ring.drain_chunk().len(), 0);
}

#[test]
fn debug_state_cycle() {
    let mut st = DebugState::Idle;
    st.toggle(1);
    assert_eq!(st, DebugState::Collecting);
    st.toggle(1);
    assert_eq!(st, DebugState::Printing { cpu: 1 });
}
