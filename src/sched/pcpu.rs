use crate::prelude::*;

use std::collections::VecDeque;

use crate::trace::TraceRing;
use super::VcpuIdx;

/// Which of a PCPU's four queues a VCPU sits on.
#[derive(Clone, Copy)]
#[derive(Debug)]
#[derive(PartialEq, Eq)]
pub enum QueueKind {
    Ready,
    Wait,
    Inactive,
    Migrated,
}

/// Per-PCPU scheduler state. A PCPU only mutates its own block during
/// normal dispatch; the migrated-in queue is the one cross-PCPU write
/// target, and it is covered by the scheduler-wide lock.
#[derive(Debug)]
pub struct PcpuState {
    pub ready: VecDeque<VcpuIdx>,
    pub wait: VecDeque<VcpuIdx>,
    pub inactive: VecDeque<VcpuIdx>,
    pub migrated: VecDeque<VcpuIdx>,

    /// Placement utilization, as a rational with an lcm-of-periods
    /// denominator. `hyper_slice == hyper_period` means fully booked.
    pub hyper_slice: u64,
    pub hyper_period: u64,

    /// Activated utilization inside the current global interval,
    /// denominator [`NORM_PERIOD`].
    pub used_slice: u64,
    pub used_period: u64,

    /// Global deadline last observed by this PCPU.
    pub observed_deadline: Time,
    /// When the quantum handed out by the last dispatch expires.
    pub current_slice_expires: Time,

    /// VCPU chosen by the last dispatch; `None` while idling.
    pub current: Option<VcpuIdx>,
    /// Instant of the last dispatch on this PCPU.
    pub sched_start: Time,
    /// Wall time consumed on this PCPU since the last rebase.
    pub allocated_time: Time,

    pub trace: TraceRing,
}

impl PcpuState {
    pub fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            wait: VecDeque::new(),
            inactive: VecDeque::new(),
            migrated: VecDeque::new(),
            hyper_slice: 0,
            hyper_period: NORM_PERIOD,
            used_slice: 0,
            used_period: NORM_PERIOD,
            observed_deadline: Time::zero(),
            current_slice_expires: Time::zero(),
            current: None,
            sched_start: Time::zero(),
            allocated_time: Time::zero(),
            trace: TraceRing::new(),
        }
    }

    pub fn queue(&self, kind: QueueKind) -> &VecDeque<VcpuIdx> {
        match kind {
            QueueKind::Ready => &self.ready,
            QueueKind::Wait => &self.wait,
            QueueKind::Inactive => &self.inactive,
            QueueKind::Migrated => &self.migrated,
        }
    }

    pub fn queue_mut(&mut self, kind: QueueKind) -> &mut VecDeque<VcpuIdx> {
        match kind {
            QueueKind::Ready => &mut self.ready,
            QueueKind::Wait => &mut self.wait,
            QueueKind::Inactive => &mut self.inactive,
            QueueKind::Migrated => &mut self.migrated,
        }
    }

    /// Remove the VCPU from whichever queue holds it. Returns whether it
    /// was found.
    pub fn unlink(&mut self, idx: VcpuIdx) -> bool {
        for kind in [QueueKind::Ready, QueueKind::Wait, QueueKind::Inactive, QueueKind::Migrated] {
            let q = self.queue_mut(kind);
            if let Some(pos) = q.iter().position(|&v| v == idx) {
                q.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn holds(&self, idx: VcpuIdx) -> Option<QueueKind> {
        for kind in [QueueKind::Ready, QueueKind::Wait, QueueKind::Inactive, QueueKind::Migrated] {
            if self.queue(kind).contains(&idx) {
                return Some(kind);
            }
        }
        None
    }

    /// Mark this PCPU completely booked for placement purposes.
    pub fn book_full(&mut self) {
        self.hyper_slice = NORM_PERIOD;
        self.hyper_period = NORM_PERIOD;
    }

    pub fn is_fully_booked(&self) -> bool {
        self.hyper_slice == self.hyper_period
    }

    /// Placement utilization as a fraction of the PCPU.
    pub fn utilization(&self) -> Utilization {
        self.hyper_slice as Utilization / self.hyper_period as Utilization
    }
}

// =============================================================================

#[test]
fn unlink_finds_any_queue() {
    let mut p = PcpuState::new();
    p.ready.push_back(VcpuIdx(0));
    p.wait.push_back(VcpuIdx(1));
    p.migrated.push_back(VcpuIdx(2));

    assert_eq!(p.holds(VcpuIdx(1)), Some(QueueKind::Wait));
    assert!(p.unlink(VcpuIdx(1)));
    assert_eq!(p.holds(VcpuIdx(1)), None);
    assert!(!p.unlink(VcpuIdx(1)));
    assert!(p.unlink(VcpuIdx(2)));
    assert_eq!(p.holds(VcpuIdx(0)), Some(QueueKind::Ready));
}

#[test]
fn fresh_pcpu_is_empty_and_unbooked() {
    let p = PcpuState::new();
    assert_eq!(p.hyper_slice, 0);
    assert_eq!(p.hyper_period, NORM_PERIOD);
    assert!(!p.is_fully_booked());
    assert_eq!(p.utilization(), 0.0);
}
