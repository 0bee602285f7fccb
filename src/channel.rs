use crate::prelude::*;

use crate::sched::VcpuIdx;

pub mod prelude {
    pub use super::{ChannelSlot, GuestChannel};
}

/// Fixed-layout shared-memory block between one guest VCPU and the
/// scheduler. The guest announces sporadic arrivals and requested
/// deadlines here; the scheduler echoes back the deadline it granted.
#[derive(Clone)]
#[derive(Debug, Default)]
pub struct ChannelSlot {
    /// Arrival notification: 0 = none, 1 = arrival announced by the
    /// guest's real-time application.
    pub arrival: u64,
    /// Debug iteration counter, writable from both sides. The value 3 is
    /// a request to report current cputime back through this field.
    pub debug_iter: i64,
    /// Guest-provided next absolute deadline, consumed at the next
    /// deadline boundary. Zero when absent.
    pub next_deadline: Time,
    /// Last deadline the scheduler granted, echoed back to the guest.
    pub granted_deadline: Time,
    /// Nonzero while a real-time application is active in the guest.
    pub rta_active: u64,
    /// Scratch telemetry.
    pub scratch: i64,
}

/// One slot per VCPU in the scheduler's arena.
#[derive(Debug, Default)]
pub struct GuestChannel {
    slots: Vec<ChannelSlot>,
}

impl GuestChannel {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn grow_to(&mut self, len: usize) {
        while self.slots.len() < len {
            self.slots.push(ChannelSlot::default());
        }
    }

    pub fn slot(&self, idx: VcpuIdx) -> &ChannelSlot {
        &self.slots[idx.0]
    }

    pub fn slot_mut(&mut self, idx: VcpuIdx) -> &mut ChannelSlot {
        &mut self.slots[idx.0]
    }
}

// =============================================================================

#[test]
fn slots_grow_with_arena() {
    let mut ch = GuestChannel::new();
    ch.grow_to(3);
    ch.slot_mut(VcpuIdx(2)).arrival = 1;
    ch.grow_to(2);
    assert_eq!(ch.slot(VcpuIdx(2)).arrival, 1);
    assert_eq!(ch.slot(VcpuIdx(0)).arrival, 0);
}
