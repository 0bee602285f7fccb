pub mod prelude {
    pub use super::VcpuFlags;
}

bitflags::bitflags! {
    /// Per-VCPU status bits. Transitions are documented on the scheduler
    /// operations that flip them.
    #[derive(Clone, Copy)]
    #[derive(Debug)]
    #[derive(PartialEq, Eq)]
    pub struct VcpuFlags: u16 {
        /// Reservation not yet activated in the current global interval.
        const INACTIVE        = 1 << 0;
        /// Chosen by a dispatcher and currently on a PCPU.
        const RUNNING         = 1 << 1;
        /// Split VCPU that still owes a hop to its other PCPU this interval.
        const MIGRATING       = 1 << 2;
        /// Arrived on this PCPU's migrated-in queue, not yet harvested.
        const MIGRATED        = 1 << 3;
        /// Blocked by the guest.
        const ASLEEP          = 1 << 4;
        /// Reservation divided across two adjacent PCPUs.
        const SPLIT           = 1 << 5;
        /// Cputime accumulator must be cleared at the next rebase.
        const RESET           = 1 << 6;
        /// VCPU is being torn down; queues must not re-link it.
        const SHUTDOWN        = 1 << 7;
        /// Parameters still at their defaults; first putinfo applies
        /// immediately instead of going through a reshuffle.
        const DEFAULT         = 1 << 8;
        /// Carries a pending parameter change into the next reshuffle.
        const SHIFT           = 1 << 9;
        /// Jobs arrive irregularly; reservation activates on arrival.
        const SPORADIC        = 1 << 10;
        /// Deadline was overridden out of band; skip the periodic advance.
        const UPDATE_DEADLINE = 1 << 11;
        /// Guest announced a job arrival that is not yet absorbed.
        const ARRIVED         = 1 << 12;
        /// Dynamic reservation already placed in this global interval.
        const WOKEN           = 1 << 13;
    }
}

// =============================================================================

#[test]
fn flags_are_distinct() {
    let all = VcpuFlags::all();
    assert_eq!(all.bits().count_ones(), 14);
}

#[test]
fn split_implies_migration_cycle() {
    let mut f = VcpuFlags::SPLIT | VcpuFlags::MIGRATING;
    assert!(f.contains(VcpuFlags::SPLIT));
    f.remove(VcpuFlags::MIGRATING);
    f.insert(VcpuFlags::MIGRATED);
    assert_eq!(f, VcpuFlags::SPLIT | VcpuFlags::MIGRATED);
}
