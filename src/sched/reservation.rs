use crate::prelude::*;

/// Per-VCPU reservation record, exclusively owned by the scheduler. The
/// (domain, vcpu) pair is a weak back-reference to the hypervisor object.
///
/// Two parameter spaces coexist: the original (period, slice) in
/// nanoseconds, and the normalized form where the period is rescaled to
/// [`NORM_PERIOD`] and the slice becomes a utilization share. Split
/// reservations additionally carry per-side (slice, period) fragments in
/// hyper-period units.
#[derive(Clone)]
#[derive(Debug)]
pub struct Reservation {
    pub domain: DomainId,
    pub vcpu: VcpuId,
    pub flags: VcpuFlags,

    /// Original reservation, nanoseconds.
    pub period: Time,
    pub slice: Time,

    /// Normalized reservation: `norm_slice` parts out of `norm_period`.
    pub norm_period: u64,
    pub norm_slice: u64,

    /// Pending parameters in microseconds, applied at the next reshuffle.
    pub pending_period: u64,
    pub pending_slice: u64,

    /// Primary and (when split) secondary PCPU of the reservation, plus
    /// the PCPU the VCPU is currently bound to.
    pub cpu_a: PcpuId,
    pub cpu_b: PcpuId,
    pub cpu: PcpuId,

    /// Split fragments, in units of the shared hyper-period.
    pub period_a: u64,
    pub slice_a: u64,
    pub period_b: u64,
    pub slice_b: u64,

    /// EDF state.
    pub deadline_abs: Time,
    pub local_slice: Time,
    pub local_deadline: Time,
    pub local_slice_second: Time,
    pub local_deadline_second: Time,

    /// Accounting.
    pub cputime: Time,
    pub local_cputime: Time,
    pub sched_start: Time,

    /// Reported through getinfo; not interpreted by the scheduler.
    pub latency: i32,
    pub weight: i32,
    pub extratime: i32,
}

impl Reservation {
    pub fn new(domain: DomainId, vcpu: VcpuId) -> Self {
        let (period, slice) =
            if domain.is_dom0() {
                (DOM0_PERIOD, DOM0_SLICE)
            } else {
                (DEFAULT_PERIOD, DEFAULT_SLICE)
            };

        let mut flags = VcpuFlags::ASLEEP | VcpuFlags::INACTIVE;
        if !domain.is_dom0() {
            flags.insert(VcpuFlags::SPORADIC);
            if vcpu.0 == 0 {
                flags.insert(VcpuFlags::DEFAULT);
            }
        }

        let mut new = Self {
            domain,
            vcpu,
            flags,
            period,
            slice,
            norm_period: 0,
            norm_slice: 0,
            pending_period: (period.as_micros()) as u64,
            pending_slice: (slice.as_micros()) as u64,
            cpu_a: 0,
            cpu_b: 0,
            cpu: 0,
            period_a: 0,
            slice_a: 0,
            period_b: 0,
            slice_b: 0,
            deadline_abs: Time::zero(),
            local_slice: Time::zero(),
            local_deadline: Time::zero(),
            local_slice_second: Time::zero(),
            local_deadline_second: Time::zero(),
            cputime: Time::zero(),
            local_cputime: Time::zero(),
            sched_start: Time::zero(),
            latency: 0,
            weight: 0,
            extratime: 0,
        };
        new.renormalize();
        new
    }

    /// Rescale the pending (period, slice) onto the [`NORM_PERIOD`]
    /// denominator and refresh the nanosecond-space parameters.
    pub fn renormalize(&mut self) {
        self.norm_slice = (NORM_PERIOD * self.pending_slice) / self.pending_period;
        self.norm_period = NORM_PERIOD;
        self.period = Time::micros(self.pending_period as i64);
        self.slice = Time::micros(self.pending_slice as i64);
    }

    pub fn is_split(&self) -> bool {
        self.flags.contains(VcpuFlags::SPLIT)
    }

    pub fn is_sporadic(&self) -> bool {
        self.flags.contains(VcpuFlags::SPORADIC)
    }

    /// Runnable in the scheduler's eyes: not blocked by the guest.
    pub fn is_runnable(&self) -> bool {
        !self.flags.contains(VcpuFlags::ASLEEP)
    }

    /// Active: the reservation has been composed into the current global
    /// interval.
    pub fn is_active(&self) -> bool {
        !self.flags.contains(VcpuFlags::INACTIVE)
    }

    /// The local slice this VCPU holds on the given PCPU. A split
    /// reservation keeps one slice per side.
    pub fn local_slice_on(&self, cpu: PcpuId) -> Time {
        if self.is_split() && self.cpu_a != cpu {
            self.local_slice_second
        } else {
            self.local_slice
        }
    }

    pub fn local_deadline_on(&self, cpu: PcpuId) -> Time {
        if self.is_split() && self.cpu_a != cpu {
            self.local_deadline_second
        } else {
            self.local_deadline
        }
    }

    /// The other side of a split reservation relative to `cpu`.
    pub fn other_side(&self, cpu: PcpuId) -> PcpuId {
        if cpu == self.cpu_a { self.cpu_b } else { self.cpu_a }
    }

    pub fn utilization(&self) -> Utilization {
        self.norm_slice as Utilization / self.norm_period as Utilization
    }

    pub fn placement(&self) -> Placement {
        if self.is_split() {
            Placement {
                cpu_a: self.cpu_a,
                cpu_b: Some(self.cpu_b),
                slice_a: self.slice_a,
                slice_b: self.slice_b,
                period: self.period_a,
            }
        } else {
            Placement {
                cpu_a: self.cpu_a,
                cpu_b: None,
                slice_a: self.norm_slice,
                slice_b: 0,
                period: self.norm_period,
            }
        }
    }
}

// =============================================================================

#[test]
fn defaults_for_dom0_and_guests() {
    let dom0 = Reservation::new(DomainId(0), VcpuId(0));
    assert_eq!(dom0.period, DOM0_PERIOD);
    assert_eq!(dom0.slice, DOM0_SLICE);
    assert_eq!(dom0.norm_slice, NORM_PERIOD);
    assert!(!dom0.is_sporadic());

    let guest = Reservation::new(DomainId(3), VcpuId(0));
    assert_eq!(guest.period, DEFAULT_PERIOD);
    assert_eq!(guest.slice, DEFAULT_SLICE);
    assert_eq!(guest.norm_slice, 15_000);
    assert!(guest.is_sporadic());
    assert!(guest.flags.contains(VcpuFlags::DEFAULT));

    let second = Reservation::new(DomainId(3), VcpuId(1));
    assert!(!second.flags.contains(VcpuFlags::DEFAULT));
}

#[test]
fn renormalize_scales_to_denominator() {
    let mut r = Reservation::new(DomainId(1), VcpuId(0));
    r.pending_period = 100_000; // 100 ms in us
    r.pending_slice = 20_000;
    r.renormalize();
    assert_eq!(r.norm_period, NORM_PERIOD);
    assert_eq!(r.norm_slice, 20_000);
    assert_eq!(r.period, Time::millis(100));
    assert_eq!(r.slice, Time::millis(20));
}

#[test]
fn split_side_selection() {
    let mut r = Reservation::new(DomainId(1), VcpuId(0));
    r.flags.insert(VcpuFlags::SPLIT);
    r.cpu_a = 1;
    r.cpu_b = 2;
    r.local_slice = Time::millis(3);
    r.local_slice_second = Time::millis(7);

    assert_eq!(r.local_slice_on(1), Time::millis(3));
    assert_eq!(r.local_slice_on(2), Time::millis(7));
    assert_eq!(r.other_side(1), 2);
    assert_eq!(r.other_side(2), 1);
}
