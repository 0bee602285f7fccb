use crate::prelude::*;

use crate::channel::GuestChannel;
use crate::trace::{DebugState, TraceEntry};

use super::{Error, Placement, TaskSlice, VcpuIdx};
use super::deadline_queue::DeadlineQueue;
use super::pcpu::{PcpuState, QueueKind};
use super::reservation::Reservation;

/// Parameters accepted by the control surface for one domain.
#[derive(Clone, Copy)]
#[derive(Debug)]
pub struct SchedParams {
    pub period: Time,
    pub slice: Time,
    /// Index of the VCPU within the domain the change applies to.
    pub vcpu_index: u32,
}

/// Snapshot returned by the control surface for one domain.
#[derive(Clone, Copy)]
#[derive(Debug)]
#[derive(PartialEq, Eq)]
pub struct DomainInfo {
    pub period: Time,
    pub slice: Time,
    pub latency: i32,
    pub weight: i32,
    pub extratime: i32,
}

/// All mutable scheduler state. Owned by [`Scheduler`] behind the
/// scheduler-wide lock; VCPU and PCPU records live in arenas and every
/// queue stores arena indices (the natural VCPU ↔ PCPU ↔ scheduler
/// reference cycles never materialize as pointers).
pub struct SchedCore {
    pub(crate) vcpus: Vec<Reservation>,
    pub(crate) pcpus: Vec<PcpuState>,
    pub(crate) nr_cpus: usize,
    /// PCPUs below this index belong to dom0 and are never repacked.
    pub(crate) dom0_cpu_count: usize,
    /// Highest PCPU the packer has placed a reservation on.
    pub(crate) last_assigned: PcpuId,
    /// All non-dom0 VCPUs in insertion order; the barrier re-applies
    /// reservations in exactly this order.
    pub(crate) sc_list: Vec<VcpuIdx>,
    pub(crate) deadline_queue: DeadlineQueue,
    /// Published global window: interval start and global deadline.
    pub(crate) global_slice_start: Time,
    pub(crate) global_deadline: Time,
    /// Reservations must be replanned at the next barrier.
    pub(crate) reshuffle: bool,
    /// Coarse barrier: PCPU 0 is rewriting global structures; peers
    /// leave the shared queues alone until it clears.
    pub(crate) cpu0_busy: bool,
    /// Pending reschedule signal per PCPU.
    pub(crate) signals: Vec<bool>,
    pub(crate) channel: GuestChannel,
    pub(crate) debug_state: DebugState,
}

/// The DP-Wrap scheduler. One dispatcher per PCPU calls in concurrently;
/// the scheduler-wide spinlock serializes every entry point, and no
/// operation blocks while holding it.
pub struct Scheduler {
    core: spin::Mutex<SchedCore>,
}

impl SchedCore {
    pub(crate) fn new(nr_cpus: usize) -> Self {
        Self {
            vcpus: Vec::new(),
            pcpus: (0..nr_cpus).map(|_| PcpuState::new()).collect(),
            nr_cpus,
            dom0_cpu_count: 0,
            last_assigned: 0,
            sc_list: Vec::new(),
            deadline_queue: DeadlineQueue::new(),
            global_slice_start: Time::zero(),
            global_deadline: Time::zero(),
            reshuffle: false,
            cpu0_busy: false,
            signals: vec![false; nr_cpus],
            channel: GuestChannel::new(),
            debug_state: DebugState::Idle,
        }
    }

    pub(crate) fn lookup(&self, domain: DomainId, vcpu: VcpuId) -> Option<VcpuIdx> {
        self.vcpus.iter()
            .position(|r| r.domain == domain && r.vcpu == vcpu
                && !r.flags.contains(VcpuFlags::SHUTDOWN))
            .map(VcpuIdx)
    }

    pub(crate) fn raise_signal(&mut self, cpu: PcpuId) {
        if cpu < self.nr_cpus {
            self.signals[cpu] = true;
        }
    }

    pub(crate) fn on_any_queue(&self, idx: VcpuIdx) -> bool {
        self.pcpus.iter().any(|p| p.holds(idx).is_some())
    }

    /// Move a VCPU onto the given queue of the given PCPU, unlinking it
    /// from wherever it currently sits.
    pub(crate) fn enqueue(&mut self, idx: VcpuIdx, cpu: PcpuId, kind: QueueKind, at_front: bool) {
        if self.vcpus[idx.0].flags.contains(VcpuFlags::SHUTDOWN) {
            return;
        }
        for p in &mut self.pcpus {
            p.unlink(idx);
        }
        let q = self.pcpus[cpu].queue_mut(kind);
        if at_front {
            q.push_front(idx);
        } else {
            q.push_back(idx);
        }
    }

    pub(crate) fn sc_list_add(&mut self, idx: VcpuIdx) {
        if self.vcpus[idx.0].domain.is_dom0() {
            return;
        }
        if !self.sc_list.contains(&idx) {
            self.sc_list.push(idx);
        }
    }

    fn insert_vcpu(&mut self, domain: DomainId, vcpu: VcpuId) -> Result<(), Error> {
        if self.lookup(domain, vcpu).is_some() {
            return Err(Error::InvalidParameter(anyhow::format_err!(
                "VCPU {domain}.{vcpu} already inserted"
            )));
        }
        if self.vcpus.len() >= MAX_VCPUS {
            return Err(Error::TooManyVcpus);
        }

        let idx = VcpuIdx(self.vcpus.len());
        self.vcpus.push(Reservation::new(domain, vcpu));
        self.channel.grow_to(self.vcpus.len());

        if domain.is_dom0() {
            self.dom0_cpu_count += 1;
        }

        match self.assign_pcpu(idx) {
            Ok(()) => Ok(()),
            Err(err) => {
                // Admission failed; tear the record down again.
                self.vcpus[idx.0].flags.insert(VcpuFlags::SHUTDOWN);
                if domain.is_dom0() {
                    self.dom0_cpu_count -= 1;
                }
                Err(err)
            },
        }
    }

    fn remove_vcpu(&mut self, idx: VcpuIdx) {
        self.vcpus[idx.0].flags.insert(VcpuFlags::SHUTDOWN);
        self.deadline_queue.remove(idx);
        for p in &mut self.pcpus {
            p.unlink(idx);
            if p.current == Some(idx) {
                p.current = None;
            }
        }
        self.sc_list.retain(|&v| v != idx);
        // Freed bandwidth: replan at the next barrier.
        self.reshuffle = true;
    }

    /// Unblock a VCPU. The first wake of its life seeds the EDF state;
    /// later wakes of sporadic VCPUs activate the dynamic reservation.
    ///
    /// A split VCPU that slept while MIGRATING is recomputed against the
    /// PCPU it is currently bound to, whichever side that is.
    pub(crate) fn wake(&mut self, idx: VcpuIdx, now: Time) {
        if self.cpu0_busy {
            log::debug!("wake of {} while PCPU 0 rebases global state",
                self.vcpu_name(idx));
        }

        if self.vcpus[idx.0].is_runnable() {
            return;
        }
        self.vcpus[idx.0].flags.remove(VcpuFlags::ASLEEP);

        let slice_length = self.global_deadline - now;

        if self.vcpus[idx.0].deadline_abs.is_zero() {
            let period = self.vcpus[idx.0].period;
            self.vcpus[idx.0].deadline_abs = now + period;

            // The very first VCPU to wake seeds the global window.
            if self.global_deadline.is_zero() {
                self.global_deadline = now;
            }

            let deadline = self.vcpus[idx.0].deadline_abs;
            self.deadline_queue.insert(deadline, idx);

            if !self.on_any_queue(idx) {
                let cpu = self.vcpus[idx.0].cpu;
                self.enqueue(idx, cpu, QueueKind::Inactive, false);
            }
            self.sc_list_add(idx);
        } else if self.vcpus[idx.0].is_sporadic() {
            if self.vcpus[idx.0].flags.contains(VcpuFlags::UPDATE_DEADLINE) {
                // Woke, was recomputed, slept and woke again inside one
                // interval: refresh the local slices only.
                self.recompute_wake_slices(idx, slice_length);
            } else if !self.vcpus[idx.0].flags.contains(VcpuFlags::WOKEN) {
                self.dynamic_reservation(idx);
                self.vcpus[idx.0].flags.insert(VcpuFlags::WOKEN);
                self.recompute_wake_slices(idx, slice_length);
            }

            self.vcpus[idx.0].flags.remove(VcpuFlags::RUNNING);
            let cpu = self.vcpus[idx.0].cpu;
            if self.vcpus[idx.0].flags.contains(VcpuFlags::MIGRATING) {
                self.enqueue(idx, cpu, QueueKind::Migrated, true);
            } else {
                self.enqueue(idx, cpu, QueueKind::Ready, true);
            }
        }

        let cpu = self.vcpus[idx.0].cpu;
        let should_signal = match self.pcpus[cpu].current {
            None => true,
            Some(cur) => {
                self.vcpus[idx.0].flags.contains(VcpuFlags::INACTIVE)
                    || self.vcpus[idx.0].flags.contains(VcpuFlags::MIGRATING)
                    || (self.vcpus[cur.0].local_cputime.is_negative()
                        && !self.vcpus[idx.0].local_cputime.is_negative())
            },
        };
        if should_signal {
            self.raise_signal(cpu);
        }
    }

    /// Local slices of a freshly-woken sporadic VCPU, computed from the
    /// remainder of the current global interval.
    fn recompute_wake_slices(&mut self, idx: VcpuIdx, slice_length: Time) {
        let global_deadline = self.global_deadline;
        let r = &mut self.vcpus[idx.0];

        if r.is_split() {
            let curr = (r.slice_b as i64 * slice_length.as_nanos()) / r.period_b as i64;
            r.local_slice_second = Time::nanos(curr);
            r.local_cputime = r.local_slice_second;

            if !r.flags.contains(VcpuFlags::MIGRATED) {
                r.flags.insert(VcpuFlags::MIGRATING);
            }

            let curr = (r.slice_a as i64 * slice_length.as_nanos()) / r.period_a as i64;
            r.local_deadline = global_deadline;
            r.local_slice = Time::nanos(curr);
        } else {
            let curr = (r.norm_slice as i64 * slice_length.as_nanos()) / r.norm_period as i64;
            r.local_slice = Time::nanos(curr);
            r.local_cputime = r.local_slice;
        }
    }

    /// Block a VCPU. Sporadic VCPUs leave the ready set immediately; the
    /// PCPU is signalled when its running VCPU is the one going to sleep.
    pub(crate) fn sleep(&mut self, idx: VcpuIdx) {
        self.vcpus[idx.0].flags.insert(VcpuFlags::ASLEEP);

        let cpu = self.vcpus[idx.0].cpu;
        if self.vcpus[idx.0].is_sporadic() {
            self.enqueue(idx, cpu, QueueKind::Wait, false);
        }
        self.sc_list_add(idx);

        if self.pcpus[cpu].current == Some(idx) {
            self.raise_signal(cpu);
        }
    }

    fn adjust_put(&mut self, domain: DomainId, params: &SchedParams, now: Time) -> Result<(), Error> {
        // Debugging toggle: steps the trace collect/print state machine
        // instead of touching any reservation.
        if params.period == PERIOD_MAX * 2 {
            self.debug_state.toggle(0);
            match self.debug_state {
                DebugState::Collecting => log::info!("trace collection started"),
                DebugState::Printing { .. } => log::info!("draining trace rings"),
                _ => {},
            }
            return Ok(());
        }

        // A pending cputime query takes precedence over the update.
        for idx in self.domain_vcpus(domain) {
            if self.channel.slot(idx).debug_iter == 3 {
                let r = &self.vcpus[idx.0];
                let cputime =
                    if r.flags.contains(VcpuFlags::RUNNING) {
                        r.cputime + (now - r.sched_start)
                    } else {
                        r.cputime
                    };
                self.channel.slot_mut(idx).debug_iter = cputime.as_nanos();
                return Ok(());
            }
        }

        if params.period < PERIOD_MIN || params.period > PERIOD_MAX {
            return Err(Error::period_out_of_range(params.period));
        }
        if params.slice < SLICE_MIN || params.slice > params.period {
            return Err(Error::slice_out_of_range(params.slice, params.period));
        }

        let idx = self.lookup(domain, VcpuId(params.vcpu_index))
            .ok_or(Error::UnknownVcpu(domain, VcpuId(params.vcpu_index)))?;

        let r = &mut self.vcpus[idx.0];
        r.weight = 0;
        r.pending_period = params.period.as_micros() as u64;
        r.pending_slice = params.slice.as_micros() as u64;

        if r.flags.contains(VcpuFlags::DEFAULT) {
            // One-time change away from the defaults applies in place;
            // the insert-time placement still reflects the defaults, so a
            // replan is due either way.
            r.renormalize();
            r.flags.remove(VcpuFlags::DEFAULT);
        } else if !self.reshuffle {
            log::info!("parameter change for {domain}.{}: reshuffle scheduled",
                params.vcpu_index);
        }
        self.reshuffle = true;

        Ok(())
    }

    fn adjust_get(&self, domain: DomainId) -> Result<DomainInfo, Error> {
        let idx = self.lookup(domain, VcpuId(0))
            .ok_or(Error::UnknownVcpu(domain, VcpuId(0)))?;

        let r = &self.vcpus[idx.0];
        Ok(DomainInfo {
            period: r.period,
            slice: r.slice,
            latency: r.latency,
            weight: r.weight,
            extratime: r.extratime,
        })
    }

    pub(crate) fn domain_vcpus(&self, domain: DomainId) -> Vec<VcpuIdx> {
        self.vcpus.iter().enumerate()
            .filter(|(_, r)| r.domain == domain && !r.flags.contains(VcpuFlags::SHUTDOWN))
            .map(|(i, _)| VcpuIdx(i))
            .collect()
    }

    pub(crate) fn vcpu_name(&self, idx: VcpuIdx) -> String {
        let r = &self.vcpus[idx.0];
        format!("{}.{}", r.domain, r.vcpu)
    }

    pub(crate) fn trace_record(&mut self, cpu: PcpuId, entry: TraceEntry) {
        if self.debug_state != DebugState::Collecting {
            return;
        }
        if !self.pcpus[cpu].trace.record(entry) {
            self.debug_state = DebugState::Saturated;
        }
    }
}

impl Scheduler {
    pub fn new(nr_cpus: usize) -> Self {
        assert!(nr_cpus >= 1);
        Self { core: spin::Mutex::new(SchedCore::new(nr_cpus)) }
    }

    /// Admit a VCPU. Its reservation starts at the defaults (dom0: the
    /// full PCPU; guests: 150 ms per second, sporadic) and is placed by
    /// the bandwidth packer immediately.
    pub fn insert_vcpu(&self, domain: DomainId, vcpu: VcpuId) -> Result<(), Error> {
        self.core.lock().insert_vcpu(domain, vcpu)
    }

    pub fn remove_vcpu(&self, domain: DomainId, vcpu: VcpuId) -> Result<(), Error> {
        let mut core = self.core.lock();
        let idx = core.lookup(domain, vcpu).ok_or(Error::UnknownVcpu(domain, vcpu))?;
        core.remove_vcpu(idx);
        Ok(())
    }

    pub fn wake(&self, domain: DomainId, vcpu: VcpuId, now: Time) -> Result<(), Error> {
        let mut core = self.core.lock();
        let idx = core.lookup(domain, vcpu).ok_or(Error::UnknownVcpu(domain, vcpu))?;
        core.wake(idx, now);
        Ok(())
    }

    pub fn sleep(&self, domain: DomainId, vcpu: VcpuId) -> Result<(), Error> {
        let mut core = self.core.lock();
        let idx = core.lookup(domain, vcpu).ok_or(Error::UnknownVcpu(domain, vcpu))?;
        core.sleep(idx);
        Ok(())
    }

    /// Per-PCPU dispatch entry point; see the dispatcher module.
    pub fn do_schedule(&self, cpu: PcpuId, now: Time, tasklet_work: bool) -> TaskSlice {
        self.core.lock().do_schedule(cpu, now, tasklet_work)
    }

    /// Control surface: set (period, slice) for one VCPU of a domain.
    pub fn adjust_put(&self, domain: DomainId, params: SchedParams, now: Time) -> Result<(), Error> {
        self.core.lock().adjust_put(domain, &params, now)
    }

    /// Control surface: current parameters of the domain's VCPU 0.
    pub fn adjust_get(&self, domain: DomainId) -> Result<DomainInfo, Error> {
        self.core.lock().adjust_get(domain)
    }

    /// Control surface: switch a VCPU between sporadic (reservation
    /// activates on arrival) and periodic (always active) service.
    pub fn set_sporadic(&self, domain: DomainId, vcpu: VcpuId, sporadic: bool) -> Result<(), Error> {
        let mut core = self.core.lock();
        let idx = core.lookup(domain, vcpu).ok_or(Error::UnknownVcpu(domain, vcpu))?;
        if sporadic {
            core.vcpus[idx.0].flags.insert(VcpuFlags::SPORADIC);
        } else {
            core.vcpus[idx.0].flags.remove(VcpuFlags::SPORADIC);
        }
        Ok(())
    }

    /// Guest side of the shared channel: announce a sporadic job arrival.
    pub fn announce_arrival(&self, domain: DomainId, vcpu: VcpuId) -> Result<(), Error> {
        self.with_slot(domain, vcpu, |slot| slot.arrival = 1)
    }

    /// Guest side: request the next absolute deadline; consumed at the
    /// next deadline boundary.
    pub fn request_deadline(&self, domain: DomainId, vcpu: VcpuId, deadline: Time) -> Result<(), Error> {
        self.with_slot(domain, vcpu, |slot| slot.next_deadline = deadline)
    }

    /// Guest side: flag whether a real-time application is active.
    pub fn set_rta_active(&self, domain: DomainId, vcpu: VcpuId, active: bool) -> Result<(), Error> {
        self.with_slot(domain, vcpu, |slot| slot.rta_active = active as u64)
    }

    /// Guest side: the deadline the scheduler last granted.
    pub fn granted_deadline(&self, domain: DomainId, vcpu: VcpuId) -> Result<Time, Error> {
        let core = self.core.lock();
        let idx = core.lookup(domain, vcpu).ok_or(Error::UnknownVcpu(domain, vcpu))?;
        Ok(core.channel.slot(idx).granted_deadline)
    }

    /// Guest side: ask for a cputime report; the next putinfo call on the
    /// domain answers it in place.
    pub fn request_cputime_report(&self, domain: DomainId, vcpu: VcpuId) -> Result<(), Error> {
        self.with_slot(domain, vcpu, |slot| slot.debug_iter = 3)
    }

    pub fn read_cputime_report(&self, domain: DomainId, vcpu: VcpuId) -> Result<Time, Error> {
        let core = self.core.lock();
        let idx = core.lookup(domain, vcpu).ok_or(Error::UnknownVcpu(domain, vcpu))?;
        Ok(Time::nanos(core.channel.slot(idx).debug_iter))
    }

    fn with_slot(
        &self,
        domain: DomainId,
        vcpu: VcpuId,
        f: impl FnOnce(&mut crate::channel::ChannelSlot),
    ) -> Result<(), Error> {
        let mut core = self.core.lock();
        let idx = core.lookup(domain, vcpu).ok_or(Error::UnknownVcpu(domain, vcpu))?;
        f(core.channel.slot_mut(idx));
        Ok(())
    }

    /// Consume the pending reschedule signal of one PCPU.
    pub fn take_signal(&self, cpu: PcpuId) -> bool {
        let mut core = self.core.lock();
        let pending = core.signals[cpu];
        core.signals[cpu] = false;
        pending
    }

    /// Consume and return all pending reschedule signals.
    pub fn take_signals(&self) -> Vec<PcpuId> {
        let mut core = self.core.lock();
        let pending = core.signals.iter()
            .enumerate()
            .filter(|&(_, &s)| s)
            .map(|(cpu, _)| cpu)
            .collect();
        core.signals.iter_mut().for_each(|s| *s = false);
        pending
    }

    pub fn placement(&self, domain: DomainId, vcpu: VcpuId) -> Result<Placement, Error> {
        let core = self.core.lock();
        let idx = core.lookup(domain, vcpu).ok_or(Error::UnknownVcpu(domain, vcpu))?;
        Ok(core.vcpus[idx.0].placement())
    }

    /// Published (S, G) snapshot.
    pub fn global_window(&self) -> (Time, Time) {
        let core = self.core.lock();
        (core.global_slice_start, core.global_deadline)
    }

    pub fn pcpu_utilization(&self, cpu: PcpuId) -> Utilization {
        self.core.lock().pcpus[cpu].utilization()
    }

    /// Highest placement utilization across the fleet.
    pub fn max_pcpu_utilization(&self) -> Utilization {
        let core = self.core.lock();
        let max = core.pcpus.iter()
            .map(|p| ordered_float::OrderedFloat(p.utilization()))
            .max();

        match max {
            Some(max) => *max,
            None => 0f64,
        }
    }

    /// Placement utilization per PCPU in rounded percent, for reporting.
    pub fn utilization_report(&self) -> Vec<(PcpuId, u64)> {
        let core = self.core.lock();
        core.pcpus.iter()
            .enumerate()
            .map(|(cpu, p)| (cpu, rounded_div::u64(p.hyper_slice * 100, p.hyper_period)))
            .collect()
    }

    pub fn identity_of(&self, idx: VcpuIdx) -> Option<(DomainId, VcpuId)> {
        let core = self.core.lock();
        core.vcpus.get(idx.0).map(|r| (r.domain, r.vcpu))
    }

    pub fn debug_state(&self) -> DebugState {
        self.core.lock().debug_state
    }

    pub fn drain_trace_chunk(&self, cpu: PcpuId) -> Vec<TraceEntry> {
        self.core.lock().pcpus[cpu].trace.drain_chunk()
    }

    #[cfg(test)]
    pub(crate) fn with_core<T>(&self, f: impl FnOnce(&mut SchedCore) -> T) -> T {
        f(&mut self.core.lock())
    }
}

// =============================================================================

#[test]
fn insert_rejects_duplicates_and_unknown_lookups() {
    let sched = Scheduler::new(4);
    sched.insert_vcpu(DomainId(1), VcpuId(0)).unwrap();
    assert!(sched.insert_vcpu(DomainId(1), VcpuId(0)).is_err());
    assert!(sched.adjust_get(DomainId(7)).is_err());
}

#[test]
fn putinfo_validates_ranges() {
    let sched = Scheduler::new(4);
    sched.insert_vcpu(DomainId(1), VcpuId(0)).unwrap();

    let too_short = SchedParams {
        period: Time::micros(10),
        slice: Time::micros(5),
        vcpu_index: 0,
    };
    assert!(sched.adjust_put(DomainId(1), too_short, Time::zero()).is_err());

    let slice_above_period = SchedParams {
        period: Time::millis(10),
        slice: Time::millis(20),
        vcpu_index: 0,
    };
    assert!(sched.adjust_put(DomainId(1), slice_above_period, Time::zero()).is_err());

    let ok = SchedParams {
        period: Time::millis(100),
        slice: Time::millis(20),
        vcpu_index: 0,
    };
    sched.adjust_put(DomainId(1), ok, Time::zero()).unwrap();

    let info = sched.adjust_get(DomainId(1)).unwrap();
    assert_eq!(info.period, Time::millis(100));
    assert_eq!(info.slice, Time::millis(20));
}

#[test]
fn first_putinfo_applies_immediately_later_ones_reshuffle() {
    let sched = Scheduler::new(4);
    sched.insert_vcpu(DomainId(1), VcpuId(0)).unwrap();

    let params = SchedParams {
        period: Time::millis(100),
        slice: Time::millis(20),
        vcpu_index: 0,
    };
    sched.adjust_put(DomainId(1), params, Time::zero()).unwrap();
    sched.with_core(|core| {
        let idx = core.lookup(DomainId(1), VcpuId(0)).unwrap();
        assert_eq!(core.vcpus[idx.0].norm_slice, 20_000);
        assert!(!core.vcpus[idx.0].flags.contains(VcpuFlags::DEFAULT));
    });

    let params = SchedParams {
        period: Time::millis(100),
        slice: Time::millis(40),
        vcpu_index: 0,
    };
    sched.adjust_put(DomainId(1), params, Time::zero()).unwrap();
    sched.with_core(|core| {
        assert!(core.reshuffle);
        let idx = core.lookup(DomainId(1), VcpuId(0)).unwrap();
        // Applied at the next reshuffle, not in place.
        assert_eq!(core.vcpus[idx.0].norm_slice, 20_000);
        assert_eq!(core.vcpus[idx.0].pending_slice, 40_000);
    });
}

#[test]
fn debug_toggle_does_not_touch_parameters() {
    let sched = Scheduler::new(4);
    sched.insert_vcpu(DomainId(1), VcpuId(0)).unwrap();

    let toggle = SchedParams {
        period: PERIOD_MAX * 2,
        slice: Time::millis(1),
        vcpu_index: 0,
    };
    sched.adjust_put(DomainId(1), toggle, Time::zero()).unwrap();
    assert_eq!(sched.debug_state(), DebugState::Collecting);

    let info = sched.adjust_get(DomainId(1)).unwrap();
    assert_eq!(info.period, DEFAULT_PERIOD);
    assert_eq!(info.slice, DEFAULT_SLICE);
}

#[test]
fn cputime_query_round_trip() {
    let sched = Scheduler::new(4);
    sched.insert_vcpu(DomainId(1), VcpuId(0)).unwrap();
    sched.request_cputime_report(DomainId(1), VcpuId(0)).unwrap();

    // Serviced by the next putinfo, parameters untouched.
    let params = SchedParams {
        period: Time::millis(100),
        slice: Time::millis(20),
        vcpu_index: 0,
    };
    sched.adjust_put(DomainId(1), params, Time::zero()).unwrap();

    assert_eq!(sched.read_cputime_report(DomainId(1), VcpuId(0)).unwrap(), Time::zero());
    let info = sched.adjust_get(DomainId(1)).unwrap();
    assert_eq!(info.period, DEFAULT_PERIOD);
}
