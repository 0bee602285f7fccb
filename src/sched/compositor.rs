use crate::prelude::*;

use crate::trace::{DebugState, TraceEntry};

use super::VcpuIdx;
use super::core::SchedCore;
use super::pcpu::QueueKind;

impl SchedCore {
    /// Derive per-VCPU local slices and deadlines on `cpu` for the
    /// published global interval [S, G).
    ///
    /// The ready queue is rebuilt first: periodic VCPUs ahead of sporadic
    /// arrived ones, with sporadic not-yet-arrived behind them. Then the
    /// local deadlines are threaded cumulatively through the queue, each
    /// VCPU receiving `slice' · (G − S) / period'` of the interval. A
    /// split VCPU gets the fragment belonging to this PCPU as its
    /// cumulative share and the other fragment pinned against G for the
    /// mid-interval handoff.
    pub(crate) fn recompute_local_deadlines(&mut self, cpu: PcpuId, now: Time) {
        let slice_length = self.global_deadline - self.global_slice_start;
        let global_deadline = self.global_deadline;

        if self.debug_state == DebugState::Collecting {
            // Interval marker: one pseudo-entry carrying the interval
            // length and the wall time consumed since the last rebase.
            let allocated = self.pcpus[cpu].allocated_time;
            self.pcpus[cpu].allocated_time = Time::zero();
            self.trace_record(cpu, TraceEntry {
                domain: DomainId(0),
                vcpu: VcpuId(0),
                now_delta: now,
                quantum: Time::zero(),
                local_cputime: slice_length,
                allocated,
            });
        }

        // Wait queue first: periodic to the front of the ready queue,
        // sporadic runnable to the back, sporadic blocked parked on the
        // inactive queue (which is drained right below).
        let waiting: Vec<VcpuIdx> = self.pcpus[cpu].wait.iter().copied().collect();
        for idx in waiting {
            self.absorb_arrival(idx);

            if self.vcpus[idx.0].is_sporadic() {
                if self.vcpus[idx.0].is_runnable() {
                    self.vcpus[idx.0].flags.remove(VcpuFlags::INACTIVE);
                    self.enqueue(idx, cpu, QueueKind::Ready, false);
                } else {
                    self.enqueue(idx, cpu, QueueKind::Inactive, false);
                }
            } else {
                self.vcpus[idx.0].flags.remove(VcpuFlags::INACTIVE);
                self.enqueue(idx, cpu, QueueKind::Ready, true);
            }
        }

        let inactive: Vec<VcpuIdx> = self.pcpus[cpu].inactive.iter().copied().collect();
        for idx in inactive {
            self.vcpus[idx.0].flags.remove(VcpuFlags::INACTIVE);
            self.absorb_arrival(idx);

            if self.vcpus[idx.0].is_sporadic() && !self.vcpus[idx.0].is_split() {
                self.enqueue(idx, cpu, QueueKind::Ready, false);
            } else {
                self.enqueue(idx, cpu, QueueKind::Ready, true);
            }
        }

        // Cumulative EDF composition over the rebuilt ready queue.
        let mut prev = self.global_slice_start;
        let order: Vec<VcpuIdx> = self.pcpus[cpu].ready.iter().copied().collect();
        for idx in order {
            let mut stale_side = false;
            {
                let r = &mut self.vcpus[idx.0];

                if r.flags.contains(VcpuFlags::RESET) {
                    r.flags.remove(VcpuFlags::RESET);
                    r.cputime = Time::zero();
                }
                r.flags.remove(VcpuFlags::MIGRATED);
                r.local_cputime = Time::zero();

                if r.is_split() {
                    if r.cpu_a == cpu {
                        let curr = Time::nanos(
                            r.slice_a as i64 * slice_length.as_nanos() / r.period_a as i64);
                        r.local_slice = curr;
                        prev += curr;
                        r.local_deadline = prev;
                        r.local_slice -= DISPATCH_SLACK;
                        r.local_cputime = r.local_slice;

                        r.flags.insert(VcpuFlags::MIGRATING);

                        let second = Time::nanos(
                            r.slice_b as i64 * slice_length.as_nanos() / r.period_b as i64);
                        r.local_deadline_second = global_deadline;
                        r.local_slice_second = second;
                    } else if r.cpu_b == cpu {
                        let curr = Time::nanos(
                            r.slice_b as i64 * slice_length.as_nanos() / r.period_b as i64);
                        r.local_slice_second = curr;
                        prev += curr;
                        r.local_deadline_second = prev;
                        r.local_slice_second -= DISPATCH_SLACK;
                        r.local_cputime = r.local_slice_second;

                        r.flags.insert(VcpuFlags::MIGRATING);

                        let first = Time::nanos(
                            r.slice_a as i64 * slice_length.as_nanos() / r.period_a as i64);
                        r.local_deadline = global_deadline;
                        r.local_slice = first;
                    } else {
                        stale_side = true;
                    }
                } else {
                    let curr = Time::nanos(
                        r.norm_slice as i64 * slice_length.as_nanos() / r.norm_period as i64);
                    r.local_slice = curr;
                    prev += curr;
                    r.local_deadline = prev;
                    r.local_slice -= DISPATCH_SLACK;
                    r.local_cputime = r.local_slice;
                }
            }

            if stale_side {
                log::warn!("split {} composed on PCPU {cpu}, which is neither of its sides",
                    self.vcpu_name(idx));
            }
        }
    }

    /// A guest-announced arrival turns into sporadic mode once absorbed.
    fn absorb_arrival(&mut self, idx: VcpuIdx) {
        if self.vcpus[idx.0].flags.contains(VcpuFlags::ARRIVED) {
            self.vcpus[idx.0].flags.remove(VcpuFlags::ARRIVED);
            self.vcpus[idx.0].flags.insert(VcpuFlags::SPORADIC);
        }
    }
}

// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::core::Scheduler;
    use crate::sched::reservation::Reservation;

    fn seed_vcpu(core: &mut SchedCore, domain: u32, norm_slice: u64, sporadic: bool) -> VcpuIdx {
        let idx = VcpuIdx(core.vcpus.len());
        let mut r = Reservation::new(DomainId(domain), VcpuId(0));
        if !sporadic {
            r.flags.remove(VcpuFlags::SPORADIC);
        }
        r.flags.remove(VcpuFlags::ASLEEP);
        r.norm_slice = norm_slice;
        r.norm_period = NORM_PERIOD;
        core.vcpus.push(r);
        core.channel.grow_to(core.vcpus.len());
        idx
    }

    #[test]
    fn local_deadlines_are_cumulative() {
        let sched = Scheduler::new(2);
        sched.with_core(|core| {
            core.global_slice_start = Time::millis(100);
            core.global_deadline = Time::millis(200);

            let a = seed_vcpu(core, 1, 20_000, false);
            let b = seed_vcpu(core, 2, 30_000, false);
            core.pcpus[1].ready.push_back(a);
            core.pcpus[1].ready.push_back(b);

            core.recompute_local_deadlines(1, Time::millis(100));

            // 20% and 30% of the 100 ms interval, threaded in order.
            assert_eq!(core.vcpus[a.0].local_deadline, Time::millis(120));
            assert_eq!(core.vcpus[b.0].local_deadline, Time::millis(150));
            assert_eq!(core.vcpus[a.0].local_slice, Time::millis(20) - DISPATCH_SLACK);
            assert_eq!(core.vcpus[b.0].local_slice, Time::millis(30) - DISPATCH_SLACK);
            assert_eq!(core.vcpus[a.0].local_cputime, core.vcpus[a.0].local_slice);
        });
    }

    #[test]
    fn wait_promotion_orders_periodic_before_sporadic() {
        let sched = Scheduler::new(2);
        sched.with_core(|core| {
            core.global_slice_start = Time::zero();
            core.global_deadline = Time::millis(100);

            let sporadic = seed_vcpu(core, 1, 10_000, true);
            let periodic = seed_vcpu(core, 2, 10_000, false);
            core.pcpus[1].wait.push_back(sporadic);
            core.pcpus[1].wait.push_back(periodic);

            core.recompute_local_deadlines(1, Time::zero());

            let order: Vec<_> = core.pcpus[1].ready.iter().copied().collect();
            assert_eq!(order, [periodic, sporadic]);
        });
    }

    #[test]
    fn blocked_sporadic_ends_up_on_ready_tail_inactive_cleared() {
        let sched = Scheduler::new(2);
        sched.with_core(|core| {
            core.global_slice_start = Time::zero();
            core.global_deadline = Time::millis(100);

            let blocked = seed_vcpu(core, 1, 10_000, true);
            core.vcpus[blocked.0].flags.insert(VcpuFlags::ASLEEP | VcpuFlags::INACTIVE);
            let runnable = seed_vcpu(core, 2, 10_000, true);
            core.pcpus[1].wait.push_back(blocked);
            core.pcpus[1].wait.push_back(runnable);

            core.recompute_local_deadlines(1, Time::zero());

            // The blocked one passed through the inactive queue and was
            // appended behind the runnable sporadic VCPU.
            let order: Vec<_> = core.pcpus[1].ready.iter().copied().collect();
            assert_eq!(order, [runnable, blocked]);
            assert!(!core.vcpus[blocked.0].flags.contains(VcpuFlags::INACTIVE));
        });
    }

    #[test]
    fn split_sides_get_fragment_and_handoff() {
        let sched = Scheduler::new(3);
        sched.with_core(|core| {
            core.global_slice_start = Time::millis(0);
            core.global_deadline = Time::millis(300);

            let v = seed_vcpu(core, 1, 160_000, false);
            {
                let r = &mut core.vcpus[v.0];
                r.flags.insert(VcpuFlags::SPLIT);
                r.cpu_a = 1;
                r.cpu_b = 2;
                r.period_a = 300_000;
                r.period_b = 300_000;
                r.slice_a = 120_000;
                r.slice_b = 40_000;
            }

            core.pcpus[1].ready.push_back(v);
            core.recompute_local_deadlines(1, Time::zero());

            // On cpu_a: the a-fragment is cumulative, the b-fragment is
            // pinned against G for the handoff.
            let r = &core.vcpus[v.0];
            assert_eq!(r.local_deadline, Time::millis(120));
            assert_eq!(r.local_slice, Time::millis(120) - DISPATCH_SLACK);
            assert_eq!(r.local_deadline_second, Time::millis(300));
            assert_eq!(r.local_slice_second, Time::millis(40));
            assert!(r.flags.contains(VcpuFlags::MIGRATING));

            core.pcpus[1].unlink(v);
            core.pcpus[2].ready.push_back(v);
            core.recompute_local_deadlines(2, Time::zero());

            // On cpu_b the roles swap.
            let r = &core.vcpus[v.0];
            assert_eq!(r.local_deadline_second, Time::millis(40));
            assert_eq!(r.local_slice_second, Time::millis(40) - DISPATCH_SLACK);
            assert_eq!(r.local_deadline, Time::millis(300));
            assert_eq!(r.local_slice, Time::millis(120));
        });
    }
}
