use crate::prelude::*;

use crate::trace::{DebugState, TraceEntry, IDLE_DOMAIN};

use super::{TaskSlice, VcpuIdx};
use super::core::SchedCore;
use super::pcpu::QueueKind;

/// Quantum handed back while a PCPU has nothing useful to do but a
/// global deadline is known.
const IDLE_WAIT: Time = Time::millis(100);

/// Retry quantum when the queue head is still being context-switched
/// away on another PCPU, or no global deadline exists yet.
const RETRY_QUANTUM: Time = Time::micros(4);

/// Fallback budget for a sporadic VCPU picked with an exhausted budget.
const SPORADIC_REFILL: Time = Time::millis(10);

impl SchedCore {
    /// Per-PCPU dispatch, invoked on timer expiry or a reschedule signal.
    ///
    /// Charges the outgoing VCPU, harvests migrated-in VCPUs, retires or
    /// migrates VCPUs whose local slice is spent, enters the global
    /// barrier when due, and picks the next VCPU under local EDF.
    pub(crate) fn do_schedule(&mut self, cpu: PcpuId, now: Time, tasklet_work: bool) -> TaskSlice {
        let prev = self.pcpus[cpu].current;
        let ran = now - self.pcpus[cpu].sched_start;
        self.pcpus[cpu].allocated_time += ran;

        self.harvest_migrated(cpu);

        if let Some(cur) = prev {
            if !self.cpu0_busy && self.vcpus[cur.0].cpu == cpu {
                self.vcpus[cur.0].local_cputime -= ran;
                self.vcpus[cur.0].cputime += ran;

                // A sporadic VCPU that burned its budget yields the head.
                if self.vcpus[cur.0].is_sporadic()
                    && self.vcpus[cur.0].local_cputime.is_negative()
                {
                    self.enqueue(cur, cpu, QueueKind::Ready, false);
                }
            }
        }

        self.update_queues(cpu, now);

        if self.barrier_due(cpu, now) {
            self.global_barrier(cpu, now);
        }

        let observed = self.pcpus[cpu].observed_deadline;
        let head = self.pcpus[cpu].ready.front().copied();

        let mut task = None;
        let mut time;

        if tasklet_work {
            time = EXTRA_QUANTUM;
        } else if let Some(head) = head.filter(|_|
            (observed >= now + MIN_QUANTUM || cpu == 0) && !self.cpu0_busy)
        {
            let running_elsewhere = self.pcpus.iter()
                .enumerate()
                .any(|(i, p)| i != cpu && p.current == Some(head));

            if self.vcpus[head.0].is_active()
                && self.vcpus[head.0].is_runnable()
                && !running_elsewhere
            {
                task = Some(head);
                if self.vcpus[head.0].is_sporadic() {
                    let mut t = self.vcpus[head.0].local_slice_on(cpu);
                    t = Time::min(self.vcpus[head.0].local_cputime, t);
                    if t.is_negative() {
                        t = SPORADIC_REFILL;
                    }
                    if now + t > observed {
                        t = observed - now;
                    }
                    time = t;
                } else {
                    time = self.vcpus[head.0].local_deadline_on(cpu) - now;
                }

                // PCPU 0 belongs to dom0 outright: the whole global slice.
                if cpu == 0 {
                    time = self.global_deadline - now;
                }
            } else {
                // Head not pickable; idle out its remaining window.
                time =
                    if self.vcpus[head.0].is_sporadic() {
                        if IDLE_WAIT + now <= observed { IDLE_WAIT } else { observed - now }
                    } else {
                        self.vcpus[head.0].local_deadline_on(cpu) - now
                    };

                if running_elsewhere {
                    time = RETRY_QUANTUM;
                }
            }
        } else if !observed.is_zero() {
            time = if IDLE_WAIT + now <= observed { IDLE_WAIT } else { observed - now };
        } else {
            time = RETRY_QUANTUM;
        }

        if time < MIN_QUANTUM {
            time = MIN_QUANTUM;
        }

        if let Some(t) = task {
            self.vcpus[t.0].flags.remove(VcpuFlags::MIGRATED);
        }

        self.record_decision(cpu, task, now, time, ran);
        if cpu == 0 {
            self.pump_trace_print();
        }

        if let Some(t) = task {
            self.vcpus[t.0].sched_start = now;
            self.vcpus[t.0].flags.insert(VcpuFlags::RUNNING);
        }
        if let Some(p) = prev {
            if task != Some(p) {
                self.vcpus[p.0].flags.remove(VcpuFlags::RUNNING);
            }
        }
        self.pcpus[cpu].current = task;
        self.pcpus[cpu].sched_start = now;
        self.pcpus[cpu].current_slice_expires = now + time;

        debug_assert!(time > Time::zero());
        TaskSlice { task, time, migrated: false }
    }

    /// Move VCPUs that arrived from another PCPU into the ready queue:
    /// mid-interval hops jump the queue, others join at the back.
    fn harvest_migrated(&mut self, cpu: PcpuId) {
        if self.cpu0_busy {
            return;
        }

        let arrivals: Vec<VcpuIdx> = self.pcpus[cpu].migrated.iter().copied().collect();
        for idx in arrivals {
            if self.vcpus[idx.0].cpu != cpu {
                continue;
            }
            let slice = self.vcpus[idx.0].local_slice_on(cpu);
            self.vcpus[idx.0].local_cputime = slice;

            if self.vcpus[idx.0].flags.contains(VcpuFlags::MIGRATING) {
                self.enqueue(idx, cpu, QueueKind::Ready, true);
            } else {
                self.enqueue(idx, cpu, QueueKind::Ready, false);
            }
        }
    }

    /// Retire VCPUs whose local window is over and hand split VCPUs to
    /// their other PCPU once this side's sub-slice is exhausted.
    fn update_queues(&mut self, cpu: PcpuId, now: Time) {
        if self.cpu0_busy {
            return;
        }

        let observed = self.pcpus[cpu].observed_deadline;
        let order: Vec<VcpuIdx> = self.pcpus[cpu].ready.iter().copied().collect();
        for idx in order {
            if self.cpu0_busy {
                break;
            }
            if self.vcpus[idx.0].cpu != cpu {
                continue;
            }

            if self.vcpus[idx.0].is_sporadic() {
                if now >= observed
                    || !self.vcpus[idx.0].is_active()
                    || !self.vcpus[idx.0].is_runnable()
                    || self.vcpus[idx.0].local_cputime.is_negative()
                {
                    self.seed_local_slice(idx);
                    self.enqueue(idx, cpu, QueueKind::Wait, true);
                } else if self.vcpus[idx.0].is_split()
                    && self.vcpus[idx.0].flags.contains(VcpuFlags::MIGRATING)
                    && (self.vcpus[idx.0].local_cputime - DISPATCH_SLACK).is_negative()
                {
                    self.migrate_split(idx, cpu, true);
                }
            } else if self.vcpus[idx.0].local_cputime <= Time::zero()
                || self.vcpus[idx.0].local_deadline_on(cpu) <= now
                || now >= observed
            {
                self.seed_local_slice(idx);

                if self.vcpus[idx.0].is_split()
                    && self.vcpus[idx.0].flags.contains(VcpuFlags::MIGRATING)
                {
                    self.migrate_split(idx, cpu, false);
                } else {
                    self.enqueue(idx, cpu, QueueKind::Wait, true);
                }
            }
        }
    }

    /// A VCPU that has never been composed carries a zero local slice;
    /// seeding it with the full slice forces the first barrier pass to
    /// treat it as expired and compose it properly.
    fn seed_local_slice(&mut self, idx: VcpuIdx) {
        if self.vcpus[idx.0].local_slice.is_zero() {
            let slice = self.vcpus[idx.0].slice;
            self.vcpus[idx.0].local_slice = slice;
        }
    }

    /// Hop a split VCPU to the other side of its reservation. The target
    /// observes the arrival on its migrated-in queue at its next
    /// dispatch; it is signalled right away when idle (or, for sporadic
    /// hops, when its running VCPU is out of budget).
    fn migrate_split(&mut self, idx: VcpuIdx, cpu: PcpuId, budget_signal: bool) {
        let bound = self.vcpus[idx.0].cpu;
        let target = self.vcpus[idx.0].other_side(bound);

        self.vcpus[idx.0].flags.remove(VcpuFlags::MIGRATING);

        if target == bound || target == cpu {
            log::warn!("split {} has both sides on PCPU {target}, not migrating",
                self.vcpu_name(idx));
            return;
        }

        self.vcpus[idx.0].cpu = target;
        self.vcpus[idx.0].flags.insert(VcpuFlags::MIGRATED);
        self.enqueue(idx, target, QueueKind::Migrated, false);

        let target_stalled = match self.pcpus[target].current {
            None => true,
            Some(cur) => budget_signal && self.vcpus[cur.0].local_cputime.is_negative(),
        };
        if self.pcpus[target].observed_deadline.is_zero()
            || self.pcpus[target].current_slice_expires.is_zero()
            || target_stalled
        {
            self.raise_signal(target);
        }
    }

    fn record_decision(
        &mut self,
        cpu: PcpuId,
        task: Option<VcpuIdx>,
        now: Time,
        time: Time,
        ran: Time,
    ) {
        if self.debug_state != DebugState::Collecting {
            return;
        }

        let (domain, vcpu, local_cputime) = match task {
            Some(t) => {
                let r = &self.vcpus[t.0];
                (r.domain, r.vcpu, r.local_cputime)
            },
            None => (IDLE_DOMAIN, VcpuId(0), Time::zero()),
        };

        // Runs of idle decisions collapse into their first entry.
        if domain == IDLE_DOMAIN {
            if let Some(last) = self.pcpus[cpu].trace.last() {
                if last.domain == IDLE_DOMAIN {
                    return;
                }
            }
        }

        self.trace_record(cpu, TraceEntry {
            domain,
            vcpu,
            now_delta: now,
            quantum: time,
            local_cputime,
            allocated: ran,
        });
    }

    /// While in the printing state, PCPU 0 drains one bounded chunk per
    /// dispatch so the console is never flooded inside one tick.
    fn pump_trace_print(&mut self) {
        let DebugState::Printing { cpu: print_cpu } = self.debug_state else {
            return;
        };

        if print_cpu >= self.nr_cpus || print_cpu > self.last_assigned {
            self.debug_state = DebugState::Idle;
            return;
        }

        let chunk = self.pcpus[print_cpu].trace.drain_chunk();
        for e in &chunk {
            log::info!("pcpu {print_cpu}: {} {}.{} {} {} {}",
                e.now_delta, e.domain, e.vcpu, e.quantum, e.local_cputime, e.allocated);
        }

        if self.pcpus[print_cpu].trace.is_drained() {
            self.debug_state =
                if print_cpu + 1 > self.last_assigned {
                    DebugState::Idle
                } else {
                    DebugState::Printing { cpu: print_cpu + 1 }
                };
        }
    }
}

// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::core::{SchedParams, Scheduler};

    fn boot(nr_cpus: usize, guests: &[(u32, i64, i64)]) -> Scheduler {
        let sched = Scheduler::new(nr_cpus);
        sched.insert_vcpu(DomainId(0), VcpuId(0)).unwrap();
        sched.wake(DomainId(0), VcpuId(0), Time::zero()).unwrap();

        for &(dom, period_ms, slice_ms) in guests {
            sched.insert_vcpu(DomainId(dom), VcpuId(0)).unwrap();
            let params = SchedParams {
                period: Time::millis(period_ms),
                slice: Time::millis(slice_ms),
                vcpu_index: 0,
            };
            sched.adjust_put(DomainId(dom), params, Time::zero()).unwrap();
            sched.wake(DomainId(dom), VcpuId(0), Time::zero()).unwrap();
        }
        sched
    }

    #[test]
    fn tasklet_work_idles_with_extra_quantum() {
        let sched = boot(2, &[]);
        let slice = sched.do_schedule(1, Time::micros(50), true);
        assert_eq!(slice.task, None);
        assert_eq!(slice.time, EXTRA_QUANTUM);
    }

    #[test]
    fn empty_ready_queue_idles() {
        let sched = boot(2, &[]);
        sched.do_schedule(0, Time::micros(10), false);
        let slice = sched.do_schedule(1, Time::micros(20), false);
        assert_eq!(slice.task, None);
        assert!(slice.time >= MIN_QUANTUM);
    }

    #[test]
    fn quantum_never_below_floor() {
        let sched = boot(3, &[(1, 100, 20)]);
        sched.do_schedule(0, Time::micros(10), false);

        let (_, g) = sched.global_window();
        // Dispatch right at the edge of the interval.
        let slice = sched.do_schedule(1, g - Time::nanos(200), false);
        assert!(slice.time >= MIN_QUANTUM);
    }

    #[test]
    fn pcpu0_runs_dom0_for_the_whole_global_slice() {
        let sched = boot(3, &[(1, 100, 20)]);
        sched.do_schedule(0, Time::micros(10), false);
        let slice = sched.do_schedule(0, Time::micros(30), false);

        let (_, g) = sched.global_window();
        let (dom, _) = sched.identity_of(slice.task.unwrap()).unwrap();
        assert_eq!(dom, DomainId(0));
        assert_eq!(slice.time, g - Time::micros(30));
    }

    #[test]
    fn guest_is_dispatched_on_its_pcpu() {
        let sched = boot(3, &[(1, 100, 20)]);
        sched.do_schedule(0, Time::micros(10), false);

        let slice = sched.do_schedule(1, Time::micros(20), false);
        let (dom, _) = sched.identity_of(slice.task.unwrap()).unwrap();
        assert_eq!(dom, DomainId(1));
        assert!(slice.time > Time::zero());
    }

    #[test]
    fn running_flag_follows_dispatch() {
        let sched = boot(3, &[(1, 100, 20)]);
        sched.do_schedule(0, Time::micros(10), false);
        let slice = sched.do_schedule(1, Time::micros(20), false);
        let task = slice.task.unwrap();

        sched.with_core(|core| {
            assert!(core.vcpus[task.0].flags.contains(VcpuFlags::RUNNING));
            assert_eq!(core.pcpus[1].current, Some(task));
        });
    }

    #[test]
    fn sporadic_burnout_moves_to_wait() {
        let sched = boot(3, &[(1, 100, 20)]);
        sched.do_schedule(0, Time::micros(10), false);

        let slice = sched.do_schedule(1, Time::micros(20), false);
        let task = slice.task.unwrap();

        // Burn well past the granted quantum, then dispatch again: the
        // exhausted sporadic VCPU must leave the ready queue.
        let burn = Time::micros(20) + slice.time + Time::millis(1);
        sched.do_schedule(1, burn, false);

        sched.with_core(|core| {
            assert!(core.vcpus[task.0].local_cputime.is_negative());
            assert_ne!(core.pcpus[1].current, Some(task));
        });
    }
}
