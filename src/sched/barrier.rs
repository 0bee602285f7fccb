use crate::prelude::*;

use super::VcpuIdx;
use super::core::SchedCore;

/// Slack past the observed deadline before a reshuffle-pending barrier
/// reruns on PCPU 0.
const RESHUFFLE_GRACE: Time = Time::micros(15);

/// Fallback step applied while the global deadline lags behind the clock.
const BEHIND_STEP: Time = Time::millis(1);

impl SchedCore {
    /// Global deadline barrier. PCPU 0 advances the published (S, G)
    /// window and re-evaluates every reservation; all PCPUs (0 included)
    /// then recompose their local deadlines against the published window.
    ///
    /// Peers never modify global state here: a peer that already observed
    /// the current G returns immediately, otherwise it only recomputes
    /// its own local slices.
    pub(crate) fn global_barrier(&mut self, cpu: PcpuId, now: Time) {
        if cpu == 0 {
            if self.pcpus[0].observed_deadline == self.global_deadline {
                self.advance_global_deadline(now);
            }
            // else: G already moved under us; only recompose below.
        } else if self.pcpus[cpu].observed_deadline == self.global_deadline {
            return;
        }

        self.recompute_local_deadlines(cpu, now);
        self.pcpus[cpu].observed_deadline = self.global_deadline;
    }

    /// Whether this PCPU's dispatcher should enter the barrier now.
    pub(crate) fn barrier_due(&self, cpu: PcpuId, now: Time) -> bool {
        let observed = self.pcpus[cpu].observed_deadline;
        if cpu == 0 {
            if self.reshuffle {
                observed.is_zero() || observed + RESHUFFLE_GRACE <= now
            } else {
                observed.is_zero() || observed <= now
            }
        } else {
            observed <= now || observed != self.global_deadline
        }
    }

    /// The PCPU 0 half of the barrier: acknowledge expired deadlines,
    /// choose the next global deadline, replan reservations if a
    /// reshuffle is pending, and publish the new (S, G) pair.
    fn advance_global_deadline(&mut self, now: Time) {
        self.cpu0_busy = true;

        let mut new_deadline = self.global_deadline;

        if self.deadline_queue.is_empty() {
            log::error!("deadline queue empty at barrier entry");
            new_deadline += BEHIND_STEP;
        } else {
            // Acknowledge minima until the queue head leaves a workable
            // interval ahead of us. Each pass pushes one VCPU's deadline
            // at least a period forward, so the loop drains in at most a
            // few passes per VCPU.
            while let Some(expired) = self.deadline_queue.peek() {
                self.acknowledge_deadline(expired, now);
                let key = self.vcpus[expired.0].deadline_abs;
                self.deadline_queue.requeue(key, expired);

                let Some(head) = self.peek_refreshed_min() else { break };

                let head_deadline = self.vcpus[head.0].deadline_abs;
                if head_deadline - now < MIN_GLOBAL_INTERVAL {
                    let second_close = self.deadline_queue.peek_second()
                        .map(|s| self.vcpus[s.0].deadline_abs - now < MIN_GLOBAL_INTERVAL)
                        .unwrap_or(false);

                    if second_close {
                        continue;
                    }
                    // Too close to rebase on: enforce the interval floor.
                    new_deadline = now + MIN_GLOBAL_INTERVAL;
                } else {
                    new_deadline = head_deadline;
                }
                break;
            }
        }

        while new_deadline <= now {
            log::warn!("global deadline behind the clock by {}, stepping forward",
                now - new_deadline);
            new_deadline += BEHIND_STEP;
        }

        if self.reshuffle {
            log::info!("replanning bandwidth reservations across {} PCPUs",
                self.nr_cpus - self.dom0_cpu_count);
            for i in self.dom0_cpu_count..self.nr_cpus {
                self.pcpus[i].hyper_slice = 0;
                self.pcpus[i].hyper_period = NORM_PERIOD;
            }
        }
        for i in self.dom0_cpu_count..self.nr_cpus {
            self.pcpus[i].used_slice = 0;
            self.pcpus[i].used_period = NORM_PERIOD;
        }

        // Refresh every reservation in sc-list order. With a reshuffle
        // pending, pending parameters are applied and the packer reruns
        // before the per-interval activation.
        let sc_list = self.sc_list.clone();
        for idx in sc_list {
            if self.reshuffle {
                self.vcpus[idx.0].renormalize();
                if let Err(err) = self.assign_pcpu(idx) {
                    log::warn!("replanning failed for {}: {}", self.vcpu_name(idx), err);
                }
            }
            self.vcpus[idx.0].flags.remove(VcpuFlags::WOKEN);
            self.refresh_reservation(idx);
        }

        // Publish the new window and let every active PCPU rebase.
        self.global_slice_start = now;
        self.global_deadline = new_deadline;
        self.reshuffle = false;
        self.cpu0_busy = false;

        let last = usize::min(self.last_assigned, self.nr_cpus - 1);
        for i in self.dom0_cpu_count..=last {
            self.raise_signal(i);
        }
    }

    /// Queue head after absorbing a one-shot deadline override on it.
    fn peek_refreshed_min(&mut self) -> Option<VcpuIdx> {
        let head = self.deadline_queue.peek()?;
        if self.vcpus[head.0].flags.contains(VcpuFlags::UPDATE_DEADLINE) {
            self.vcpus[head.0].flags.remove(VcpuFlags::UPDATE_DEADLINE);
            let key = self.vcpus[head.0].deadline_abs;
            self.deadline_queue.requeue(key, head);
            return self.deadline_queue.peek();
        }
        Some(head)
    }

    /// Acknowledge one expired deadline: grant a guest-requested deadline
    /// when one is pending on the shared channel, otherwise advance by
    /// the period, catching up in period steps when the VCPU is behind.
    fn acknowledge_deadline(&mut self, idx: VcpuIdx, now: Time) {
        if !self.vcpus[idx.0].flags.contains(VcpuFlags::UPDATE_DEADLINE) {
            self.vcpus[idx.0].flags.insert(VcpuFlags::RESET);
        }

        if self.channel.slot(idx).arrival > 0 {
            self.vcpus[idx.0].flags.remove(VcpuFlags::UPDATE_DEADLINE);

            let requested = self.channel.slot(idx).next_deadline;
            self.vcpus[idx.0].deadline_abs = requested;

            let slot = self.channel.slot_mut(idx);
            slot.granted_deadline = requested;
            slot.next_deadline = Time::zero();
            slot.arrival = 0;
            slot.debug_iter = 0;
        } else if self.vcpus[idx.0].flags.contains(VcpuFlags::UPDATE_DEADLINE) {
            self.vcpus[idx.0].flags.remove(VcpuFlags::UPDATE_DEADLINE);
        } else {
            let period = self.vcpus[idx.0].period;
            self.vcpus[idx.0].deadline_abs += period;
            let granted = self.vcpus[idx.0].deadline_abs;
            self.channel.slot_mut(idx).granted_deadline = granted;

            if self.channel.slot(idx).rta_active > 0 {
                let requested = self.channel.slot(idx).next_deadline;
                if !requested.is_zero() {
                    self.vcpus[idx.0].deadline_abs = requested;
                    let slot = self.channel.slot_mut(idx);
                    slot.granted_deadline = requested;
                }
                self.channel.slot_mut(idx).next_deadline = Time::zero();
            }
        }

        while self.vcpus[idx.0].deadline_abs <= now {
            log::warn!("{} missed its deadline by {}, skipping a period",
                self.vcpu_name(idx), now - self.vcpus[idx.0].deadline_abs);

            if self.vcpus[idx.0].deadline_abs.is_zero() {
                self.vcpus[idx.0].deadline_abs = now;
            } else {
                let period = self.vcpus[idx.0].period;
                self.vcpus[idx.0].deadline_abs += period;
            }

            let granted = self.vcpus[idx.0].deadline_abs;
            let slot = self.channel.slot_mut(idx);
            slot.granted_deadline = granted;
            slot.next_deadline = Time::zero();
        }
    }
}

// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::core::Scheduler;

    fn boot(nr_cpus: usize, guests: &[(u32, i64, i64)]) -> Scheduler {
        let sched = Scheduler::new(nr_cpus);
        sched.insert_vcpu(DomainId(0), VcpuId(0)).unwrap();
        sched.wake(DomainId(0), VcpuId(0), Time::zero()).unwrap();

        for &(dom, period_ms, slice_ms) in guests {
            sched.insert_vcpu(DomainId(dom), VcpuId(0)).unwrap();
            let params = crate::sched::core::SchedParams {
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
    fn barrier_publishes_consistent_window() {
        let sched = boot(3, &[(1, 100, 20)]);

        // First dispatch on PCPU 0 enters the barrier (G uninitialized).
        sched.do_schedule(0, Time::micros(10), false);

        let (s, g) = sched.global_window();
        assert!(s <= Time::micros(10));
        assert!(g > Time::micros(10));
        assert!(g - s >= MIN_GLOBAL_INTERVAL);
    }

    #[test]
    fn deadlines_advance_in_period_multiples() {
        let sched = boot(3, &[(1, 100, 20)]);
        sched.do_schedule(0, Time::micros(10), false);

        // Woken at t = 0, so deadlines stay on the period grid.
        let first = sched.granted_deadline(DomainId(1), VcpuId(0)).unwrap();
        assert!(!first.is_zero());
        assert_eq!(first.as_nanos() % Time::millis(100).as_nanos(), 0);
    }

    #[test]
    fn catch_up_skips_whole_periods() {
        let sched = boot(3, &[(1, 20, 5)]);
        sched.do_schedule(0, Time::micros(10), false);

        // Jump far past several deadlines: the barrier must fast-forward
        // the guest's deadline beyond now in period steps.
        let late = Time::millis(85);
        sched.do_schedule(0, late, false);

        let granted = sched.granted_deadline(DomainId(1), VcpuId(0)).unwrap();
        assert!(granted > late);
        // Integer period multiples from the original phase at t = 0.
        assert_eq!(granted.as_nanos() % Time::millis(20).as_nanos(), 0);
    }

    #[test]
    fn interval_floor_is_enforced() {
        // Short periods leave the queue head too close to now at the
        // second barrier, forcing the 250 us floor.
        let sched = Scheduler::new(4);
        sched.insert_vcpu(DomainId(0), VcpuId(0)).unwrap();
        sched.wake(DomainId(0), VcpuId(0), Time::zero()).unwrap();

        for (dom, period_us, slice_us) in [(1u32, 300i64, 50i64), (2, 400, 50)] {
            sched.insert_vcpu(DomainId(dom), VcpuId(0)).unwrap();
            let params = crate::sched::core::SchedParams {
                period: Time::micros(period_us),
                slice: Time::micros(slice_us),
                vcpu_index: 0,
            };
            sched.adjust_put(DomainId(dom), params, Time::zero()).unwrap();
            sched.wake(DomainId(dom), VcpuId(0), Time::zero()).unwrap();
        }

        sched.do_schedule(0, Time::micros(10), false);
        let (_, g) = sched.global_window();
        assert_eq!(g, Time::micros(400));

        let step = g + Time::nanos(1);
        sched.do_schedule(0, step, false);

        let (s2, g2) = sched.global_window();
        assert_eq!(s2, step);
        assert_eq!(g2, step + MIN_GLOBAL_INTERVAL);
        assert!(g2 - s2 >= MIN_GLOBAL_INTERVAL);
    }

    #[test]
    fn guest_requested_deadline_is_granted() {
        let sched = boot(3, &[(1, 100, 20)]);
        sched.do_schedule(0, Time::micros(10), false);

        let wanted = Time::millis(400);
        sched.announce_arrival(DomainId(1), VcpuId(0)).unwrap();
        sched.request_deadline(DomainId(1), VcpuId(0), wanted).unwrap();

        let (_, g) = sched.global_window();
        sched.do_schedule(0, g + Time::nanos(1), false);

        assert_eq!(sched.granted_deadline(DomainId(1), VcpuId(0)).unwrap(), wanted);
    }

    #[test]
    fn reshuffle_applies_pending_parameters() {
        let sched = boot(4, &[(1, 100, 20)]);
        sched.do_schedule(0, Time::micros(10), false);

        // Second putinfo stores pending values and schedules a reshuffle.
        let params = crate::sched::core::SchedParams {
            period: Time::millis(50),
            slice: Time::millis(25),
            vcpu_index: 0,
        };
        sched.adjust_put(DomainId(1), params, Time::millis(1)).unwrap();

        let (_, g) = sched.global_window();
        sched.do_schedule(0, g + Time::nanos(1), false);

        let p = sched.placement(DomainId(1), VcpuId(0)).unwrap();
        assert_eq!(p.slice_a, 50_000);
        let info = sched.adjust_get(DomainId(1)).unwrap();
        assert_eq!(info.period, Time::millis(50));
        assert_eq!(info.slice, Time::millis(25));
    }
}
