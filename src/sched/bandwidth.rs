use crate::prelude::*;

use crate::common::rational;

use super::VcpuIdx;
use super::Error;
use super::core::SchedCore;
use super::pcpu::QueueKind;

/// Normalized-units threshold under which a nearly-full PCPU is rounded
/// up to completely booked, closing slivers the packer could otherwise
/// chase forever.
pub const PACK_SLIVER: u64 = 1000;

/// Levin, G., Funk, S., Sadowski, C., Pye, I. and Brandt, S., 2010.
/// DP-FAIR: A simple model for understanding optimal multiprocessor
/// scheduling. *22nd Euromicro Conference on Real-Time Systems.*
///
/// The packer realizes the "wrap" step: reservations are laid out over
/// the PCPUs in order, and a reservation that straddles a PCPU boundary
/// is split across the two adjacent PCPUs.
impl SchedCore {
    /// Place a VCPU's normalized reservation onto the fleet.
    ///
    /// PCPUs are scanned in ascending order, starting past the dom0-owned
    /// ones for guest VCPUs. The first PCPU with room takes the whole
    /// reservation; a PCPU with partial room takes what fits and the
    /// remainder spills onto its right neighbor as a split. Fails when
    /// the scan runs off the end of the fleet.
    pub(crate) fn assign_pcpu(&mut self, idx: VcpuIdx) -> Result<(), Error> {
        self.vcpus[idx.0].flags.remove(
            VcpuFlags::SHIFT | VcpuFlags::SPLIT | VcpuFlags::MIGRATED);

        let start =
            if self.vcpus[idx.0].domain.is_dom0() { 0 } else { self.dom0_cpu_count };
        let norm_period = self.vcpus[idx.0].norm_period;
        let norm_slice = self.vcpus[idx.0].norm_slice;

        for cpu_i in start..self.nr_cpus {
            if self.pcpus[cpu_i].is_fully_booked() {
                continue;
            }
            if self.pcpus[cpu_i].hyper_slice != 0
                && self.pcpus[cpu_i].hyper_slice + PACK_SLIVER >= self.pcpus[cpu_i].hyper_period
            {
                self.pcpus[cpu_i].book_full();
                continue;
            }

            let hyper_slice = self.pcpus[cpu_i].hyper_slice;
            let hyper_period = self.pcpus[cpu_i].hyper_period;

            let Some(h) = rational::lcm(hyper_period, norm_period) else {
                log::warn!(
                    "hyper-period overflow combining {} (period' {}) into PCPU {} (period {}), skipping it",
                    self.vcpu_name(idx), norm_period, cpu_i, hyper_period);
                continue;
            };

            let hs = hyper_slice * (h / hyper_period);
            let vs = norm_slice * (h / norm_period);

            if hs + vs < h {
                self.pcpus[cpu_i].hyper_slice = hs + vs;
                self.pcpus[cpu_i].hyper_period = h;
                self.bind_whole(idx, cpu_i);
            } else if hs + vs == h {
                self.pcpus[cpu_i].book_full();
                self.bind_whole(idx, cpu_i);
            } else {
                if cpu_i + 1 == self.nr_cpus {
                    return Err(Error::NoBandwidth);
                }
                self.bind_split(idx, cpu_i, h, hs, vs);
            }
            return Ok(());
        }

        Err(Error::NoBandwidth)
    }

    /// The reservation fits on `cpu_i` in full.
    fn bind_whole(&mut self, idx: VcpuIdx, cpu_i: PcpuId) {
        let moved = self.vcpus[idx.0].cpu != cpu_i;
        self.vcpus[idx.0].cpu = cpu_i;
        self.vcpus[idx.0].cpu_a = cpu_i;
        self.last_assigned = usize::max(self.last_assigned, cpu_i);
        self.enqueue(idx, cpu_i, QueueKind::Inactive, false);
        if moved {
            self.raise_signal(cpu_i);
        }
    }

    /// The reservation straddles `cpu_i`: the free remainder of `cpu_i`
    /// becomes the a-side fragment, the rest lands on `cpu_i + 1`. Both
    /// fragments are expressed over the shared hyper-period `h`.
    fn bind_split(&mut self, idx: VcpuIdx, cpu_i: PcpuId, h: u64, hs: u64, vs: u64) {
        let remainder = h - hs;
        let second = cpu_i + 1;

        self.pcpus[cpu_i].book_full();

        debug_assert_eq!(
            self.pcpus[second].hyper_slice, 0,
            "split spill target PCPU {second} already carries reservations");
        self.pcpus[second].hyper_slice = vs - remainder;
        self.pcpus[second].hyper_period = h;

        {
            let r = &mut self.vcpus[idx.0];
            r.cpu_a = cpu_i;
            r.period_a = h;
            r.slice_a = remainder;
            r.cpu_b = second;
            r.period_b = h;
            r.slice_b = vs - remainder;
            r.flags.insert(VcpuFlags::SPLIT);
        }
        self.last_assigned = usize::max(self.last_assigned, second);

        log::info!(
            "split {}: PCPU {} gets {}/{}, PCPU {} gets {}/{}",
            self.vcpu_name(idx), cpu_i, remainder, h, second, vs - remainder, h);

        let moved = self.vcpus[idx.0].cpu != second;
        self.vcpus[idx.0].cpu = second;
        self.enqueue(idx, second, QueueKind::Inactive, false);
        if moved {
            if self.pcpus[second].observed_deadline.is_zero() {
                self.pcpus[second].observed_deadline = self.global_deadline;
            }
            self.raise_signal(second);
        }
    }

    /// Activate a reservation for the current global interval against the
    /// `used_slice` accounting, splitting dynamically when the primary
    /// PCPU has no room left. Used for sporadic VCPUs, whose bandwidth
    /// only counts while a job is in flight.
    ///
    /// With `move_queues` the VCPU is also re-filed onto the right queue
    /// (barrier-time activation); without, only the placement fields
    /// change (wake-time activation, where the caller re-files).
    pub(crate) fn activate_reservation(&mut self, idx: VcpuIdx, move_queues: bool) {
        let first = self.vcpus[idx.0].cpu_a;
        let second = first + 1;

        if !self.vcpus[idx.0].is_runnable()
            || self.vcpus[idx.0].flags.contains(VcpuFlags::WOKEN)
        {
            if move_queues {
                self.vcpus[idx.0].cpu = first;
                self.enqueue(idx, first, QueueKind::Wait, false);
            }
            return;
        }
        self.vcpus[idx.0].flags.insert(VcpuFlags::WOKEN);

        if self.pcpus[first].used_slice + PACK_SLIVER > self.pcpus[first].used_period {
            self.pcpus[first].used_slice = self.pcpus[first].used_period;
        }

        let norm_slice = self.vcpus[idx.0].norm_slice;
        let used = self.pcpus[first].used_slice;
        let cap = self.pcpus[first].used_period;

        if used + norm_slice < cap {
            self.pcpus[first].used_slice = used + norm_slice;
            self.vcpus[idx.0].cpu = first;
            if move_queues {
                self.enqueue(idx, first, QueueKind::Wait, false);
            }
        } else if used + norm_slice == cap {
            self.pcpus[first].used_slice = cap;
            self.vcpus[idx.0].cpu = first;
            if move_queues {
                self.enqueue(idx, first, QueueKind::Wait, false);
            }
        } else if used == cap {
            // First side already exhausted; the whole job runs on the
            // neighbor this interval.
            self.pcpus[second].used_slice += norm_slice;
            self.vcpus[idx.0].cpu = second;
            if move_queues {
                self.enqueue(idx, second, QueueKind::Wait, false);
            }
        } else {
            let slice_a = cap - used;
            let slice_b = norm_slice - slice_a;

            {
                let r = &mut self.vcpus[idx.0];
                r.flags.insert(VcpuFlags::SPLIT | VcpuFlags::MIGRATING);
                r.slice_a = slice_a;
                r.slice_b = slice_b;
                r.period_a = NORM_PERIOD;
                r.period_b = NORM_PERIOD;
                r.cpu_b = second;
            }
            self.pcpus[first].used_slice = cap;
            self.pcpus[second].used_slice = slice_b;

            self.vcpus[idx.0].cpu = second;
            if move_queues {
                self.enqueue(idx, second, QueueKind::Inactive, false);
            }
        }
    }

    /// Re-apply a reservation at a global-interval boundary, after the
    /// barrier zeroed all `used_slice` accounting. Periodic reservations
    /// are unconditional; sporadic ones go through arrival activation.
    pub(crate) fn refresh_reservation(&mut self, idx: VcpuIdx) {
        let first = self.vcpus[idx.0].cpu_a;
        let second = first + 1;

        if self.vcpus[idx.0].flags
            .intersects(VcpuFlags::SPORADIC | VcpuFlags::ARRIVED)
        {
            self.vcpus[idx.0].flags.remove(VcpuFlags::SPLIT | VcpuFlags::MIGRATING);
            self.activate_reservation(idx, true);
        } else if self.vcpus[idx.0].is_split() {
            let slice_a = self.vcpus[idx.0].slice_a;
            let slice_b = self.vcpus[idx.0].slice_b;
            self.pcpus[first].used_slice += slice_a;
            self.pcpus[second].used_slice += slice_b;
            self.pcpus[first].used_period = NORM_PERIOD;
            self.pcpus[second].used_period = NORM_PERIOD;

            // A periodic split starts every interval on its second PCPU
            // and hops back to the first mid-interval.
            self.vcpus[idx.0].cpu = second;
            self.enqueue(idx, second, QueueKind::Inactive, false);
        } else {
            let cpu = self.vcpus[idx.0].cpu;
            let norm_slice = self.vcpus[idx.0].norm_slice;
            self.pcpus[cpu].used_slice += norm_slice;
            self.pcpus[cpu].used_period = NORM_PERIOD;
        }
    }

    /// Wake-time activation of a sporadic reservation.
    pub(crate) fn dynamic_reservation(&mut self, idx: VcpuIdx) {
        if self.vcpus[idx.0].flags
            .intersects(VcpuFlags::SPORADIC | VcpuFlags::ARRIVED)
        {
            self.vcpus[idx.0].flags.remove(VcpuFlags::SPLIT | VcpuFlags::MIGRATING);
            self.activate_reservation(idx, false);
        }
    }
}

// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::core::Scheduler;
    use crate::sched::reservation::Reservation;

    /// Seed a guest reservation with the given parameters and run the
    /// packer on it, the way the reshuffle path does.
    fn pack(sched: &Scheduler, domain: u32, period_ms: i64, slice_ms: i64) -> Result<(), Error> {
        sched.with_core(|core| {
            let idx = VcpuIdx(core.vcpus.len());
            core.vcpus.push(Reservation::new(DomainId(domain), VcpuId(0)));
            core.channel.grow_to(core.vcpus.len());
            core.vcpus[idx.0].pending_period = (period_ms * 1000) as u64;
            core.vcpus[idx.0].pending_slice = (slice_ms * 1000) as u64;
            core.vcpus[idx.0].renormalize();
            core.assign_pcpu(idx)
        })
    }

    fn fleet_with_dom0() -> Scheduler {
        let sched = Scheduler::new(4);
        sched.insert_vcpu(DomainId(0), VcpuId(0)).unwrap();
        sched
    }

    #[test]
    fn dom0_books_its_own_pcpu() {
        let sched = fleet_with_dom0();
        let p = sched.placement(DomainId(0), VcpuId(0)).unwrap();
        assert_eq!(p.cpu_a, 0);
        assert_eq!(p.cpu_b, None);
        assert_eq!(sched.pcpu_utilization(0), 1.0);
    }

    #[test]
    fn exact_fill_books_pcpu_without_split() {
        // Two periodic VCPUs summing to exactly 100% of one PCPU.
        let sched = fleet_with_dom0();
        pack(&sched, 1, 100, 40).unwrap();
        pack(&sched, 2, 100, 60).unwrap();

        let a = sched.placement(DomainId(1), VcpuId(0)).unwrap();
        let b = sched.placement(DomainId(2), VcpuId(0)).unwrap();
        assert_eq!(a.cpu_a, 1);
        assert_eq!(b.cpu_a, 1);
        assert_eq!(a.cpu_b, None);
        assert_eq!(b.cpu_b, None);

        sched.with_core(|core| {
            assert_eq!(core.pcpus[1].hyper_slice, core.pcpus[1].hyper_period);
        });
    }

    #[test]
    fn full_pcpu_is_skipped_not_split() {
        // A third VCPU behind an exactly-full PCPU lands wholly on the
        // next one.
        let sched = fleet_with_dom0();
        pack(&sched, 1, 100, 40).unwrap();
        pack(&sched, 2, 100, 60).unwrap();
        pack(&sched, 3, 100, 30).unwrap();

        let c = sched.placement(DomainId(3), VcpuId(0)).unwrap();
        assert_eq!(c.cpu_a, 2);
        assert_eq!(c.cpu_b, None);
        assert_eq!(c.slice_a, 30_000);
        sched.with_core(|core| {
            assert_eq!(core.pcpus[2].hyper_slice, 30_000);
            assert_eq!(core.pcpus[2].hyper_period, 100_000);
        });
    }

    #[test]
    fn non_aligned_overflow_splits_across_neighbors() {
        // Periods 100 ms and 150 ms with slices 60 ms and 80 ms: the
        // second reservation overflows PCPU 1 under the combined
        // hyper-period 300000 and splits.
        let sched = fleet_with_dom0();
        pack(&sched, 1, 100, 60).unwrap();

        sched.with_core(|core| {
            assert_eq!(core.pcpus[1].hyper_slice, 60_000);
            assert_eq!(core.pcpus[1].hyper_period, 100_000);
        });

        pack(&sched, 2, 150, 80).unwrap();

        let p = sched.placement(DomainId(2), VcpuId(0)).unwrap();
        assert_eq!(p.cpu_a, 1);
        assert_eq!(p.cpu_b, Some(2));
        assert_eq!(p.period, 300_000);
        assert_eq!(p.slice_a, 120_000); // 300000 - 180000
        assert_eq!(p.slice_b, 40_000);  // 160000 - 120000

        sched.with_core(|core| {
            let idx = core.lookup(DomainId(2), VcpuId(0)).unwrap();
            assert!(core.vcpus[idx.0].is_split());
            assert!(core.pcpus[1].is_fully_booked());
            assert_eq!(core.pcpus[2].hyper_slice, 40_000);
            assert_eq!(core.pcpus[2].hyper_period, 300_000);
        });
    }

    #[test]
    fn admission_fails_when_fleet_is_full() {
        let sched = fleet_with_dom0();
        // Three guest PCPUs; fill them all.
        pack(&sched, 1, 100, 100).unwrap();
        pack(&sched, 2, 100, 100).unwrap();
        pack(&sched, 3, 100, 100).unwrap();

        let err = pack(&sched, 4, 100, 10).unwrap_err();
        assert!(matches!(err, Error::NoBandwidth));
    }

    #[test]
    fn sliver_is_rounded_up_to_full() {
        let sched = fleet_with_dom0();
        // 99.5% leaves a 500-unit sliver, under the 1000-unit threshold.
        pack(&sched, 1, 1000, 995).unwrap();
        pack(&sched, 2, 100, 10).unwrap();

        let p = sched.placement(DomainId(2), VcpuId(0)).unwrap();
        assert_eq!(p.cpu_a, 2);
        sched.with_core(|core| {
            assert!(core.pcpus[1].is_fully_booked());
        });
    }

    #[test]
    fn split_fragments_sum_to_reservation() {
        let sched = fleet_with_dom0();
        pack(&sched, 1, 100, 70).unwrap();
        pack(&sched, 2, 100, 70).unwrap();

        let p = sched.placement(DomainId(2), VcpuId(0)).unwrap();
        assert_eq!(p.cpu_b, Some(p.cpu_a + 1));
        assert_eq!(p.slice_a + p.slice_b, 70_000);
    }

    proptest::proptest! {
        /// Packing any admitted set never overcommits a PCPU and every
        /// split lands on adjacent PCPUs with fragments summing to the
        /// full reservation.
        #[test]
        fn packing_respects_capacity(
            specs in proptest::collection::vec((10i64..500, 1i64..100), 1..12)
        ) {
            let sched = fleet_with_dom0();

            for (i, (period_ms, slice_pct)) in specs.iter().enumerate() {
                let slice_ms = i64::max(1, period_ms * slice_pct / 100);
                let _ = pack(&sched, (i + 1) as u32, *period_ms, slice_ms);
            }

            sched.with_core(|core| {
                for p in &core.pcpus {
                    proptest::prop_assert!(p.hyper_slice <= p.hyper_period);
                }

                for r in core.vcpus.iter().filter(|r| r.is_split()) {
                    proptest::prop_assert_eq!(r.cpu_b, r.cpu_a + 1);
                    let h = r.period_a;
                    let vs = r.norm_slice * (h / r.norm_period);
                    proptest::prop_assert_eq!(r.slice_a + r.slice_b, vs);
                }
                Ok(())
            })?;
        }
    }
}
