use crate::prelude::*;

pub mod prelude {
    pub use super::{
        Error,
        VcpuIdx,
        TaskSlice,
        Placement,
        core::Scheduler,
        core::SchedParams,
        core::DomainInfo,
    };
}

pub mod reservation;
pub mod pcpu;
pub mod deadline_queue;
pub mod bandwidth;
pub mod compositor;
pub mod barrier;
pub mod dispatch;
pub mod core;

/// Index into the scheduler's VCPU arena. Queues and the deadline queue
/// store these instead of owning references.
#[derive(Clone, Copy)]
#[derive(Debug)]
#[derive(PartialEq, Eq, Hash)]
pub struct VcpuIdx(pub usize);

/// Dispatcher verdict: which VCPU to run next on the calling PCPU (None
/// meaning idle) and for how long.
#[derive(Clone, Copy)]
#[derive(Debug)]
pub struct TaskSlice {
    pub task: Option<VcpuIdx>,
    pub time: Time,
    pub migrated: bool,
}

/// Where the packer put a reservation.
#[derive(Clone, Copy)]
#[derive(Debug)]
#[derive(PartialEq, Eq)]
pub struct Placement {
    pub cpu_a: PcpuId,
    pub cpu_b: Option<PcpuId>,
    pub slice_a: u64,
    pub slice_b: u64,
    pub period: u64,
}

#[derive(Debug)]
pub enum Error {
    /// No PCPU in the fleet has room for the reservation.
    NoBandwidth,
    /// Parameter outside its admissible range.
    InvalidParameter(anyhow::Error),
    /// Domain/VCPU pair unknown to the scheduler.
    UnknownVcpu(DomainId, VcpuId),
    /// Period combination exceeds the representable hyper-period.
    HyperPeriodOverflow,
    /// The VCPU arena is full.
    TooManyVcpus,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            Self::NoBandwidth =>
                write!(f, "No PCPU can host the requested bandwidth."),
            Self::InvalidParameter(error) =>
                write!(f, "Invalid parameter: {}", error),
            Self::UnknownVcpu(dom, vcpu) =>
                write!(f, "Unknown VCPU {}.{}", dom, vcpu),
            Self::HyperPeriodOverflow =>
                write!(f, "Hyper-period overflow while combining reservations."),
            Self::TooManyVcpus =>
                write!(f, "VCPU arena is full ({} entries).", MAX_VCPUS),
        }
    }
}

impl std::error::Error for Error { }

impl Error {
    pub fn period_out_of_range(period: Time) -> Self {
        Self::InvalidParameter(anyhow::format_err!(
            "period {period} outside [{PERIOD_MIN}, {PERIOD_MAX}]"
        ))
    }

    pub fn slice_out_of_range(slice: Time, period: Time) -> Self {
        Self::InvalidParameter(anyhow::format_err!(
            "slice {slice} outside [{SLICE_MIN}, {period}]"
        ))
    }
}
