pub mod prelude {
    pub use super::flags::prelude::*;
    pub use super::vcpuset_serde::prelude::*;
    pub use super::{
        Time,
        DomainId,
        VcpuId,
        PcpuId,
        Utilization,
        NORM_PERIOD,
        MAX_VCPUS,
        PERIOD_MIN,
        PERIOD_MAX,
        SLICE_MIN,
        DEFAULT_PERIOD,
        DEFAULT_SLICE,
        DOM0_PERIOD,
        DOM0_SLICE,
        EXTRA_QUANTUM,
        MIN_QUANTUM,
        MIN_GLOBAL_INTERVAL,
        DISPATCH_SLACK,
    };
}

pub mod flags;
pub mod rational;
pub mod vcpuset_serde;

/// Signed nanosecond time. Budgets (`local_cputime`) legitimately go
/// negative when a VCPU overruns its local slice, so the representation is
/// signed end to end.
#[derive(Clone, Copy)]
#[derive(Debug, Default)]
#[derive(PartialEq, Eq, PartialOrd, Ord)]
pub struct Time {
    pub value_ns: i64
}

#[derive(Clone, Copy)]
#[derive(Debug)]
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct DomainId(pub u32);

#[derive(Clone, Copy)]
#[derive(Debug)]
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct VcpuId(pub u32);

pub type PcpuId = usize;

pub type Utilization = f64;

/// Denominator every reservation is normalized to: a reservation of
/// (period, slice) becomes slice' parts out of 100000.
pub const NORM_PERIOD: u64 = 100_000;

pub const MAX_VCPUS: usize = 128;

pub const PERIOD_MIN: Time = Time::micros(11);
pub const PERIOD_MAX: Time = Time::secs(10);
pub const SLICE_MIN: Time = Time::micros(5);

pub const DEFAULT_PERIOD: Time = Time::millis(1000);
pub const DEFAULT_SLICE: Time = Time::millis(150);

pub const DOM0_PERIOD: Time = Time::millis(1000);
pub const DOM0_SLICE: Time = Time::millis(1000);

/// Quantum handed out while idling on tasklet work.
pub const EXTRA_QUANTUM: Time = Time::micros(200);

/// Floor on any returned quantum, so the dispatcher itself can make
/// forward progress.
pub const MIN_QUANTUM: Time = Time::micros(5);

/// Floor on the length of a global interval.
pub const MIN_GLOBAL_INTERVAL: Time = Time::micros(250);

/// Slack subtracted from computed local slices to absorb dispatch
/// overhead. Tunable.
pub const DISPATCH_SLACK: Time = Time::nanos(500);

// =============================================================================

impl Time {
    const MICRO_TO_NANO: i64 = 1000;
    const MILLI_TO_NANO: i64 = 1000_000;
    const SECS_TO_NANO: i64 = 1000_000_000;

    pub const fn zero() -> Self {
        Self { value_ns: 0 }
    }

    pub const fn nanos(time_ns: i64) -> Self {
        Self { value_ns: time_ns }
    }

    pub const fn micros(time_us: i64) -> Self {
        Self { value_ns: time_us * Self::MICRO_TO_NANO }
    }

    pub const fn millis(time_ms: i64) -> Self {
        Self { value_ns: time_ms * Self::MILLI_TO_NANO }
    }

    pub const fn secs(time_s: i64) -> Self {
        Self { value_ns: time_s * Self::SECS_TO_NANO }
    }

    pub const fn as_nanos(&self) -> i64 {
        self.value_ns
    }

    pub const fn as_micros(&self) -> i64 {
        self.value_ns / Self::MICRO_TO_NANO
    }

    pub const fn as_millis(&self) -> i64 {
        self.value_ns / Self::MILLI_TO_NANO
    }

    pub const fn is_zero(&self) -> bool {
        self.value_ns == 0
    }

    pub const fn is_negative(&self) -> bool {
        self.value_ns < 0
    }

    pub fn min(a: Self, b: Self) -> Self {
        if a <= b { a } else { b }
    }

    pub fn max(a: Self, b: Self) -> Self {
        if a >= b { a } else { b }
    }
}

impl std::ops::Add for Time {
    type Output = Time;

    fn add(self, rhs: Self) -> Self::Output {
        Self::Output { value_ns: (self.value_ns + rhs.value_ns) }
    }
}

impl std::ops::Sub for Time {
    type Output = Time;

    fn sub(self, rhs: Self) -> Self::Output {
        Self::Output { value_ns: (self.value_ns - rhs.value_ns) }
    }
}

impl std::ops::AddAssign for Time {
    fn add_assign(&mut self, rhs: Self) {
        self.value_ns += rhs.value_ns;
    }
}

impl std::ops::SubAssign for Time {
    fn sub_assign(&mut self, rhs: Self) {
        self.value_ns -= rhs.value_ns;
    }
}

impl std::ops::Mul<i64> for Time {
    type Output = Time;

    fn mul(self, rhs: i64) -> Self::Output {
        Self::Output { value_ns: (self.value_ns * rhs) }
    }
}

impl std::ops::Mul<Time> for i64 {
    type Output = Time;

    fn mul(self, rhs: Time) -> Self::Output {
        rhs * self
    }
}

impl std::ops::Div for Time {
    type Output = i64;

    fn div(self, rhs: Self) -> Self::Output {
        self.value_ns / rhs.value_ns
    }
}

impl std::ops::Div<i64> for Time {
    type Output = Time;

    fn div(self, rhs: i64) -> Self::Output {
        Time { value_ns: self.value_ns / rhs }
    }
}

impl std::iter::Sum for Time {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Time::zero(), |acc, val| acc + val)
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ns", self.value_ns)
    }
}

impl serde::Serialize for Time {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer {
        format!("{} ns", self.value_ns).serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Time {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de> {
        let time_string = String::deserialize(deserializer)?;

        let pieces: Vec<_> = time_string.trim().split_whitespace().collect();
        if pieces.len() == 1 {
            let time: i64 = pieces[0].parse()
                .map_err(|err| serde::de::Error::custom(format!("Invalid time: {err}")))?;

            Ok(Time { value_ns: time })
        } else if pieces.len() == 2 {
            let time: i64 = pieces[0].parse()
                .map_err(|err| serde::de::Error::custom(format!("Invalid time: {err}")))?;
            let unit = match pieces[1] {
                "s" => Time::SECS_TO_NANO,
                "ms" => Time::MILLI_TO_NANO,
                "us" => Time::MICRO_TO_NANO,
                "ns" => 1,
                u => { return Err(serde::de::Error::custom(format!("Unknown time unit: {u}"))); }
            };

            Ok(Time { value_ns: time * unit })
        } else {
            return Err(serde::de::Error::custom("Parsing error, unknown format"));
        }
    }
}

impl std::fmt::Display for DomainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for VcpuId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DomainId {
    pub fn is_dom0(&self) -> bool {
        self.0 == 0
    }
}

// =============================================================================

#[test]
fn time_units_round_trip() {
    assert_eq!(Time::micros(11).as_nanos(), 11_000);
    assert_eq!(Time::millis(150).as_micros(), 150_000);
    assert_eq!(Time::secs(10), Time::millis(10_000));
}

#[test]
fn time_signed_arithmetic() {
    let mut budget = Time::micros(5);
    budget -= Time::micros(8);
    assert!(budget.is_negative());
    assert_eq!(budget, Time::micros(-3));
}

#[test]
fn time_parses_unit_suffixes() {
    let t: Time = serde_json::from_str("\"100 ms\"").unwrap();
    assert_eq!(t, Time::millis(100));
    let t: Time = serde_json::from_str("\"250 us\"").unwrap();
    assert_eq!(t, Time::micros(250));
    let t: Time = serde_json::from_str("\"42\"").unwrap();
    assert_eq!(t, Time::nanos(42));
}
