use std::time::Duration;

/// A duration of simulated time.
///
/// Internally this is just a [`Duration`]; the newtype keeps simulated
/// durations from being mixed up with wall-clock ones.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimulationTime(Duration);

impl SimulationTime {
    pub const ZERO: Self = Self(Duration::ZERO);
    pub const NANOSECOND: Self = Self(Duration::from_nanos(1));
    pub const MICROSECOND: Self = Self(Duration::from_micros(1));
    pub const MILLISECOND: Self = Self(Duration::from_millis(1));
    pub const SECOND: Self = Self(Duration::from_secs(1));

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(Duration::from_nanos(nanos))
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self(Duration::from_micros(micros))
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_nanos(&self) -> u128 {
        self.0.as_nanos()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl From<Duration> for SimulationTime {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl From<SimulationTime> for Duration {
    fn from(t: SimulationTime) -> Self {
        t.0
    }
}

impl std::ops::Add for SimulationTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl std::ops::Sub for SimulationTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl std::ops::Mul<u32> for SimulationTime {
    type Output = Self;

    fn mul(self, rhs: u32) -> Self {
        Self(self.0 * rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic() {
        let a = SimulationTime::from_secs(2);
        let b = SimulationTime::SECOND;
        assert_eq!(a + b, SimulationTime::from_secs(3));
        assert_eq!(a - b, SimulationTime::SECOND);
        assert_eq!(b * 5, SimulationTime::from_secs(5));
        assert_eq!(b.saturating_sub(a), SimulationTime::ZERO);
    }
}
