use std::time::Duration;

use crate::core::support::simulation_time::SimulationTime;

/// An instant in simulated time, measured from the simulation's start.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EmulatedTime(Duration);

impl EmulatedTime {
    /// The instant the simulation began.
    pub const SIMULATION_START: Self = Self(Duration::ZERO);

    /// Duration since the start of the simulation.
    pub fn duration_since_start(&self) -> SimulationTime {
        SimulationTime::from(self.0)
    }

    pub fn duration_since(&self, earlier: &Self) -> SimulationTime {
        SimulationTime::from(self.0 - earlier.0)
    }

    pub fn saturating_duration_since(&self, earlier: &Self) -> SimulationTime {
        SimulationTime::from(self.0.saturating_sub(earlier.0))
    }
}

impl std::ops::Add<SimulationTime> for EmulatedTime {
    type Output = Self;

    fn add(self, rhs: SimulationTime) -> Self {
        Self(self.0 + Duration::from(rhs))
    }
}

impl std::ops::Sub<EmulatedTime> for EmulatedTime {
    type Output = SimulationTime;

    fn sub(self, rhs: EmulatedTime) -> SimulationTime {
        SimulationTime::from(self.0 - rhs.0)
    }
}
