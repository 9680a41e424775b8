use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::chamber::SimChamber;
use crate::model::{Disturbance, Trigger};
use crate::probe::ProbeFault;

/// Canned disturbance sets for demos and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Scenario {
    #[default]
    Nominal,
    /// Module 1 starts heating itself once the ramp up passes 30 °C.
    Runaway,
    /// Humidity creeps up once the modules are below -10 °C.
    HumidityLeak,
    OpenLid,
    RelayTrip,
    NtcDropout,
    /// Module 1's NTC sticks at 80 °C.
    NtcStuck,
}

impl Scenario {
    pub const ALL: [Scenario; 7] = [
        Scenario::Nominal,
        Scenario::Runaway,
        Scenario::HumidityLeak,
        Scenario::OpenLid,
        Scenario::RelayTrip,
        Scenario::NtcDropout,
        Scenario::NtcStuck,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Scenario::Nominal => "nominal",
            Scenario::Runaway => "runaway",
            Scenario::HumidityLeak => "humidity-leak",
            Scenario::OpenLid => "open-lid",
            Scenario::RelayTrip => "relay-trip",
            Scenario::NtcDropout => "ntc-dropout",
            Scenario::NtcStuck => "ntc-stuck",
        }
    }

    pub fn apply(self, chamber: &SimChamber) {
        let minutes = |m: u64| Duration::from_secs(m * 60);
        match self {
            Scenario::Nominal => {}
            Scenario::Runaway => chamber.schedule(
                Trigger::NtcAbove(30.0),
                Disturbance::SelfHeat {
                    module: 0,
                    c_per_s: 2.0,
                },
            ),
            Scenario::HumidityLeak => chamber.schedule(
                Trigger::NtcBelow(-10.0),
                Disturbance::HumidityRamp { pct_per_s: 0.02 },
            ),
            Scenario::OpenLid => chamber.schedule(Trigger::At(minutes(20)), Disturbance::OpenLid),
            Scenario::RelayTrip => {
                chamber.schedule(Trigger::At(minutes(20)), Disturbance::TripRelay(0))
            }
            Scenario::NtcDropout => chamber.schedule(
                Trigger::At(Duration::ZERO),
                Disturbance::ProbeFault {
                    module: 0,
                    fault: ProbeFault::DropoutEvery { n: 9 },
                },
            ),
            Scenario::NtcStuck => chamber.schedule(
                Trigger::At(minutes(15)),
                Disturbance::ProbeFault {
                    module: 0,
                    fault: ProbeFault::Stuck { value: 80.0 },
                },
            ),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scenario::ALL
            .into_iter()
            .find(|sc| sc.name() == s)
            .ok_or_else(|| {
                let names: Vec<_> = Scenario::ALL.iter().map(|sc| sc.name()).collect();
                format!("unknown scenario {s:?}, expected one of {}", names.join(", "))
            })
    }
}

/// Relative humidity (%) at which air at `temp_c` has the given dewpoint.
pub fn humidity_for_dewpoint(dewpoint_c: f64, temp_c: f64) -> f64 {
    const A: f64 = 17.625;
    const B: f64 = 243.04;
    let gamma = A * dewpoint_c / (B + dewpoint_c) - A * temp_c / (B + temp_c);
    100.0 * gamma.exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_back() {
        for sc in Scenario::ALL {
            assert_eq!(sc.name().parse::<Scenario>(), Ok(sc));
        }
        assert!("meltdown".parse::<Scenario>().is_err());
    }

    #[test]
    fn humidity_inverts_dewpoint() {
        let h = humidity_for_dewpoint(-23.0, 20.0);
        assert!((safety::dewpoint(h, 20.0) + 23.0).abs() < 1e-9);
        assert!((humidity_for_dewpoint(20.0, 20.0) - 100.0).abs() < 1e-9);
    }
}
