use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::dewpoint::is_unconstrained;
use crate::snapshot::SensorSnapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TripCause {
    OverTemperature,
    Dewpoint,
    OpenLid,
    HardwareInterlock,
}

impl fmt::Display for TripCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TripCause::OverTemperature => "Temperature",
            TripCause::Dewpoint => "Dewpoint",
            TripCause::OpenLid => "Open Lid",
            TripCause::HardwareInterlock => "HW Interlock",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterlockConfig {
    /// Any NTC above this is a hard trip.
    pub trip_temp_c: f64,
    /// Any NTC above this turns the Peltier stages off without tripping.
    pub derate_temp_c: f64,
    pub dewpoint_hard_margin_c: f64,
    pub dewpoint_soft_margin_c: f64,
    /// How far the working target moves up when the soft margin is crossed.
    pub excursion_c: f64,
    pub lid_min_voltage: f64,
    pub settle_s: f64,
}

impl Default for InterlockConfig {
    fn default() -> Self {
        Self {
            trip_temp_c: 70.0,
            derate_temp_c: 65.0,
            dewpoint_hard_margin_c: 2.0,
            dewpoint_soft_margin_c: 5.0,
            excursion_c: 5.0,
            lid_min_voltage: 4.0,
            settle_s: 2.0,
        }
    }
}

impl InterlockConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_secs_f64(self.settle_s.max(0.0))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InterlockState {
    pub tripped: bool,
    pub cause: Option<TripCause>,
    /// Set while a dewpoint excursion is pending or running.
    pub mini_ramp_up: bool,
}

impl InterlockState {
    fn latch(&mut self, cause: TripCause) {
        self.tripped = true;
        self.cause = Some(cause);
    }
}

/// What the evaluator needs from the actuators to shed Peltier load inline.
pub trait LoadShed {
    type Error;

    fn any_peltier_on(&mut self) -> Result<bool, Self::Error>;
    fn all_peltiers_off(&mut self) -> Result<(), Self::Error>;
    fn settle(&mut self, delay: Duration);
}

/// Evaluate the interlock conditions for one tick.
///
/// Checks run in severity order and the first hard trip returns. The 65 °C
/// de-rate and the dewpoint excursion do not trip; the excursion raises
/// `target` by `excursion_c` and sets `mini_ramp_up`. Once tripped the state
/// stays latched and later calls return the latched cause without touching
/// the actuators.
pub fn evaluate<L: LoadShed>(
    cfg: &InterlockConfig,
    state: &mut InterlockState,
    snapshot: &SensorSnapshot,
    target: &mut f64,
    shed: &mut L,
) -> Result<Option<TripCause>, L::Error> {
    if state.tripped {
        return Ok(state.cause);
    }

    let ntcs = &snapshot.ntc_temps;

    if ntcs.iter().any(|&t| t > cfg.trip_temp_c) {
        error!("interlock: NTC above {} °C", cfg.trip_temp_c);
        state.latch(TripCause::OverTemperature);
        shed.all_peltiers_off()?;
        return Ok(state.cause);
    }

    if ntcs.iter().any(|&t| t > cfg.derate_temp_c) && shed.any_peltier_on()? {
        shed.all_peltiers_off()?;
        warn!("peltiers turned off: NTC above {} °C", cfg.derate_temp_c);
    }

    let dewpoint = snapshot.dewpoint();
    if !is_unconstrained(dewpoint) {
        let chucks = &snapshot.chuck_temps;
        if chucks
            .iter()
            .any(|&c| dewpoint > c - cfg.dewpoint_hard_margin_c)
        {
            error!(
                dewpoint,
                "interlock: chuck within {} °C of dewpoint", cfg.dewpoint_hard_margin_c
            );
            state.latch(TripCause::Dewpoint);
            return Ok(state.cause);
        } else if chucks
            .iter()
            .any(|&c| dewpoint > c - cfg.dewpoint_soft_margin_c)
            && !state.mini_ramp_up
        {
            *target += cfg.excursion_c;
            state.mini_ramp_up = true;
            warn!(
                dewpoint,
                working_target = *target,
                "target raised: chuck within {} °C of dewpoint", cfg.dewpoint_soft_margin_c
            );
        }
    }

    if snapshot.lid_voltage < cfg.lid_min_voltage {
        state.latch(TripCause::OpenLid);
        shed.all_peltiers_off()?;
        shed.settle(cfg.settle());
        error!(
            lid_voltage = snapshot.lid_voltage,
            "interlock: lid voltage below {} V", cfg.lid_min_voltage
        );
        return Ok(state.cause);
    }

    if snapshot.any_relay_tripped() {
        state.latch(TripCause::HardwareInterlock);
        shed.settle(cfg.settle());
        shed.all_peltiers_off()?;
        shed.settle(cfg.settle());
        error!("hardware interlock relay tripped");
        return Ok(state.cause);
    }

    Ok(None)
}
