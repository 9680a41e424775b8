use serde::{Deserialize, Serialize};

use crate::dewpoint::dewpoint;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayStatus {
    Ok,
    Trip,
}

/// One polling tick worth of readings. Built fresh every tick and handed
/// straight to the evaluator.
#[derive(Clone, Debug, PartialEq)]
pub struct SensorSnapshot {
    /// Module NTC temperatures, one per selected module (°C).
    pub ntc_temps: Vec<f64>,
    /// Chuck PT100 temperatures, one per selected module (°C).
    pub chuck_temps: Vec<f64>,
    pub humidity_pct: f64,
    /// Peltier back side, the reference temperature for the dewpoint.
    pub peltier_back_temp: f64,
    pub lid_voltage: f64,
    pub relay_status: Vec<RelayStatus>,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

impl SensorSnapshot {
    pub fn ntc_avg(&self) -> f64 {
        mean(&self.ntc_temps)
    }

    pub fn chuck_avg(&self) -> f64 {
        mean(&self.chuck_temps)
    }

    pub fn dewpoint(&self) -> f64 {
        dewpoint(self.humidity_pct, self.peltier_back_temp)
    }

    pub fn any_relay_tripped(&self) -> bool {
        self.relay_status.contains(&RelayStatus::Trip)
    }
}
