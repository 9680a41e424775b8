use safety::TripCause;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{ChamberConfig, CycleConfig};
use crate::context::ControlContext;
use crate::error::{ActuatorError, ConfigError, ControlError};
use crate::ramp::{RampOutcome, RampStateMachine};

pub const OPERATOR_ABORT: &str = "Operator abort";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    Completed,
    Tripped(TripCause),
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub cycles_completed: u32,
    pub outcome: RunOutcome,
}

/// Runs the configured number of cycles, each a ramp down to the minimum
/// and back up to the maximum. The last cycle returns to the holding
/// temperature, down or up from the maximum, and switches the base off.
pub struct CycleScheduler {
    cycle: CycleConfig,
    chamber: ChamberConfig,
    ctx: ControlContext,
    ramp: RampStateMachine,
}

impl CycleScheduler {
    /// Fails before any instrument is touched if the tuning is invalid.
    pub fn new(
        cycle: CycleConfig,
        chamber: ChamberConfig,
        ctx: ControlContext,
    ) -> Result<Self, ConfigError> {
        chamber.validate()?;
        let ramp = RampStateMachine::new(&chamber, &cycle);
        Ok(Self {
            cycle,
            chamber,
            ctx,
            ramp,
        })
    }

    pub fn ramp(&self) -> &RampStateMachine {
        &self.ramp
    }

    pub fn context(&self) -> &ControlContext {
        &self.ctx
    }

    /// Park the chamber outside a run. A no-op once any shutdown has run.
    pub fn safe_shutdown(&mut self, cause: &str) -> Result<(), ActuatorError> {
        self.ramp.safe_shutdown(&mut self.ctx, cause)
    }

    /// Run to completion, trip or abort. Every ending other than normal
    /// completion goes through safe shutdown. An actuator failure is
    /// returned after the shutdown attempt.
    pub fn run(&mut self) -> Result<RunReport, ControlError> {
        let mut completed = 0;
        let result = self.run_cycles(&mut completed);

        let (cause, outcome) = match result {
            Ok(RampOutcome::Completed) => {
                info!(cycles = completed, "run complete");
                return Ok(RunReport {
                    cycles_completed: completed,
                    outcome: RunOutcome::Completed,
                });
            }
            Ok(RampOutcome::Tripped(cause)) => (cause.to_string(), RunOutcome::Tripped(cause)),
            Ok(RampOutcome::Cancelled) => (OPERATOR_ABORT.to_string(), RunOutcome::Aborted),
            Err(e) => {
                let cause = format!("Actuator failure: {e}");
                if let Err(shutdown) = self.ramp.safe_shutdown(&mut self.ctx, &cause) {
                    error!(%shutdown, "safe shutdown incomplete");
                }
                return Err(e.into());
            }
        };

        self.ramp.safe_shutdown(&mut self.ctx, &cause)?;
        Ok(RunReport {
            cycles_completed: completed,
            outcome,
        })
    }

    fn run_cycles(&mut self, completed: &mut u32) -> Result<RampOutcome, ActuatorError> {
        let hold = self.chamber.ramp.hold_temp_c;
        let (min, max) = (self.cycle.min_temp_c(), self.cycle.max_temp_c());
        let count = self.cycle.cycle_count();
        warn!(
            "Doing {count} cycles from {min}°C to {max}°C with modules {:?}",
            self.cycle.modules()
        );

        self.ctx.actuators.set_base_running(true)?;
        let lv = self.chamber.supplies.module_lv;
        if let Some(lv) = lv {
            for stage in 0..self.ctx.actuators.low_voltage_count() {
                self.ctx
                    .actuators
                    .set_low_voltage(stage, lv.volts, lv.amps, true)?;
            }
        }

        let mut temp = hold;
        for n in 1..=count {
            warn!("Cycle {n}");
            let out = self.ramp.ramp_down(&mut self.ctx, temp, min)?;
            if out != RampOutcome::Completed {
                return Ok(out);
            }
            temp = min;

            let out = self.ramp.ramp_up(&mut self.ctx, temp, max)?;
            if out != RampOutcome::Completed {
                return Ok(out);
            }
            temp = max;

            if n == count {
                // a maximum below the holding temperature climbs back up
                let out = if temp >= hold {
                    self.ramp.ramp_down(&mut self.ctx, temp, hold)?
                } else {
                    self.ramp.ramp_up(&mut self.ctx, temp, hold)?
                };
                if out != RampOutcome::Completed {
                    return Ok(out);
                }
            }
            *completed = n;
        }

        self.ctx.actuators.set_base_running(false)?;
        if lv.is_some() {
            self.ctx.actuators.set_all_low_voltage_off()?;
        }
        Ok(RampOutcome::Completed)
    }
}
