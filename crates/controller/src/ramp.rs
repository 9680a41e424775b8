//! Ramp phases and the safe shutdown sequence.
//!
//! Every poll tick reads a fresh snapshot, logs it, and runs the interlock
//! evaluator before anything else happens. A hard trip or an operator abort
//! ends the current phase at the next tick boundary; the caller then runs
//! [`RampStateMachine::safe_shutdown`].

use std::time::Duration;

use safety::{evaluate, InterlockConfig, InterlockState, SensorSnapshot, TripCause};
use tracing::{debug, error, info, warn};

use crate::config::{ChamberConfig, CycleConfig, RampConfig, SupplyConfig, Timing};
use crate::context::ControlContext;
use crate::error::ActuatorError;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Phase {
    Idle,
    RampingDown { target: f64 },
    RampingUp { target: f64 },
    /// Excursion nested inside a ramp-down, away from the dewpoint.
    MiniRampUp { target: f64 },
    SafeShutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RampOutcome {
    Completed,
    Tripped(TripCause),
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Event {
    Entered(Phase),
    PreCool(Duration),
    Tripped(TripCause),
}

enum Tick {
    Go(SensorSnapshot),
    Stop(RampOutcome),
}

macro_rules! tick {
    ($self:ident, $ctx:expr, $level:expr) => {
        match $self.tick($ctx, $level)? {
            Tick::Go(snapshot) => snapshot,
            Tick::Stop(outcome) => return Ok(outcome.into()),
        }
    };
}

pub struct RampStateMachine {
    ramp: RampConfig,
    interlock_cfg: InterlockConfig,
    timing: Timing,
    supplies: SupplyConfig,
    bounds: (f64, f64),
    interlock: InterlockState,
    stack: Vec<Phase>,
    events: Vec<Event>,
    shutdown_done: bool,
}

impl RampStateMachine {
    pub fn new(chamber: &ChamberConfig, cycle: &CycleConfig) -> Self {
        Self {
            ramp: chamber.ramp,
            interlock_cfg: chamber.interlock,
            timing: chamber.timing,
            supplies: chamber.supplies,
            bounds: cycle.target_bounds(chamber.ramp.hold_temp_c, chamber.interlock.excursion_c),
            interlock: InterlockState::default(),
            stack: Vec::new(),
            events: Vec::new(),
            shutdown_done: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.stack.last().copied().unwrap_or(Phase::Idle)
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn interlock(&self) -> &InterlockState {
        &self.interlock
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown_done
    }

    fn enter(&mut self, phase: Phase) {
        warn!(?phase, "entering phase");
        self.stack.push(phase);
        self.events.push(Event::Entered(phase));
    }

    fn leave(&mut self) {
        if let Some(phase) = self.stack.pop() {
            info!(?phase, "phase finished");
        }
    }

    fn tick(&mut self, ctx: &mut ControlContext, level: &mut f64) -> Result<Tick, ActuatorError> {
        if let Some(cause) = self.interlock.cause {
            return Ok(Tick::Stop(RampOutcome::Tripped(cause)));
        }
        if ctx.cancel.is_requested() {
            warn!("operator abort requested");
            return Ok(Tick::Stop(RampOutcome::Cancelled));
        }

        let snapshot = ctx.reader.read()?;
        ctx.log_tick(&snapshot)?;
        let verdict = evaluate(
            &self.interlock_cfg,
            &mut self.interlock,
            &snapshot,
            level,
            &mut ctx.actuators,
        )?;
        *level = level.clamp(self.bounds.0, self.bounds.1);
        debug!(ntc = snapshot.ntc_avg(), level = *level, "poll");

        match verdict {
            Some(cause) => {
                self.events.push(Event::Tripped(cause));
                Ok(Tick::Stop(RampOutcome::Tripped(cause)))
            }
            None => Ok(Tick::Go(snapshot)),
        }
    }

    /// Wait out `total` in poll-sized slices, ticking after each one.
    fn pause(
        &mut self,
        ctx: &mut ControlContext,
        total: Duration,
        level: &mut f64,
    ) -> Result<Option<RampOutcome>, ActuatorError> {
        let poll = self.timing.poll_interval();
        let slice = if poll.is_zero() { total } else { poll };
        let mut left = total;
        while !left.is_zero() {
            let d = left.min(slice);
            ctx.sleep(d);
            left -= d;
            tick!(self, ctx, level);
        }
        Ok(None)
    }

    /// Climb in fine steps from `from` to `to`, holding each level until the
    /// NTC average reaches it.
    fn climb(
        &mut self,
        ctx: &mut ControlContext,
        from: f64,
        to: f64,
    ) -> Result<Option<RampOutcome>, ActuatorError> {
        let mut level = from;
        while level < to {
            level = (level + self.ramp.fine_step_c).min(to);
            loop {
                let snapshot = tick!(self, ctx, &mut level);
                level = level.min(to);
                if snapshot.ntc_avg() >= level - self.ramp.up_tolerance_c {
                    break;
                }
                ctx.sleep(self.timing.poll_interval());
            }
        }
        Ok(None)
    }

    pub fn ramp_down(
        &mut self,
        ctx: &mut ControlContext,
        from_c: f64,
        target_c: f64,
    ) -> Result<RampOutcome, ActuatorError> {
        self.enter(Phase::RampingDown { target: target_c });
        let res = self.run_ramp_down(ctx, from_c, target_c);
        self.leave();
        res
    }

    fn run_ramp_down(
        &mut self,
        ctx: &mut ControlContext,
        from_c: f64,
        target_c: f64,
    ) -> Result<RampOutcome, ActuatorError> {
        ctx.actuators.set_base_temperature(target_c)?;
        let mut level = from_c.clamp(self.bounds.0, self.bounds.1);

        let snapshot = tick!(self, ctx, &mut level);
        let pause = if target_c < self.ramp.long_precool_below_c {
            Some(self.timing.long_precool())
        } else if snapshot.ntc_avg() - target_c > self.ramp.short_precool_gap_c {
            Some(self.timing.short_precool())
        } else {
            None
        };
        if let Some(pause) = pause {
            warn!(?pause, "pausing to let the chiller start cooling");
            self.events.push(Event::PreCool(pause));
            if let Some(outcome) = self.pause(ctx, pause, &mut level)? {
                return Ok(outcome);
            }
        }

        ctx.actuators.set_all_peltiers(true)?;
        while level > target_c {
            let step = if level - target_c > self.ramp.coarse_step_c {
                self.ramp.coarse_step_c
            } else {
                self.ramp.fine_step_c
            };
            level = (level - step).max(target_c);
            info!(level, "ramp down level");
            ctx.actuators.set_all_peltier_temperatures(level)?;

            loop {
                let snapshot = tick!(self, ctx, &mut level);
                if self.interlock.mini_ramp_up {
                    if let Some(outcome) = self.mini_ramp_up(ctx, level, target_c)? {
                        return Ok(outcome);
                    }
                    continue;
                }
                if snapshot.ntc_avg() <= level + self.ramp.down_tolerance_c {
                    break;
                }
                ctx.sleep(self.timing.poll_interval());
            }
        }

        ctx.actuators.set_all_peltiers(false)?;
        Ok(RampOutcome::Completed)
    }

    /// Back off from the dewpoint: climb to `level` (already raised by the
    /// evaluator) with the Peltiers off, then hand back to the ramp-down.
    fn mini_ramp_up(
        &mut self,
        ctx: &mut ControlContext,
        level: f64,
        resume_base_c: f64,
    ) -> Result<Option<RampOutcome>, ActuatorError> {
        assert!(
            self.stack.len() == 1 && matches!(self.stack[0], Phase::RampingDown { .. }),
            "mini ramp-up only nests directly inside a ramp-down, stack: {:?}",
            self.stack
        );
        self.enter(Phase::MiniRampUp { target: level });
        let res = self.run_mini_ramp_up(ctx, level, resume_base_c);
        self.leave();
        res
    }

    fn run_mini_ramp_up(
        &mut self,
        ctx: &mut ControlContext,
        level: f64,
        resume_base_c: f64,
    ) -> Result<Option<RampOutcome>, ActuatorError> {
        ctx.actuators.set_all_peltiers(false)?;
        ctx.actuators.set_base_temperature(level)?;
        if let Some(outcome) = self.climb(ctx, level - self.interlock_cfg.excursion_c, level)? {
            return Ok(Some(outcome));
        }
        self.interlock.mini_ramp_up = false;
        ctx.actuators.set_base_temperature(resume_base_c)?;
        ctx.actuators.set_all_peltiers(true)?;
        ctx.actuators.set_all_peltier_temperatures(level)?;
        Ok(None)
    }

    pub fn ramp_up(
        &mut self,
        ctx: &mut ControlContext,
        from_c: f64,
        target_c: f64,
    ) -> Result<RampOutcome, ActuatorError> {
        if from_c > target_c {
            return Ok(RampOutcome::Completed);
        }
        self.enter(Phase::RampingUp { target: target_c });
        let res = self.run_ramp_up(ctx, from_c, target_c);
        self.leave();
        res
    }

    fn run_ramp_up(
        &mut self,
        ctx: &mut ControlContext,
        from_c: f64,
        target_c: f64,
    ) -> Result<RampOutcome, ActuatorError> {
        ctx.actuators.peltiers_off()?;
        ctx.actuators
            .set_base_temperature(self.ramp.ramp_up_base(target_c))?;
        let outcome = self.climb(ctx, from_c, target_c)?;
        self.interlock.mini_ramp_up = false;
        Ok(outcome.unwrap_or(RampOutcome::Completed))
    }

    /// Park the chamber: base on at the holding temperature, high voltage
    /// swept to zero and off, Peltier supplies zeroed, stages and low
    /// voltage off, then the operator alert.
    ///
    /// Runs once per machine; later calls do nothing. Every step is tried
    /// even if an earlier one fails, and the first failure is returned.
    pub fn safe_shutdown(
        &mut self,
        ctx: &mut ControlContext,
        cause: &str,
    ) -> Result<(), ActuatorError> {
        if self.shutdown_done {
            debug!(cause, "safe shutdown already done");
            return Ok(());
        }
        self.shutdown_done = true;
        self.stack.clear();
        self.enter(Phase::SafeShutdown);
        error!(cause, "safe shutdown");

        let mut first = None;
        let mut keep = |step: &str, res: Result<(), ActuatorError>| {
            if let Err(e) = res {
                error!(%e, "safe shutdown: {step} failed");
                if first.is_none() {
                    first = Some(e);
                }
            }
        };
        keep("base on", ctx.actuators.set_base_running(true));
        keep(
            "base to holding temperature",
            ctx.actuators.set_base_temperature(self.ramp.hold_temp_c),
        );
        keep(
            "high voltage sweep",
            ctx.sweep_high_voltage_to_zero(self.supplies.hv_sweep_step_v),
        );
        keep("high voltage off", ctx.actuators.high_voltage_off());
        keep("peltier supplies", ctx.actuators.zero_all_peltier_supplies());
        keep("peltiers off", ctx.actuators.set_all_peltiers(false));
        keep("low voltage off", ctx.actuators.set_all_low_voltage_off());

        ctx.raise_alert(cause);
        ctx.flush();
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
