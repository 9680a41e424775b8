//! Confirmed writes to every actuator in the chamber.
//!
//! Each write is followed by a short settle and a read back; a mismatch or a
//! driver error goes through the retry policy. Whatever is left after the
//! retry budget surfaces as an [`ActuatorError`].

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use safety::LoadShed;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::config::{ChamberConfig, Timing};
use crate::error::{ActuatorError, InstrumentError};
use crate::instrument::{BaseController, Clock, InstrumentResult, PeltierStage, PowerSupply};
use crate::retry::RetryPolicy;

/// Every writable instrument, grouped by role.
pub struct Actuators {
    pub peltiers: Vec<Box<dyn PeltierStage>>,
    pub peltier_supplies: Vec<Box<dyn PowerSupply>>,
    /// One per selected module.
    pub low_voltage: Vec<Box<dyn PowerSupply>>,
    pub high_voltage: Vec<Box<dyn PowerSupply>>,
    pub base: Box<dyn BaseController>,
}

/// Measured supply values for the tick log. Each field is the mean over all
/// channels of that kind; a high-voltage channel that is off reads zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerReadouts {
    pub lv_voltage: f64,
    pub lv_current: f64,
    pub pelt_voltage: f64,
    pub pelt_current: f64,
    pub hv_voltage: f64,
    pub hv_current: f64,
}

/// One step of a high-voltage sweep, handed to the sampling hook.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HvStep {
    pub channel: usize,
    pub setpoint_v: f64,
    pub measured_v: f64,
    pub measured_i: f64,
}

trait Readback: Copy + Display {
    fn matches(self, actual: Self) -> bool;
}

impl Readback for bool {
    fn matches(self, actual: Self) -> bool {
        self == actual
    }
}

impl Readback for f64 {
    fn matches(self, actual: Self) -> bool {
        (self - actual).abs() <= 1e-6 * self.abs().max(1.0)
    }
}

/// Retry and timing context shared by every instrument call.
struct Link {
    policy: RetryPolicy,
    timing: Timing,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
}

impl Link {
    fn write<D: ?Sized, T: Readback>(
        &self,
        what: &str,
        dev: &mut D,
        value: T,
        write: impl Fn(&mut D, T) -> InstrumentResult<()>,
        read: impl Fn(&mut D) -> InstrumentResult<T>,
    ) -> Result<(), ActuatorError> {
        self.policy
            .run(self.clock.as_ref(), &self.cancel, what, || {
                write(&mut *dev, value)?;
                self.clock.sleep(self.timing.short_delay());
                let actual = read(&mut *dev)?;
                if value.matches(actual) {
                    Ok(())
                } else {
                    Err(InstrumentError::Readback {
                        expected: value.to_string(),
                        actual: actual.to_string(),
                    })
                }
            })
    }

    fn read<D: ?Sized, T>(
        &self,
        what: &str,
        dev: &mut D,
        read: impl Fn(&mut D) -> InstrumentResult<T>,
    ) -> Result<T, ActuatorError> {
        self.policy
            .run(self.clock.as_ref(), &self.cancel, what, || read(&mut *dev))
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn channel<'a, T: ?Sized>(
    list: &'a mut [Box<T>],
    kind: &'static str,
    index: usize,
) -> Result<&'a mut T, ActuatorError> {
    list.get_mut(index)
        .map(|b| b.as_mut())
        .ok_or(ActuatorError::NoChannel { kind, index })
}

pub struct ActuatorController {
    hw: Actuators,
    link: Link,
    hv_zero_threshold_v: f64,
    /// Last confirmed state per Peltier stage; `None` until known.
    peltier_on: Vec<Option<bool>>,
}

impl ActuatorController {
    pub fn new(
        hw: Actuators,
        cfg: &ChamberConfig,
        clock: Arc<dyn Clock>,
        cancel: CancelToken,
    ) -> Self {
        let peltier_on = vec![None; hw.peltiers.len()];
        Self {
            hw,
            link: Link {
                policy: cfg.retry,
                timing: cfg.timing,
                clock,
                cancel,
            },
            hv_zero_threshold_v: cfg.supplies.hv_zero_threshold_v,
            peltier_on,
        }
    }

    pub fn stage_count(&self) -> usize {
        self.hw.peltiers.len()
    }

    pub fn low_voltage_count(&self) -> usize {
        self.hw.low_voltage.len()
    }

    /// True unless every stage is known to be off.
    pub fn peltiers_may_be_on(&self) -> bool {
        self.peltier_on.iter().any(|s| *s != Some(false))
    }

    pub fn set_peltier_state(&mut self, stage: usize, on: bool) -> Result<(), ActuatorError> {
        let dev = channel(&mut self.hw.peltiers, "peltier", stage)?;
        // Stage controllers drop commands that arrive back to back.
        self.link.clock.sleep(self.link.timing.long_delay());
        let res = self.link.write(
            &format!("peltier {stage} state"),
            dev,
            on,
            |d, on| d.set_enabled(on),
            |d| d.enabled(),
        );
        self.peltier_on[stage] = res.as_ref().ok().map(|_| on);
        res?;
        debug!(stage, on, "peltier state");
        Ok(())
    }

    pub fn set_all_peltiers(&mut self, on: bool) -> Result<(), ActuatorError> {
        for stage in 0..self.stage_count() {
            self.set_peltier_state(stage, on)?;
        }
        info!("peltiers {}", if on { "on" } else { "off" });
        Ok(())
    }

    /// Turn the stages off unless they are all known to be off already.
    pub fn peltiers_off(&mut self) -> Result<(), ActuatorError> {
        if self.peltiers_may_be_on() {
            self.set_all_peltiers(false)?;
        }
        Ok(())
    }

    /// Query every stage and refresh the tracked state.
    pub fn read_peltier_states(&mut self) -> Result<Vec<bool>, ActuatorError> {
        let mut states = Vec::with_capacity(self.stage_count());
        for (stage, dev) in self.hw.peltiers.iter_mut().enumerate() {
            let on = self
                .link
                .read(&format!("peltier {stage} state"), dev.as_mut(), |d| d.enabled())?;
            self.peltier_on[stage] = Some(on);
            states.push(on);
        }
        Ok(states)
    }

    pub fn set_peltier_temperature(
        &mut self,
        stage: usize,
        temp_c: f64,
    ) -> Result<(), ActuatorError> {
        let dev = channel(&mut self.hw.peltiers, "peltier", stage)?;
        self.link.clock.sleep(self.link.timing.long_delay());
        self.link.write(
            &format!("peltier {stage} setpoint"),
            dev,
            temp_c,
            |d, t| d.set_setpoint(t),
            |d| d.setpoint(),
        )
    }

    pub fn set_all_peltier_temperatures(&mut self, temp_c: f64) -> Result<(), ActuatorError> {
        for stage in 0..self.stage_count() {
            self.set_peltier_temperature(stage, temp_c)?;
        }
        debug!(temp_c, "peltier setpoints");
        Ok(())
    }

    pub fn set_base_temperature(&mut self, temp_c: f64) -> Result<(), ActuatorError> {
        self.link.write(
            "base setpoint",
            self.hw.base.as_mut(),
            temp_c,
            |d, t| d.set_setpoint(t),
            |d| d.setpoint(),
        )?;
        info!(temp_c, "base setpoint");
        Ok(())
    }

    pub fn set_base_running(&mut self, on: bool) -> Result<(), ActuatorError> {
        self.link.write(
            "base running",
            self.hw.base.as_mut(),
            on,
            |d, on| d.set_running(on),
            |d| d.running(),
        )?;
        info!(on, "base running");
        Ok(())
    }

    pub fn set_low_voltage(
        &mut self,
        stage: usize,
        volts: f64,
        amps: f64,
        on: bool,
    ) -> Result<(), ActuatorError> {
        let dev = channel(&mut self.hw.low_voltage, "low-voltage", stage)?;
        if on {
            self.link.write(
                &format!("lv {stage} voltage"),
                &mut *dev,
                volts,
                |d, v| d.set_voltage(v),
                |d| d.voltage(),
            )?;
            self.link.write(
                &format!("lv {stage} current"),
                &mut *dev,
                amps,
                |d, a| d.set_current(a),
                |d| d.current(),
            )?;
        }
        self.link.write(
            &format!("lv {stage} output"),
            dev,
            on,
            |d, on| d.set_output(on),
            |d| d.output(),
        )?;
        info!(stage, volts, amps, on, "low voltage");
        Ok(())
    }

    pub fn set_all_low_voltage_off(&mut self) -> Result<(), ActuatorError> {
        for stage in 0..self.low_voltage_count() {
            self.set_low_voltage(stage, 0.0, 0.0, false)?;
        }
        Ok(())
    }

    /// Zero the current limit of one Peltier supply and switch it off.
    pub fn zero_peltier_supply(&mut self, index: usize) -> Result<(), ActuatorError> {
        let dev = channel(&mut self.hw.peltier_supplies, "peltier supply", index)?;
        self.link.write(
            &format!("peltier supply {index} current"),
            &mut *dev,
            0.0,
            |d, a| d.set_current(a),
            |d| d.current(),
        )?;
        self.link.write(
            &format!("peltier supply {index} output"),
            dev,
            false,
            |d, on| d.set_output(on),
            |d| d.output(),
        )
    }

    pub fn zero_all_peltier_supplies(&mut self) -> Result<(), ActuatorError> {
        for index in 0..self.hw.peltier_supplies.len() {
            self.zero_peltier_supply(index)?;
        }
        Ok(())
    }

    /// Step every live high-voltage channel to `target_v`.
    ///
    /// Channels that are off, or already within the zero threshold of the
    /// target, are left alone. `hook` sees every step after it is confirmed.
    pub fn sweep_high_voltage(
        &mut self,
        target_v: f64,
        step_v: f64,
        hook: &mut dyn FnMut(HvStep),
    ) -> Result<(), ActuatorError> {
        for (ch, dev) in self.hw.high_voltage.iter_mut().enumerate() {
            let dev = dev.as_mut();
            let on = self
                .link
                .read(&format!("hv {ch} output"), &mut *dev, |d| d.output())?;
            let mut v = self
                .link
                .read(&format!("hv {ch} voltage"), &mut *dev, |d| d.voltage())?;
            if !on || (v - target_v).abs() <= self.hv_zero_threshold_v {
                continue;
            }

            info!(channel = ch, from = v, to = target_v, "sweeping high voltage");
            let step = if step_v.abs() > 0.0 {
                step_v.abs()
            } else {
                (target_v - v).abs()
            };
            while v != target_v {
                let gap = target_v - v;
                let next = if gap.abs() <= step {
                    target_v
                } else {
                    v + step * gap.signum()
                };
                self.link.write(
                    &format!("hv {ch} voltage"),
                    &mut *dev,
                    next,
                    |d, v| d.set_voltage(v),
                    |d| d.voltage(),
                )?;
                let measured_v = self
                    .link
                    .read(&format!("hv {ch} measure"), &mut *dev, |d| d.measure_voltage())?;
                let measured_i = self
                    .link
                    .read(&format!("hv {ch} measure"), &mut *dev, |d| d.measure_current())?;
                hook(HvStep {
                    channel: ch,
                    setpoint_v: next,
                    measured_v,
                    measured_i,
                });
                v = next;
            }
        }
        Ok(())
    }

    pub fn set_high_voltage_output(&mut self, channel_idx: usize, on: bool) -> Result<(), ActuatorError> {
        let dev = channel(&mut self.hw.high_voltage, "high-voltage", channel_idx)?;
        self.link.write(
            &format!("hv {channel_idx} output"),
            dev,
            on,
            |d, on| d.set_output(on),
            |d| d.output(),
        )
    }

    pub fn high_voltage_off(&mut self) -> Result<(), ActuatorError> {
        for ch in 0..self.hw.high_voltage.len() {
            self.set_high_voltage_output(ch, false)?;
        }
        Ok(())
    }

    pub fn readouts(&mut self) -> Result<PowerReadouts, ActuatorError> {
        let link = &self.link;
        let measure = |list: &mut [Box<dyn PowerSupply>], kind: &str, gate: bool| {
            let mut volts = Vec::with_capacity(list.len());
            let mut amps = Vec::with_capacity(list.len());
            for (i, dev) in list.iter_mut().enumerate() {
                let dev = dev.as_mut();
                if gate && !link.read(&format!("{kind} {i} output"), &mut *dev, |d| d.output())? {
                    volts.push(0.0);
                    amps.push(0.0);
                    continue;
                }
                volts.push(link.read(&format!("{kind} {i} measure"), &mut *dev, |d| {
                    d.measure_voltage()
                })?);
                amps.push(link.read(&format!("{kind} {i} measure"), &mut *dev, |d| {
                    d.measure_current()
                })?);
            }
            Ok::<_, ActuatorError>((mean(&volts), mean(&amps)))
        };

        let (lv_voltage, lv_current) = measure(&mut self.hw.low_voltage, "lv", false)?;
        let (pelt_voltage, pelt_current) =
            measure(&mut self.hw.peltier_supplies, "peltier supply", false)?;
        let (hv_voltage, hv_current) = measure(&mut self.hw.high_voltage, "hv", true)?;
        Ok(PowerReadouts {
            lv_voltage,
            lv_current,
            pelt_voltage,
            pelt_current,
            hv_voltage,
            hv_current,
        })
    }
}

impl LoadShed for ActuatorController {
    type Error = ActuatorError;

    fn any_peltier_on(&mut self) -> Result<bool, ActuatorError> {
        Ok(self.read_peltier_states()?.contains(&true))
    }

    fn all_peltiers_off(&mut self) -> Result<(), ActuatorError> {
        self.set_all_peltiers(false)
    }

    fn settle(&mut self, delay: Duration) {
        self.link.clock.sleep(delay);
    }
}
