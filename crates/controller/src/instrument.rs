//! Capabilities the control core needs from the instrument layer.
//!
//! Drivers own the wire protocol. Every method takes `&mut self`, so a call
//! holds exclusive access to its channel for its whole duration.

use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use safety::RelayStatus;

use crate::error::InstrumentError;

pub type InstrumentResult<T> = Result<T, InstrumentError>;

/// Any channel that yields one scalar reading.
pub trait Sensor: Send {
    fn read(&mut self) -> InstrumentResult<f64>;
}

pub trait RelayChannel: Send {
    fn status(&mut self) -> InstrumentResult<RelayStatus>;
}

/// Temperature-controlled Peltier stage (driven by its own PID loop).
pub trait PeltierStage: Send {
    fn set_enabled(&mut self, on: bool) -> InstrumentResult<()>;
    fn enabled(&mut self) -> InstrumentResult<bool>;
    fn set_setpoint(&mut self, temp_c: f64) -> InstrumentResult<()>;
    fn setpoint(&mut self) -> InstrumentResult<f64>;
}

/// One output channel of a power supply. Used for the module low-voltage
/// supplies, the Peltier supplies and the sensor high-voltage supply.
pub trait PowerSupply: Send {
    fn set_voltage(&mut self, volts: f64) -> InstrumentResult<()>;
    /// Programmed voltage, not the measured one.
    fn voltage(&mut self) -> InstrumentResult<f64>;
    fn set_current(&mut self, amps: f64) -> InstrumentResult<()>;
    fn current(&mut self) -> InstrumentResult<f64>;
    fn set_output(&mut self, on: bool) -> InstrumentResult<()>;
    fn output(&mut self) -> InstrumentResult<bool>;
    fn measure_voltage(&mut self) -> InstrumentResult<f64>;
    fn measure_current(&mut self) -> InstrumentResult<f64>;
}

/// The chiller that sets the chamber base temperature.
pub trait BaseController: Send {
    fn set_setpoint(&mut self, temp_c: f64) -> InstrumentResult<()>;
    fn setpoint(&mut self) -> InstrumentResult<f64>;
    fn set_running(&mut self, on: bool) -> InstrumentResult<()>;
    fn running(&mut self) -> InstrumentResult<bool>;
}

/// Source of time for every wait in the control loop.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}
