//! Wall-clock deadline for driver calls.
//!
//! Each channel is moved onto its own worker thread and every call is handed
//! over as a job. The control loop waits at most the call timeout for the
//! answer. A driver that hangs keeps its worker blocked, so later calls to
//! the same channel time out as well until it comes back.

use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use safety::RelayStatus;
use tracing::error;

use crate::actuator::Actuators;
use crate::error::InstrumentError;
use crate::instrument::{
    BaseController, InstrumentResult, PeltierStage, PowerSupply, RelayChannel, Sensor,
};
use crate::reader::SensorBank;

pub struct Deadline<D: ?Sized> {
    name: String,
    jobs: Sender<Box<dyn FnOnce(&mut D) + Send>>,
    timeout: Duration,
}

impl<D: ?Sized + Send + 'static> Deadline<D> {
    pub fn spawn(name: impl Into<String>, mut dev: Box<D>, timeout: Duration) -> io::Result<Self> {
        let name = name.into();
        let (jobs, rx) = mpsc::channel::<Box<dyn FnOnce(&mut D) + Send>>();
        thread::Builder::new()
            .name(format!("io {name}"))
            .spawn(move || {
                for job in rx {
                    job(&mut *dev);
                }
            })?;
        Ok(Self {
            name,
            jobs,
            timeout,
        })
    }

    fn call<T, F>(&self, f: F) -> InstrumentResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut D) -> InstrumentResult<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let job: Box<dyn FnOnce(&mut D) + Send> = Box::new(move |dev: &mut D| {
            let _ = tx.send(f(dev));
        });
        self.jobs.send(job).map_err(|_| self.stopped())?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                error!(channel = %self.name, timeout = ?self.timeout, "driver call did not return");
                Err(InstrumentError::Timeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.stopped()),
        }
    }

    fn stopped(&self) -> InstrumentError {
        InstrumentError::Io(format!("{} worker stopped", self.name))
    }
}

impl Sensor for Deadline<dyn Sensor> {
    fn read(&mut self) -> InstrumentResult<f64> {
        self.call(|d| d.read())
    }
}

impl RelayChannel for Deadline<dyn RelayChannel> {
    fn status(&mut self) -> InstrumentResult<RelayStatus> {
        self.call(|d| d.status())
    }
}

impl PeltierStage for Deadline<dyn PeltierStage> {
    fn set_enabled(&mut self, on: bool) -> InstrumentResult<()> {
        self.call(move |d| d.set_enabled(on))
    }

    fn enabled(&mut self) -> InstrumentResult<bool> {
        self.call(|d| d.enabled())
    }

    fn set_setpoint(&mut self, temp_c: f64) -> InstrumentResult<()> {
        self.call(move |d| d.set_setpoint(temp_c))
    }

    fn setpoint(&mut self) -> InstrumentResult<f64> {
        self.call(|d| d.setpoint())
    }
}

impl PowerSupply for Deadline<dyn PowerSupply> {
    fn set_voltage(&mut self, volts: f64) -> InstrumentResult<()> {
        self.call(move |d| d.set_voltage(volts))
    }

    fn voltage(&mut self) -> InstrumentResult<f64> {
        self.call(|d| d.voltage())
    }

    fn set_current(&mut self, amps: f64) -> InstrumentResult<()> {
        self.call(move |d| d.set_current(amps))
    }

    fn current(&mut self) -> InstrumentResult<f64> {
        self.call(|d| d.current())
    }

    fn set_output(&mut self, on: bool) -> InstrumentResult<()> {
        self.call(move |d| d.set_output(on))
    }

    fn output(&mut self) -> InstrumentResult<bool> {
        self.call(|d| d.output())
    }

    fn measure_voltage(&mut self) -> InstrumentResult<f64> {
        self.call(|d| d.measure_voltage())
    }

    fn measure_current(&mut self) -> InstrumentResult<f64> {
        self.call(|d| d.measure_current())
    }
}

impl BaseController for Deadline<dyn BaseController> {
    fn set_setpoint(&mut self, temp_c: f64) -> InstrumentResult<()> {
        self.call(move |d| d.set_setpoint(temp_c))
    }

    fn setpoint(&mut self) -> InstrumentResult<f64> {
        self.call(|d| d.setpoint())
    }

    fn set_running(&mut self, on: bool) -> InstrumentResult<()> {
        self.call(move |d| d.set_running(on))
    }

    fn running(&mut self) -> InstrumentResult<bool> {
        self.call(|d| d.running())
    }
}

fn sensor(name: String, dev: Box<dyn Sensor>, t: Duration) -> io::Result<Box<dyn Sensor>> {
    Ok(Box::new(Deadline::spawn(name, dev, t)?))
}

fn sensors(kind: &str, devs: Vec<Box<dyn Sensor>>, t: Duration) -> io::Result<Vec<Box<dyn Sensor>>> {
    devs.into_iter()
        .enumerate()
        .map(|(i, dev)| sensor(format!("{kind} {i}"), dev, t))
        .collect()
}

fn supplies(
    kind: &str,
    devs: Vec<Box<dyn PowerSupply>>,
    t: Duration,
) -> io::Result<Vec<Box<dyn PowerSupply>>> {
    devs.into_iter()
        .enumerate()
        .map(|(i, dev)| {
            let guarded: Box<dyn PowerSupply> =
                Box::new(Deadline::spawn(format!("{kind} {i}"), dev, t)?);
            Ok(guarded)
        })
        .collect()
}

impl SensorBank {
    /// Put every channel behind a wall-clock deadline of `timeout` per call.
    pub fn with_deadline(self, timeout: Duration) -> io::Result<Self> {
        let relays = self
            .relays
            .into_iter()
            .enumerate()
            .map(|(i, dev)| {
                let guarded: Box<dyn RelayChannel> =
                    Box::new(Deadline::spawn(format!("relay {i}"), dev, timeout)?);
                Ok(guarded)
            })
            .collect::<io::Result<_>>()?;
        Ok(Self {
            ntcs: sensors("ntc", self.ntcs, timeout)?,
            chucks: sensors("chuck", self.chucks, timeout)?,
            humidity: sensor("humidity".into(), self.humidity, timeout)?,
            peltier_back: sensor("peltier back".into(), self.peltier_back, timeout)?,
            lid: sensor("lid".into(), self.lid, timeout)?,
            relays,
        })
    }
}

impl Actuators {
    /// Put every output behind a wall-clock deadline of `timeout` per call.
    pub fn with_deadline(self, timeout: Duration) -> io::Result<Self> {
        let peltiers = self
            .peltiers
            .into_iter()
            .enumerate()
            .map(|(i, dev)| {
                let guarded: Box<dyn PeltierStage> =
                    Box::new(Deadline::spawn(format!("peltier {i}"), dev, timeout)?);
                Ok(guarded)
            })
            .collect::<io::Result<_>>()?;
        Ok(Self {
            peltiers,
            peltier_supplies: supplies("peltier supply", self.peltier_supplies, timeout)?,
            low_voltage: supplies("lv", self.low_voltage, timeout)?,
            high_voltage: supplies("hv", self.high_voltage, timeout)?,
            base: Box::new(Deadline::spawn("base", self.base, timeout)?),
        })
    }
}
