//! In-memory instruments for unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use safety::RelayStatus;

use crate::alert::Alert;
use crate::error::InstrumentError;
use crate::instrument::{
    BaseController, Clock, InstrumentResult, PeltierStage, PowerSupply, RelayChannel, Sensor,
};

pub struct ManualClock {
    start: DateTime<Utc>,
    elapsed: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            elapsed: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = *self.elapsed.lock().unwrap();
        self.start + chrono::Duration::from_std(elapsed).unwrap()
    }

    fn sleep(&self, duration: Duration) {
        *self.elapsed.lock().unwrap() += duration;
        self.sleeps.lock().unwrap().push(duration);
    }
}

/// Shared write log so a test can see every command in order.
pub type Journal = Arc<Mutex<Vec<String>>>;

fn take_failure(failures: &Arc<Mutex<u32>>) -> InstrumentResult<()> {
    let mut n = failures.lock().unwrap();
    if *n > 0 {
        *n -= 1;
        return Err(InstrumentError::Io("injected".into()));
    }
    Ok(())
}

pub struct FixedSensor(pub f64);

impl Sensor for FixedSensor {
    fn read(&mut self) -> InstrumentResult<f64> {
        Ok(self.0)
    }
}

/// Fails the first `n` reads.
pub struct FlakySensor {
    pub value: f64,
    pub failures: u32,
}

impl Sensor for FlakySensor {
    fn read(&mut self) -> InstrumentResult<f64> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(InstrumentError::SensorRead("dropout".into()));
        }
        Ok(self.value)
    }
}

/// Reads whatever a mirroring fake last wrote into the cell.
pub struct SharedSensor(pub Arc<Mutex<f64>>);

impl Sensor for SharedSensor {
    fn read(&mut self) -> InstrumentResult<f64> {
        Ok(*self.0.lock().unwrap())
    }
}

pub struct FixedRelay(pub RelayStatus);

impl RelayChannel for FixedRelay {
    fn status(&mut self) -> InstrumentResult<RelayStatus> {
        Ok(self.0)
    }
}

pub struct FakePeltier {
    pub id: usize,
    pub enabled: bool,
    pub setpoint: f64,
    pub journal: Journal,
    pub failures: Arc<Mutex<u32>>,
    /// When set, writes are acknowledged but never take effect.
    pub ignore_writes: bool,
    /// Setpoints are copied here, as if the module reached them at once.
    pub mirror: Option<Arc<Mutex<f64>>>,
}

impl FakePeltier {
    pub fn new(id: usize, journal: &Journal, failures: &Arc<Mutex<u32>>) -> Self {
        Self {
            id,
            enabled: false,
            setpoint: 20.0,
            journal: journal.clone(),
            failures: failures.clone(),
            ignore_writes: false,
            mirror: None,
        }
    }

    pub fn mirroring(mut self, cell: &Arc<Mutex<f64>>) -> Self {
        self.mirror = Some(cell.clone());
        self
    }
}

impl PeltierStage for FakePeltier {
    fn set_enabled(&mut self, on: bool) -> InstrumentResult<()> {
        take_failure(&self.failures)?;
        self.journal
            .lock()
            .unwrap()
            .push(format!("peltier{} enabled={on}", self.id));
        if !self.ignore_writes {
            self.enabled = on;
        }
        Ok(())
    }

    fn enabled(&mut self) -> InstrumentResult<bool> {
        Ok(self.enabled)
    }

    fn set_setpoint(&mut self, temp_c: f64) -> InstrumentResult<()> {
        take_failure(&self.failures)?;
        self.journal
            .lock()
            .unwrap()
            .push(format!("peltier{} setpoint={temp_c}", self.id));
        self.setpoint = temp_c;
        if let Some(cell) = &self.mirror {
            *cell.lock().unwrap() = temp_c;
        }
        Ok(())
    }

    fn setpoint(&mut self) -> InstrumentResult<f64> {
        Ok(self.setpoint)
    }
}

pub struct FakeSupply {
    pub name: String,
    pub voltage: f64,
    pub current: f64,
    pub output: bool,
    pub journal: Journal,
    pub failures: Arc<Mutex<u32>>,
}

impl FakeSupply {
    pub fn new(name: &str, journal: &Journal, failures: &Arc<Mutex<u32>>) -> Self {
        Self {
            name: name.to_string(),
            voltage: 0.0,
            current: 0.0,
            output: false,
            journal: journal.clone(),
            failures: failures.clone(),
        }
    }

    pub fn on_at(mut self, volts: f64) -> Self {
        self.output = true;
        self.voltage = volts;
        self
    }
}

impl PowerSupply for FakeSupply {
    fn set_voltage(&mut self, volts: f64) -> InstrumentResult<()> {
        take_failure(&self.failures)?;
        self.journal
            .lock()
            .unwrap()
            .push(format!("{} voltage={volts}", self.name));
        self.voltage = volts;
        Ok(())
    }

    fn voltage(&mut self) -> InstrumentResult<f64> {
        Ok(self.voltage)
    }

    fn set_current(&mut self, amps: f64) -> InstrumentResult<()> {
        take_failure(&self.failures)?;
        self.journal
            .lock()
            .unwrap()
            .push(format!("{} current={amps}", self.name));
        self.current = amps;
        Ok(())
    }

    fn current(&mut self) -> InstrumentResult<f64> {
        Ok(self.current)
    }

    fn set_output(&mut self, on: bool) -> InstrumentResult<()> {
        take_failure(&self.failures)?;
        self.journal
            .lock()
            .unwrap()
            .push(format!("{} output={on}", self.name));
        self.output = on;
        Ok(())
    }

    fn output(&mut self) -> InstrumentResult<bool> {
        Ok(self.output)
    }

    fn measure_voltage(&mut self) -> InstrumentResult<f64> {
        Ok(if self.output { self.voltage } else { 0.0 })
    }

    fn measure_current(&mut self) -> InstrumentResult<f64> {
        Ok(if self.output { self.current } else { 0.0 })
    }
}

pub struct FakeBase {
    pub setpoint: f64,
    pub running: bool,
    pub journal: Journal,
    pub mirror: Option<Arc<Mutex<f64>>>,
}

impl FakeBase {
    pub fn new(journal: &Journal) -> Self {
        Self {
            setpoint: 20.0,
            running: false,
            journal: journal.clone(),
            mirror: None,
        }
    }
}

impl BaseController for FakeBase {
    fn set_setpoint(&mut self, temp_c: f64) -> InstrumentResult<()> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("base setpoint={temp_c}"));
        self.setpoint = temp_c;
        if let Some(cell) = &self.mirror {
            *cell.lock().unwrap() = temp_c;
        }
        Ok(())
    }

    fn setpoint(&mut self) -> InstrumentResult<f64> {
        Ok(self.setpoint)
    }

    fn set_running(&mut self, on: bool) -> InstrumentResult<()> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("base running={on}"));
        self.running = on;
        Ok(())
    }

    fn running(&mut self) -> InstrumentResult<bool> {
        Ok(self.running)
    }
}

#[derive(Clone, Default)]
pub struct RecordingAlert(pub Arc<Mutex<Vec<String>>>);

impl Alert for RecordingAlert {
    fn raise_alert(&mut self, cause: &str) {
        self.0.lock().unwrap().push(cause.to_string());
    }
}
