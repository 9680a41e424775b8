use std::sync::Arc;
use std::time::Duration;

use safety::SensorSnapshot;
use tracing::{info, warn};

use crate::actuator::{ActuatorController, Actuators, HvStep};
use crate::alert::Alert;
use crate::cancel::CancelToken;
use crate::config::ChamberConfig;
use crate::error::{ActuatorError, ControlError};
use crate::instrument::Clock;
use crate::reader::{SensorBank, SnapshotReader};
use crate::telemetry::{TickRecord, TickSink};

/// Every instrument handle for one run.
pub struct Instruments {
    pub sensors: SensorBank,
    pub actuators: Actuators,
}

/// Everything the control loop touches, owned by the scheduler and passed
/// down by reference.
pub struct ControlContext {
    pub reader: SnapshotReader,
    pub actuators: ActuatorController,
    pub clock: Arc<dyn Clock>,
    pub cancel: CancelToken,
    sink: Box<dyn TickSink>,
    alert: Box<dyn Alert>,
    last: Option<TickRecord>,
}

impl ControlContext {
    /// Every instrument channel is moved onto a worker thread so a driver
    /// call that hangs fails after `retry.call_timeout_s` of wall time.
    pub fn new(
        instruments: Instruments,
        cfg: &ChamberConfig,
        clock: Arc<dyn Clock>,
        cancel: CancelToken,
        sink: Box<dyn TickSink>,
        alert: Box<dyn Alert>,
    ) -> Result<Self, ControlError> {
        let timeout = cfg.retry.call_timeout();
        let reader = SnapshotReader::new(
            instruments.sensors.with_deadline(timeout)?,
            cfg.retry,
            clock.clone(),
            cancel.clone(),
        );
        let actuators = ActuatorController::new(
            instruments.actuators.with_deadline(timeout)?,
            cfg,
            clock.clone(),
            cancel.clone(),
        );
        Ok(Self {
            reader,
            actuators,
            clock,
            cancel,
            sink,
            alert,
            last: None,
        })
    }

    pub fn sleep(&self, duration: Duration) {
        self.clock.sleep(duration);
    }

    /// Read the supplies and write one record for `snapshot`.
    pub fn log_tick(&mut self, snapshot: &SensorSnapshot) -> Result<(), ActuatorError> {
        let power = self.actuators.readouts()?;
        let rec = TickRecord::new(self.clock.now(), snapshot, &power);
        info!(
            ntc = rec.ntc_avg,
            chuck = rec.chuck_avg,
            humidity = rec.humidity_pct,
            dewpoint = rec.dewpoint_c,
            "tick"
        );
        if let Err(e) = self.sink.record(&rec) {
            warn!(%e, "tick log write failed");
        }
        self.last = Some(rec);
        Ok(())
    }

    pub fn last_record(&self) -> Option<&TickRecord> {
        self.last.as_ref()
    }

    /// Step the high voltage to zero, logging a record per step.
    pub fn sweep_high_voltage_to_zero(&mut self, step_v: f64) -> Result<(), ActuatorError> {
        let Self {
            actuators,
            clock,
            sink,
            last,
            ..
        } = self;
        actuators.sweep_high_voltage(0.0, step_v, &mut |step: HvStep| {
            info!(
                channel = step.channel,
                setpoint = step.setpoint_v,
                measured = step.measured_v,
                "hv sweep"
            );
            if let Some(prev) = last.as_ref() {
                let rec = TickRecord {
                    time: clock.now(),
                    hv_voltage: step.measured_v,
                    hv_current: step.measured_i,
                    ..prev.clone()
                };
                if let Err(e) = sink.record(&rec) {
                    warn!(%e, "tick log write failed");
                }
            }
        })
    }

    pub fn raise_alert(&mut self, cause: &str) {
        self.alert.raise_alert(cause);
    }

    pub fn flush(&mut self) {
        if let Err(e) = self.sink.flush() {
            warn!(%e, "tick log flush failed");
        }
    }
}
