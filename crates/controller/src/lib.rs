//! Ramp control for the thermal cycling chamber.
//!
//! The scheduler owns a [`ControlContext`] holding every instrument handle,
//! the clock, the cancel token and the log sink. All waits go through the
//! [`Clock`] so a simulated chamber can run a full cycle in virtual time.

pub mod actuator;
pub mod alert;
pub mod cancel;
pub mod config;
pub mod context;
pub mod cycle;
pub mod deadline;
pub mod error;
pub mod instrument;
pub mod ramp;
pub mod reader;
pub mod retry;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use actuator::{ActuatorController, Actuators, HvStep, PowerReadouts};
pub use alert::{alert_text, Alert, LogAlert};
pub use cancel::{CancelLevel, CancelToken};
pub use config::{ChamberConfig, CycleConfig, LowVoltage, RampConfig, SupplyConfig, Timing};
pub use context::{ControlContext, Instruments};
pub use cycle::{CycleScheduler, RunOutcome, RunReport, OPERATOR_ABORT};
pub use deadline::Deadline;
pub use error::{ActuatorError, ConfigError, ControlError, InstrumentError};
pub use instrument::{
    BaseController, Clock, InstrumentResult, PeltierStage, PowerSupply, RelayChannel, Sensor,
    SystemClock,
};
pub use ramp::{Event, Phase, RampOutcome, RampStateMachine};
pub use reader::{SensorBank, SnapshotReader};
pub use retry::RetryPolicy;
pub use telemetry::{CsvLog, Fanout, JsonlTrace, MemorySink, TickRecord, TickSink, CSV_HEADER};
