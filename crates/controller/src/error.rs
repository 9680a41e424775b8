use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure reported by a single instrument call.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum InstrumentError {
    #[error("sensor read failed: {0}")]
    SensorRead(String),
    #[error("instrument I/O failed: {0}")]
    Io(String),
    #[error("call took longer than {0:?}")]
    Timeout(Duration),
    #[error("read back {actual} after writing {expected}")]
    Readback { expected: String, actual: String },
}

/// An instrument operation that could not be completed within the retry
/// budget. Fatal to the run.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ActuatorError {
    #[error("{what}: gave up after {attempts} attempts")]
    Exhausted {
        what: String,
        attempts: u32,
        #[source]
        last: InstrumentError,
    },
    #[error("{what}: abandoned for immediate shutdown")]
    Aborted { what: String },
    #[error("no {kind} channel {index}")]
    NoChannel { kind: &'static str, index: usize },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("temperatures must be finite (min {min}, max {max})")]
    NonFinite { min: f64, max: f64 },
    #[error("max temperature {max} °C must be above min temperature {min} °C")]
    TemperatureRange { min: f64, max: f64 },
    #[error("cycle count must be positive")]
    CycleCount,
    #[error("module {0} is not one of 1, 2, 3, 4")]
    Module(u8),
    #[error("{field} must be {rule}, got {value}")]
    Invalid {
        field: &'static str,
        rule: &'static str,
        value: f64,
    },
    #[error("read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Actuator(#[from] ActuatorError),
    #[error("starting instrument worker")]
    Worker(#[from] std::io::Error),
}
