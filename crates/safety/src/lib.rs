//! Interlock logic for the thermal chamber: dewpoint, per-tick sensor
//! snapshot and the interlock evaluator. No I/O happens here; load shedding
//! goes through the [`LoadShed`] trait.

mod dewpoint;
mod interlock;
mod snapshot;

pub use dewpoint::{dewpoint, is_unconstrained, DEWPOINT_UNCONSTRAINED};
pub use interlock::{evaluate, InterlockConfig, InterlockState, LoadShed, TripCause};
pub use snapshot::{RelayStatus, SensorSnapshot};
