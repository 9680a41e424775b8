//! Simulated thermal chamber.
//!
//! A lumped thermal model of the chiller base and each module, wired to
//! instrument channels that implement the controller's capability traits.
//! Time is virtual: the [`SimClock`] steps the model whenever the control
//! loop sleeps, so a full cycle runs in well under a second.

mod chamber;
mod channels;
mod clock;
mod model;
mod probe;
mod scenario;

pub use chamber::SimChamber;
pub use channels::{Ambient, SupplyRole};
pub use clock::SimClock;
pub use model::{
    lock, ChamberModel, Disturbance, JournalEntry, Module, PlantParams, SharedModel, SupplyState,
    Trigger,
};
pub use probe::{Probe, ProbeFault};
pub use scenario::{humidity_for_dewpoint, Scenario};
