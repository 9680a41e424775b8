//! Workspace root crate.
//!
//! Re-exports the interlock, the control core and the simulated chamber so
//! integration tests can depend on a single crate.

pub use controller::*;
pub use safety::*;
pub use sim::*;
