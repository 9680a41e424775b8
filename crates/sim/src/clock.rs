use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use controller::Clock;

use crate::model::{lock, SharedModel};

const MAX_STEP: Duration = Duration::from_secs(1);

/// Virtual time: sleeping advances the chamber model instead of the wall
/// clock. With a pace set, each step also waits `step / pace` of real time.
pub struct SimClock {
    model: SharedModel,
    start: DateTime<Utc>,
    pace: Option<f64>,
}

impl SimClock {
    pub fn new(model: SharedModel, start: DateTime<Utc>) -> Self {
        Self {
            model,
            start,
            pace: None,
        }
    }

    /// Run `speedup` times faster than real time.
    pub fn paced(mut self, speedup: f64) -> Self {
        self.pace = (speedup > 0.0).then_some(speedup);
        self
    }
}

impl Clock for SimClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = lock(&self.model).elapsed;
        self.start + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }

    fn sleep(&self, duration: Duration) {
        let mut left = duration;
        while !left.is_zero() {
            let step = left.min(MAX_STEP);
            lock(&self.model).step(step);
            if let Some(pace) = self.pace {
                thread::sleep(step.div_f64(pace));
            }
            left -= step;
        }
    }
}
