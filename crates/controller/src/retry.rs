use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::{ActuatorError, InstrumentError};
use crate::instrument::Clock;

/// Bounded retry for instrument calls.
///
/// A failed call is retried `max_retries` times. Before retry `n` (0-based)
/// the policy waits `backoff_base_s + n * backoff_step_s`, so the defaults
/// wait 10 s, 11 s and 12 s. A call that returns after more than
/// `call_timeout_s` on the control clock counts as failed; the wall-clock
/// bound on a call that never returns comes from [`crate::Deadline`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_s: f64,
    pub backoff_step_s: f64,
    pub call_timeout_s: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_s: 10.0,
            backoff_step_s: 1.0,
            call_timeout_s: 10.0,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, retry: u32) -> Duration {
        let s = self.backoff_base_s + self.backoff_step_s * f64::from(retry);
        Duration::from_secs_f64(s.max(0.0))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.call_timeout_s.max(0.0))
    }

    pub fn run<T>(
        &self,
        clock: &dyn Clock,
        cancel: &CancelToken,
        what: &str,
        mut op: impl FnMut() -> Result<T, InstrumentError>,
    ) -> Result<T, ActuatorError> {
        let timeout = self.call_timeout();
        let mut retry = 0;
        loop {
            let started = clock.now();
            let result = op().and_then(|value| {
                let elapsed = (clock.now() - started).to_std().unwrap_or_default();
                if elapsed > timeout {
                    Err(InstrumentError::Timeout(timeout))
                } else {
                    Ok(value)
                }
            });

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if retry >= self.max_retries {
                return Err(ActuatorError::Exhausted {
                    what: what.to_string(),
                    attempts: retry + 1,
                    last: err,
                });
            }
            if cancel.is_immediate() {
                return Err(ActuatorError::Aborted {
                    what: what.to_string(),
                });
            }

            let wait = self.backoff(retry);
            warn!(%err, ?wait, "{what} failed, retrying");
            clock.sleep(wait);
            retry += 1;
        }
    }
}
