use std::sync::Arc;

use safety::{RelayStatus, SensorSnapshot};

use crate::cancel::CancelToken;
use crate::error::ActuatorError;
use crate::instrument::{Clock, RelayChannel, Sensor};
use crate::retry::RetryPolicy;

/// Every read-only channel the interlock looks at.
pub struct SensorBank {
    /// One NTC per selected module.
    pub ntcs: Vec<Box<dyn Sensor>>,
    /// One chuck PT100 per selected module.
    pub chucks: Vec<Box<dyn Sensor>>,
    pub humidity: Box<dyn Sensor>,
    pub peltier_back: Box<dyn Sensor>,
    pub lid: Box<dyn Sensor>,
    pub relays: Vec<Box<dyn RelayChannel>>,
}

/// Builds a fresh [`SensorSnapshot`] every tick.
///
/// A read that keeps failing past the retry budget is reported the same way
/// as a failed actuator write.
pub struct SnapshotReader {
    bank: SensorBank,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
}

impl SnapshotReader {
    pub fn new(
        bank: SensorBank,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            bank,
            policy,
            clock,
            cancel,
        }
    }

    pub fn read(&mut self) -> Result<SensorSnapshot, ActuatorError> {
        let policy = self.policy;
        let clock = self.clock.clone();
        let cancel = self.cancel.clone();
        let bank = &mut self.bank;
        let run = |what: &str, sensor: &mut dyn Sensor| {
            policy.run(&*clock, &cancel, what, || sensor.read())
        };

        let mut ntc_temps = Vec::with_capacity(bank.ntcs.len());
        for (i, s) in bank.ntcs.iter_mut().enumerate() {
            ntc_temps.push(run(&format!("ntc {i}"), s.as_mut())?);
        }
        let mut chuck_temps = Vec::with_capacity(bank.chucks.len());
        for (i, s) in bank.chucks.iter_mut().enumerate() {
            chuck_temps.push(run(&format!("chuck {i}"), s.as_mut())?);
        }
        let humidity_pct = run("humidity", bank.humidity.as_mut())?;
        let peltier_back_temp = run("peltier back", bank.peltier_back.as_mut())?;
        let lid_voltage = run("lid", bank.lid.as_mut())?;

        let mut relay_status = Vec::with_capacity(bank.relays.len());
        for (i, r) in bank.relays.iter_mut().enumerate() {
            let status: RelayStatus =
                policy.run(&*clock, &cancel, &format!("relay {i}"), || r.status())?;
            relay_status.push(status);
        }

        Ok(SensorSnapshot {
            ntc_temps,
            chuck_temps,
            humidity_pct,
            peltier_back_temp,
            lid_voltage,
            relay_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FixedRelay, FixedSensor, FlakySensor, ManualClock};

    fn bank(ntc_failures: u32) -> SensorBank {
        SensorBank {
            ntcs: vec![
                Box::new(FixedSensor(21.0)) as Box<dyn Sensor>,
                Box::new(FlakySensor {
                    value: 23.0,
                    failures: ntc_failures,
                }),
            ],
            chucks: vec![
                Box::new(FixedSensor(19.5)) as Box<dyn Sensor>,
                Box::new(FixedSensor(20.5)),
            ],
            humidity: Box::new(FixedSensor(0.1)),
            peltier_back: Box::new(FixedSensor(22.0)),
            lid: Box::new(FixedSensor(5.0)),
            relays: vec![
                Box::new(FixedRelay(RelayStatus::Ok)) as Box<dyn RelayChannel>,
                Box::new(FixedRelay(RelayStatus::Trip)),
            ],
        }
    }

    fn reader(bank: SensorBank, clock: Arc<ManualClock>) -> SnapshotReader {
        SnapshotReader::new(bank, RetryPolicy::default(), clock, CancelToken::new())
    }

    #[test]
    fn collects_every_channel() {
        let clock = Arc::new(ManualClock::new());
        let snap = reader(bank(0), clock.clone()).read().unwrap();
        assert_eq!(snap.ntc_temps, vec![21.0, 23.0]);
        assert_eq!(snap.ntc_avg(), 22.0);
        assert_eq!(snap.chuck_avg(), 20.0);
        assert_eq!(snap.humidity_pct, 0.1);
        assert_eq!(snap.peltier_back_temp, 22.0);
        assert_eq!(snap.lid_voltage, 5.0);
        assert!(snap.any_relay_tripped());
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn dropout_is_retried() {
        let clock = Arc::new(ManualClock::new());
        let snap = reader(bank(1), clock.clone()).read().unwrap();
        assert_eq!(snap.ntc_temps[1], 23.0);
        assert_eq!(clock.sleeps().len(), 1);
    }

    #[test]
    fn persistent_dropout_escalates() {
        let clock = Arc::new(ManualClock::new());
        let err = reader(bank(10), clock).read().unwrap_err();
        match err {
            ActuatorError::Exhausted { what, attempts, .. } => {
                assert_eq!(what, "ntc 1");
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
