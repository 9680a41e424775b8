use std::sync::{Arc, Mutex};

use chrono::Utc;
use controller::{
    Actuators, BaseController, Instruments, PeltierStage, PowerSupply, RelayChannel, SensorBank,
    Sensor,
};

use crate::channels::{
    Ambient, AmbientChannel, ChuckChannel, NtcChannel, SimBase, SimPeltier, SimRelay, SimSupply,
    SupplyRole,
};
use crate::clock::SimClock;
use crate::model::{lock, ChamberModel, Disturbance, JournalEntry, PlantParams, SharedModel, Trigger};

/// A simulated chamber with one channel set per selected module.
#[derive(Clone)]
pub struct SimChamber {
    model: SharedModel,
    modules: usize,
}

impl SimChamber {
    pub fn new(modules: impl IntoIterator<Item = u8>, params: PlantParams, seed: u64) -> Self {
        let ids: Vec<u8> = modules.into_iter().collect();
        Self {
            modules: ids.len(),
            model: Arc::new(Mutex::new(ChamberModel::new(&ids, params, seed))),
        }
    }

    pub fn model(&self) -> SharedModel {
        self.model.clone()
    }

    pub fn clock(&self) -> SimClock {
        SimClock::new(self.model.clone(), Utc::now())
    }

    pub fn instruments(&self) -> Instruments {
        let model = &self.model;
        let n = self.modules;

        let sensor = |kind| -> Box<dyn Sensor> {
            Box::new(AmbientChannel {
                model: model.clone(),
                kind,
            })
        };
        let supply = |role| -> Box<dyn PowerSupply> {
            Box::new(SimSupply {
                model: model.clone(),
                role,
            })
        };

        let sensors = SensorBank {
            ntcs: (0..n)
                .map(|module| {
                    Box::new(NtcChannel {
                        model: model.clone(),
                        module,
                    }) as Box<dyn Sensor>
                })
                .collect(),
            chucks: (0..n)
                .map(|module| {
                    Box::new(ChuckChannel {
                        model: model.clone(),
                        module,
                    }) as Box<dyn Sensor>
                })
                .collect(),
            humidity: sensor(Ambient::Humidity),
            peltier_back: sensor(Ambient::PeltierBack),
            lid: sensor(Ambient::Lid),
            relays: (0..n)
                .map(|index| {
                    Box::new(SimRelay {
                        model: model.clone(),
                        index,
                    }) as Box<dyn RelayChannel>
                })
                .collect(),
        };

        let actuators = Actuators {
            peltiers: (0..n)
                .map(|module| {
                    Box::new(SimPeltier {
                        model: model.clone(),
                        module,
                    }) as Box<dyn PeltierStage>
                })
                .collect(),
            peltier_supplies: vec![supply(SupplyRole::Peltier)],
            low_voltage: (0..n).map(|i| supply(SupplyRole::LowVoltage(i))).collect(),
            high_voltage: vec![supply(SupplyRole::HighVoltage)],
            base: Box::new(SimBase {
                model: model.clone(),
            }) as Box<dyn BaseController>,
        };

        Instruments { sensors, actuators }
    }

    pub fn schedule(&self, trigger: Trigger, disturbance: Disturbance) {
        lock(&self.model).schedule(trigger, disturbance);
    }

    pub fn fail_next_writes(&self, n: u32) {
        lock(&self.model).fail_next_writes(n);
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        lock(&self.model).journal().to_vec()
    }

    pub fn inspect<T>(&self, f: impl FnOnce(&ChamberModel) -> T) -> T {
        f(&lock(&self.model))
    }
}
