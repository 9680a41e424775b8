use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use safety::RelayStatus;
use serde::{Deserialize, Serialize};

use crate::probe::{Probe, ProbeFault};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlantParams {
    pub ambient_c: f64,
    /// How fast the chiller moves the base toward its setpoint.
    pub base_rate_c_per_s: f64,
    /// Module pull toward an enabled Peltier setpoint, per second.
    pub peltier_gain: f64,
    /// A Peltier can hold its module at most this far from the base.
    pub peltier_reach_c: f64,
    pub base_coupling: f64,
    pub ambient_coupling: f64,
    pub chuck_offset_c: f64,
    pub humidity_pct: f64,
    pub lid_closed_v: f64,
    /// Sensor bias applied to the high-voltage supply at start.
    pub initial_hv_v: f64,
    pub hv_leakage_a_per_v: f64,
    pub noise_std: f64,
}

impl Default for PlantParams {
    fn default() -> Self {
        Self {
            ambient_c: 20.0,
            base_rate_c_per_s: 0.05,
            peltier_gain: 0.02,
            peltier_reach_c: 40.0,
            base_coupling: 0.004,
            ambient_coupling: 0.0001,
            chuck_offset_c: 0.5,
            humidity_pct: 0.1,
            lid_closed_v: 5.0,
            initial_hv_v: -100.0,
            hv_leakage_a_per_v: 1e-9,
            noise_std: 0.05,
        }
    }
}

/// When a scheduled disturbance fires.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Trigger {
    At(Duration),
    /// Mean module temperature drops below the value.
    NtcBelow(f64),
    NtcAbove(f64),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Disturbance {
    OpenLid,
    TripRelay(usize),
    SetHumidity(f64),
    /// Raise humidity for a while, then restore the previous value.
    HumidityPulse { pct: f64, hold: Duration },
    HumidityRamp { pct_per_s: f64 },
    /// Extra heating on one module, °C per second.
    SelfHeat { module: usize, c_per_s: f64 },
    ProbeFault { module: usize, fault: ProbeFault },
}

#[derive(Clone, Debug, PartialEq)]
pub struct JournalEntry {
    pub at: Duration,
    pub what: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SupplyState {
    pub voltage: f64,
    pub current_limit: f64,
    pub output: bool,
}

#[derive(Clone, Debug)]
pub struct Module {
    pub id: u8,
    pub temp_c: f64,
    pub peltier_on: bool,
    pub peltier_setpoint_c: f64,
    pub self_heat_c_per_s: f64,
    probe: Probe,
}

#[derive(Clone, Copy, Debug)]
struct Pulse {
    until: Duration,
    restore_pct: f64,
}

/// Thermal state of the whole chamber plus every supply and switch.
#[derive(Debug)]
pub struct ChamberModel {
    pub params: PlantParams,
    pub elapsed: Duration,
    pub base_temp_c: f64,
    pub base_setpoint_c: f64,
    pub base_running: bool,
    pub modules: Vec<Module>,
    pub humidity_pct: f64,
    humidity_rate: f64,
    pulse: Option<Pulse>,
    pub lid_v: f64,
    pub relays: Vec<RelayStatus>,
    pub lv: Vec<SupplyState>,
    pub pelt_supply: SupplyState,
    pub hv: SupplyState,
    schedule: Vec<(Trigger, Disturbance)>,
    fail_writes: u32,
    journal: Vec<JournalEntry>,
}

pub type SharedModel = Arc<Mutex<ChamberModel>>;

pub fn lock(model: &SharedModel) -> MutexGuard<'_, ChamberModel> {
    model.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChamberModel {
    pub fn new(module_ids: &[u8], params: PlantParams, seed: u64) -> Self {
        let modules = module_ids
            .iter()
            .enumerate()
            .map(|(i, &id)| Module {
                id,
                temp_c: params.ambient_c,
                peltier_on: false,
                peltier_setpoint_c: params.ambient_c,
                self_heat_c_per_s: 0.0,
                probe: Probe::new(seed.wrapping_add(i as u64), params.noise_std),
            })
            .collect();
        Self {
            params,
            elapsed: Duration::ZERO,
            base_temp_c: params.ambient_c,
            base_setpoint_c: params.ambient_c,
            base_running: false,
            modules,
            humidity_pct: params.humidity_pct,
            humidity_rate: 0.0,
            pulse: None,
            lid_v: params.lid_closed_v,
            relays: vec![RelayStatus::Ok; module_ids.len()],
            lv: vec![SupplyState::default(); module_ids.len()],
            pelt_supply: SupplyState {
                voltage: 12.0,
                current_limit: 6.0,
                output: true,
            },
            hv: SupplyState {
                voltage: params.initial_hv_v,
                current_limit: 1e-5,
                output: params.initial_hv_v != 0.0,
            },
            schedule: Vec::new(),
            fail_writes: 0,
            journal: Vec::new(),
        }
    }

    pub fn schedule(&mut self, trigger: Trigger, disturbance: Disturbance) {
        self.schedule.push((trigger, disturbance));
    }

    pub fn fail_next_writes(&mut self, n: u32) {
        self.fail_writes = n;
    }

    /// Consume one injected write failure, if any are left.
    pub fn take_write_failure(&mut self) -> bool {
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            true
        } else {
            false
        }
    }

    pub fn record(&mut self, what: String) {
        self.journal.push(JournalEntry {
            at: self.elapsed,
            what,
        });
    }

    pub fn journal(&self) -> &[JournalEntry] {
        &self.journal
    }

    pub fn mean_temp_c(&self) -> f64 {
        if self.modules.is_empty() {
            return self.params.ambient_c;
        }
        self.modules.iter().map(|m| m.temp_c).sum::<f64>() / self.modules.len() as f64
    }

    pub fn read_ntc(&mut self, module: usize) -> Option<f64> {
        let elapsed_s = self.elapsed.as_secs_f64();
        let m = self.modules.get_mut(module)?;
        m.probe.read(m.temp_c, elapsed_s)
    }

    pub fn chuck_temp_c(&self, module: usize) -> Option<f64> {
        self.modules
            .get(module)
            .map(|m| m.temp_c + self.params.chuck_offset_c)
    }

    fn fire_due(&mut self) {
        let mean = self.mean_temp_c();
        let elapsed = self.elapsed;
        let (due, pending): (Vec<_>, Vec<_>) =
            self.schedule.drain(..).partition(|(trigger, _)| match *trigger {
                Trigger::At(at) => elapsed >= at,
                Trigger::NtcBelow(t) => mean < t,
                Trigger::NtcAbove(t) => mean > t,
            });
        self.schedule = pending;
        for (_, disturbance) in due {
            self.apply(disturbance);
        }
    }

    fn apply(&mut self, disturbance: Disturbance) {
        tracing::info!(?disturbance, at = ?self.elapsed, "sim disturbance");
        match disturbance {
            Disturbance::OpenLid => self.lid_v = 0.0,
            Disturbance::TripRelay(i) => {
                if let Some(r) = self.relays.get_mut(i) {
                    *r = RelayStatus::Trip;
                }
            }
            Disturbance::SetHumidity(pct) => self.humidity_pct = pct,
            Disturbance::HumidityPulse { pct, hold } => {
                self.pulse = Some(Pulse {
                    until: self.elapsed + hold,
                    restore_pct: self.humidity_pct,
                });
                self.humidity_pct = pct;
            }
            Disturbance::HumidityRamp { pct_per_s } => self.humidity_rate = pct_per_s,
            Disturbance::SelfHeat { module, c_per_s } => {
                if let Some(m) = self.modules.get_mut(module) {
                    m.self_heat_c_per_s = c_per_s;
                }
            }
            Disturbance::ProbeFault { module, fault } => {
                if let Some(m) = self.modules.get_mut(module) {
                    m.probe.fault = fault;
                }
            }
        }
    }

    /// Advance the plant by `dt` (explicit Euler).
    pub fn step(&mut self, dt: Duration) {
        let dt_s = dt.as_secs_f64();
        let p = self.params;

        let (goal, rate) = if self.base_running {
            (self.base_setpoint_c, p.base_rate_c_per_s)
        } else {
            (p.ambient_c, p.base_rate_c_per_s * 0.2)
        };
        let gap = goal - self.base_temp_c;
        self.base_temp_c += gap.clamp(-rate * dt_s, rate * dt_s);

        self.humidity_pct = (self.humidity_pct + self.humidity_rate * dt_s).clamp(0.0, 100.0);

        let base = self.base_temp_c;
        for m in &mut self.modules {
            let mut d = p.base_coupling * (base - m.temp_c)
                + p.ambient_coupling * (p.ambient_c - m.temp_c)
                + m.self_heat_c_per_s;
            if m.peltier_on {
                let sp = m
                    .peltier_setpoint_c
                    .clamp(base - p.peltier_reach_c, base + p.peltier_reach_c);
                d += p.peltier_gain * (sp - m.temp_c);
            }
            m.temp_c += d * dt_s;
        }

        self.elapsed += dt;
        if let Some(pulse) = self.pulse {
            if self.elapsed >= pulse.until {
                self.humidity_pct = pulse.restore_pct;
                self.pulse = None;
            }
        }
        self.fire_due();
    }
}
