//! Instrument channels backed by the shared chamber model.

use controller::{
    BaseController, InstrumentError, InstrumentResult, PeltierStage, PowerSupply, RelayChannel,
    Sensor,
};
use safety::RelayStatus;

use crate::model::{lock, ChamberModel, SharedModel, SupplyState};

fn write_gate(m: &mut ChamberModel) -> InstrumentResult<()> {
    if m.take_write_failure() {
        return Err(InstrumentError::Io("simulated bus error".into()));
    }
    Ok(())
}

fn missing(what: &str) -> InstrumentError {
    InstrumentError::Io(format!("{what} not present"))
}

pub struct NtcChannel {
    pub(crate) model: SharedModel,
    pub(crate) module: usize,
}

impl Sensor for NtcChannel {
    fn read(&mut self) -> InstrumentResult<f64> {
        lock(&self.model)
            .read_ntc(self.module)
            .ok_or_else(|| InstrumentError::SensorRead(format!("ntc {} dropout", self.module)))
    }
}

pub struct ChuckChannel {
    pub(crate) model: SharedModel,
    pub(crate) module: usize,
}

impl Sensor for ChuckChannel {
    fn read(&mut self) -> InstrumentResult<f64> {
        lock(&self.model)
            .chuck_temp_c(self.module)
            .ok_or_else(|| missing("chuck"))
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Ambient {
    Humidity,
    PeltierBack,
    Lid,
}

pub struct AmbientChannel {
    pub(crate) model: SharedModel,
    pub(crate) kind: Ambient,
}

impl Sensor for AmbientChannel {
    fn read(&mut self) -> InstrumentResult<f64> {
        let m = lock(&self.model);
        Ok(match self.kind {
            Ambient::Humidity => m.humidity_pct,
            Ambient::PeltierBack => m.params.ambient_c,
            Ambient::Lid => m.lid_v,
        })
    }
}

pub struct SimRelay {
    pub(crate) model: SharedModel,
    pub(crate) index: usize,
}

impl RelayChannel for SimRelay {
    fn status(&mut self) -> InstrumentResult<RelayStatus> {
        lock(&self.model)
            .relays
            .get(self.index)
            .copied()
            .ok_or_else(|| missing("relay"))
    }
}

pub struct SimPeltier {
    pub(crate) model: SharedModel,
    pub(crate) module: usize,
}

impl SimPeltier {
    fn with<T>(
        &self,
        f: impl FnOnce(&mut ChamberModel, usize) -> InstrumentResult<T>,
    ) -> InstrumentResult<T> {
        let mut m = lock(&self.model);
        if self.module >= m.modules.len() {
            return Err(missing("peltier"));
        }
        f(&mut *m, self.module)
    }
}

impl PeltierStage for SimPeltier {
    fn set_enabled(&mut self, on: bool) -> InstrumentResult<()> {
        self.with(|m, i| {
            write_gate(m)?;
            m.modules[i].peltier_on = on;
            let id = m.modules[i].id;
            m.record(format!("peltier{id} enabled={on}"));
            Ok(())
        })
    }

    fn enabled(&mut self) -> InstrumentResult<bool> {
        self.with(|m, i| Ok(m.modules[i].peltier_on))
    }

    fn set_setpoint(&mut self, temp_c: f64) -> InstrumentResult<()> {
        self.with(|m, i| {
            write_gate(m)?;
            m.modules[i].peltier_setpoint_c = temp_c;
            let id = m.modules[i].id;
            m.record(format!("peltier{id} setpoint={temp_c}"));
            Ok(())
        })
    }

    fn setpoint(&mut self) -> InstrumentResult<f64> {
        self.with(|m, i| Ok(m.modules[i].peltier_setpoint_c))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupplyRole {
    LowVoltage(usize),
    Peltier,
    HighVoltage,
}

pub struct SimSupply {
    pub(crate) model: SharedModel,
    pub(crate) role: SupplyRole,
}

impl SimSupply {
    fn name(&self, m: &ChamberModel) -> String {
        match self.role {
            SupplyRole::LowVoltage(i) => match m.modules.get(i) {
                Some(module) => format!("lv{}", module.id),
                None => format!("lv?{i}"),
            },
            SupplyRole::Peltier => "pelt".into(),
            SupplyRole::HighVoltage => "hv".into(),
        }
    }

    fn state(role: SupplyRole, m: &mut ChamberModel) -> InstrumentResult<&mut SupplyState> {
        match role {
            SupplyRole::LowVoltage(i) => m.lv.get_mut(i).ok_or_else(|| missing("lv supply")),
            SupplyRole::Peltier => Ok(&mut m.pelt_supply),
            SupplyRole::HighVoltage => Ok(&mut m.hv),
        }
    }

    fn write(
        &self,
        what: &str,
        value: String,
        f: impl FnOnce(&mut SupplyState),
    ) -> InstrumentResult<()> {
        let mut m = lock(&self.model);
        write_gate(&mut m)?;
        f(Self::state(self.role, &mut m)?);
        let name = self.name(&m);
        m.record(format!("{name} {what}={value}"));
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&ChamberModel, SupplyState) -> T) -> InstrumentResult<T> {
        let mut m = lock(&self.model);
        let state = *Self::state(self.role, &mut m)?;
        Ok(f(&*m, state))
    }
}

impl PowerSupply for SimSupply {
    fn set_voltage(&mut self, volts: f64) -> InstrumentResult<()> {
        self.write("voltage", volts.to_string(), |s| s.voltage = volts)
    }

    fn voltage(&mut self) -> InstrumentResult<f64> {
        self.read(|_, s| s.voltage)
    }

    fn set_current(&mut self, amps: f64) -> InstrumentResult<()> {
        self.write("current", amps.to_string(), |s| s.current_limit = amps)
    }

    fn current(&mut self) -> InstrumentResult<f64> {
        self.read(|_, s| s.current_limit)
    }

    fn set_output(&mut self, on: bool) -> InstrumentResult<()> {
        self.write("output", on.to_string(), |s| s.output = on)
    }

    fn output(&mut self) -> InstrumentResult<bool> {
        self.read(|_, s| s.output)
    }

    fn measure_voltage(&mut self) -> InstrumentResult<f64> {
        self.read(|_, s| if s.output { s.voltage } else { 0.0 })
    }

    fn measure_current(&mut self) -> InstrumentResult<f64> {
        let role = self.role;
        self.read(move |m, s| {
            if !s.output {
                return 0.0;
            }
            match role {
                SupplyRole::LowVoltage(_) => s.current_limit.min(0.45),
                SupplyRole::Peltier => {
                    let on = m.modules.iter().filter(|p| p.peltier_on).count() as f64;
                    (1.5 * on).min(s.current_limit)
                }
                SupplyRole::HighVoltage => s.voltage * m.params.hv_leakage_a_per_v,
            }
        })
    }
}

pub struct SimBase {
    pub(crate) model: SharedModel,
}

impl BaseController for SimBase {
    fn set_setpoint(&mut self, temp_c: f64) -> InstrumentResult<()> {
        let mut m = lock(&self.model);
        write_gate(&mut m)?;
        m.base_setpoint_c = temp_c;
        m.record(format!("base setpoint={temp_c}"));
        Ok(())
    }

    fn setpoint(&mut self) -> InstrumentResult<f64> {
        Ok(lock(&self.model).base_setpoint_c)
    }

    fn set_running(&mut self, on: bool) -> InstrumentResult<()> {
        let mut m = lock(&self.model);
        write_gate(&mut m)?;
        m.base_running = on;
        m.record(format!("base running={on}"));
        Ok(())
    }

    fn running(&mut self) -> InstrumentResult<bool> {
        Ok(lock(&self.model).base_running)
    }
}
