use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use safety::InterlockConfig;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

pub const ALL_MODULES: [u8; 4] = [1, 2, 3, 4];

/// What to run: validated once before any instrument is opened and never
/// changed afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct CycleConfig {
    min_temp_c: f64,
    max_temp_c: f64,
    cycle_count: u32,
    modules: BTreeSet<u8>,
}

impl CycleConfig {
    /// An empty module list selects all four modules.
    pub fn new(
        min_temp_c: f64,
        max_temp_c: f64,
        cycle_count: u32,
        modules: impl IntoIterator<Item = u8>,
    ) -> Result<Self, ConfigError> {
        if !min_temp_c.is_finite() || !max_temp_c.is_finite() {
            return Err(ConfigError::NonFinite {
                min: min_temp_c,
                max: max_temp_c,
            });
        }
        if max_temp_c <= min_temp_c {
            return Err(ConfigError::TemperatureRange {
                min: min_temp_c,
                max: max_temp_c,
            });
        }
        if cycle_count == 0 {
            return Err(ConfigError::CycleCount);
        }

        let mut selected = BTreeSet::new();
        for m in modules {
            if !ALL_MODULES.contains(&m) {
                return Err(ConfigError::Module(m));
            }
            selected.insert(m);
        }
        if selected.is_empty() {
            selected.extend(ALL_MODULES);
        }

        Ok(Self {
            min_temp_c,
            max_temp_c,
            cycle_count,
            modules: selected,
        })
    }

    pub fn min_temp_c(&self) -> f64 {
        self.min_temp_c
    }

    pub fn max_temp_c(&self) -> f64 {
        self.max_temp_c
    }

    pub fn cycle_count(&self) -> u32 {
        self.cycle_count
    }

    pub fn modules(&self) -> &BTreeSet<u8> {
        &self.modules
    }

    /// Range a working ramp target may take: the cycle range (plus the
    /// holding temperature) widened by one excursion on both sides.
    pub fn target_bounds(&self, hold_temp_c: f64, excursion_c: f64) -> (f64, f64) {
        (
            self.min_temp_c.min(hold_temp_c) - excursion_c,
            self.max_temp_c.max(hold_temp_c) + excursion_c,
        )
    }
}

fn secs(s: f64) -> Duration {
    Duration::from_secs_f64(s.max(0.0))
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub poll_interval_s: f64,
    /// Settle time after a write before the confirmation read.
    pub short_delay_s: f64,
    /// Spacing between consecutive Peltier commands.
    pub long_delay_s: f64,
    pub long_precool_s: f64,
    pub short_precool_s: f64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval_s: 5.0,
            short_delay_s: 0.3,
            long_delay_s: 0.8,
            long_precool_s: 45.0 * 60.0,
            short_precool_s: 7.0 * 60.0,
        }
    }
}

impl Timing {
    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval_s)
    }

    pub fn short_delay(&self) -> Duration {
        secs(self.short_delay_s)
    }

    pub fn long_delay(&self) -> Duration {
        secs(self.long_delay_s)
    }

    pub fn long_precool(&self) -> Duration {
        secs(self.long_precool_s)
    }

    pub fn short_precool(&self) -> Duration {
        secs(self.short_precool_s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RampConfig {
    /// Where every run starts and ends, and where safe shutdown parks the base.
    pub hold_temp_c: f64,
    /// Targets below this get the long pre-cool pause.
    pub long_precool_below_c: f64,
    /// Otherwise a gap larger than this gets the short pause.
    pub short_precool_gap_c: f64,
    pub coarse_step_c: f64,
    pub fine_step_c: f64,
    pub down_tolerance_c: f64,
    pub up_tolerance_c: f64,
    pub up_base_offset_c: f64,
    pub up_base_cap_c: f64,
    /// Ramp-up targets at or above this drive the base to `up_base_cap_c`.
    pub up_base_cap_from_c: f64,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            hold_temp_c: 20.0,
            long_precool_below_c: -40.0,
            short_precool_gap_c: 10.0,
            coarse_step_c: 5.0,
            fine_step_c: 1.0,
            down_tolerance_c: 0.5,
            up_tolerance_c: 0.1,
            up_base_offset_c: 10.0,
            up_base_cap_c: 70.0,
            up_base_cap_from_c: 55.0,
        }
    }
}

impl RampConfig {
    pub fn ramp_up_base(&self, target_c: f64) -> f64 {
        if target_c >= self.up_base_cap_from_c {
            self.up_base_cap_c
        } else {
            target_c + self.up_base_offset_c
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LowVoltage {
    pub volts: f64,
    pub amps: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupplyConfig {
    /// Magnitude of one high-voltage sweep step.
    pub hv_sweep_step_v: f64,
    /// HV outputs below this are treated as already at zero.
    pub hv_zero_threshold_v: f64,
    /// Power the module low-voltage supplies for the run.
    pub module_lv: Option<LowVoltage>,
}

impl Default for SupplyConfig {
    fn default() -> Self {
        Self {
            hv_sweep_step_v: 5.0,
            hv_zero_threshold_v: 0.001,
            module_lv: None,
        }
    }
}

/// Chamber tuning, loaded from a TOML file. Every field has a default.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChamberConfig {
    pub timing: Timing,
    pub retry: RetryPolicy,
    pub interlock: InterlockConfig,
    pub ramp: RampConfig,
    pub supplies: SupplyConfig,
}

impl ChamberConfig {
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: Self = toml::from_str(&s).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject tuning that would stall a ramp or invert the target bounds.
    /// NaN fails every check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.timing;
        positive("timing.poll_interval_s", t.poll_interval_s)?;
        non_negative("timing.short_delay_s", t.short_delay_s)?;
        non_negative("timing.long_delay_s", t.long_delay_s)?;
        non_negative("timing.long_precool_s", t.long_precool_s)?;
        non_negative("timing.short_precool_s", t.short_precool_s)?;

        let r = &self.retry;
        non_negative("retry.backoff_base_s", r.backoff_base_s)?;
        non_negative("retry.backoff_step_s", r.backoff_step_s)?;
        positive("retry.call_timeout_s", r.call_timeout_s)?;

        let i = &self.interlock;
        finite("interlock.trip_temp_c", i.trip_temp_c)?;
        finite("interlock.derate_temp_c", i.derate_temp_c)?;
        if i.derate_temp_c > i.trip_temp_c {
            return Err(ConfigError::Invalid {
                field: "interlock.derate_temp_c",
                rule: "at most interlock.trip_temp_c",
                value: i.derate_temp_c,
            });
        }
        non_negative("interlock.dewpoint_hard_margin_c", i.dewpoint_hard_margin_c)?;
        non_negative("interlock.dewpoint_soft_margin_c", i.dewpoint_soft_margin_c)?;
        non_negative("interlock.excursion_c", i.excursion_c)?;
        finite("interlock.lid_min_voltage", i.lid_min_voltage)?;
        non_negative("interlock.settle_s", i.settle_s)?;

        let m = &self.ramp;
        finite("ramp.hold_temp_c", m.hold_temp_c)?;
        finite("ramp.long_precool_below_c", m.long_precool_below_c)?;
        non_negative("ramp.short_precool_gap_c", m.short_precool_gap_c)?;
        positive("ramp.coarse_step_c", m.coarse_step_c)?;
        positive("ramp.fine_step_c", m.fine_step_c)?;
        non_negative("ramp.down_tolerance_c", m.down_tolerance_c)?;
        non_negative("ramp.up_tolerance_c", m.up_tolerance_c)?;
        finite("ramp.up_base_offset_c", m.up_base_offset_c)?;
        finite("ramp.up_base_cap_c", m.up_base_cap_c)?;
        finite("ramp.up_base_cap_from_c", m.up_base_cap_from_c)?;

        let p = &self.supplies;
        positive("supplies.hv_sweep_step_v", p.hv_sweep_step_v)?;
        non_negative("supplies.hv_zero_threshold_v", p.hv_zero_threshold_v)?;
        if let Some(lv) = p.module_lv {
            non_negative("supplies.module_lv.volts", lv.volts)?;
            non_negative("supplies.module_lv.amps", lv.amps)?;
        }
        Ok(())
    }
}

fn check(field: &'static str, rule: &'static str, value: f64, ok: bool) -> Result<(), ConfigError> {
    if ok && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::Invalid { field, rule, value })
    }
}

fn finite(field: &'static str, value: f64) -> Result<(), ConfigError> {
    check(field, "finite", value, true)
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    check(field, "positive", value, value > 0.0)
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    check(field, "zero or more", value, value >= 0.0)
}
