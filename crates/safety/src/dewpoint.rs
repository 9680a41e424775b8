/// Returned when the humidity reading is unusable. Means "dewpoint
/// unconstrained", never a real temperature.
pub const DEWPOINT_UNCONSTRAINED: f64 = -100.0;

const MIN_HUMIDITY_PCT: f64 = 1e-5;
const MAGNUS_B: f64 = 243.04;
const MAGNUS_A: f64 = 17.625;

/// Dewpoint (°C) from relative humidity (%) and the reference temperature (°C),
/// using the Magnus approximation.
pub fn dewpoint(humidity_pct: f64, temp_c: f64) -> f64 {
    if humidity_pct.is_nan() || humidity_pct <= MIN_HUMIDITY_PCT {
        return DEWPOINT_UNCONSTRAINED;
    }

    let ln_h = (humidity_pct / 100.0).ln();
    let t_term = MAGNUS_A * temp_c / (MAGNUS_B + temp_c);
    let td = MAGNUS_B * (ln_h + t_term) / (MAGNUS_A - ln_h - t_term);

    if td.is_finite() {
        td
    } else {
        DEWPOINT_UNCONSTRAINED
    }
}

/// True when `dewpoint` carries no information and must not gate anything.
pub fn is_unconstrained(dewpoint_c: f64) -> bool {
    dewpoint_c <= DEWPOINT_UNCONSTRAINED
}
