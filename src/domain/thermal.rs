//! # Thermal model
//!
//! Converts a tank volume and temperature rise into the thermal energy
//! needed and the time the heating element takes to deliver it.
//!
//! ```text
//! energy_kwh       = 4.186 × volume_l × ΔT / 3600
//! duration_minutes = energy_kwh / (power_w / 1000) × 60
//! ```

use serde::{Deserialize, Serialize};
use tracing::error;

/// Specific heat of water (kJ/kg°C)
pub const WATER_SPECIFIC_HEAT_KJ: f64 = 4.186;

/// kJ per kWh
const KJ_PER_KWH: f64 = 3600.0;

/// Energy and element run time for one heating job
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HeatDemand {
    pub energy_kwh: f64,
    pub duration_minutes: f64,
}

impl HeatDemand {
    pub fn is_zero(&self) -> bool {
        self.energy_kwh <= 0.0
    }

    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.duration_minutes * 60.0).round() as i64)
    }
}

/// Heat needed to bring `volume_l` litres from `water_temp_c` to `target_temp_c`
/// with an element of `power_w` watts.
///
/// Returns zero when the water is already at or above target. Zero power or
/// volume is a configuration error: it is logged and also yields zero.
pub fn heat_demand(power_w: f64, volume_l: f64, water_temp_c: f64, target_temp_c: f64) -> HeatDemand {
    if volume_l <= 0.0 || power_w <= 0.0 {
        error!(power_w, volume_l, "boiler volume or power is not configured");
        return HeatDemand::default();
    }

    let delta_c = target_temp_c - water_temp_c;
    if delta_c <= 0.0 {
        return HeatDemand::default();
    }

    let energy_kwh = WATER_SPECIFIC_HEAT_KJ * volume_l * delta_c / KJ_PER_KWH;
    let duration_minutes = energy_kwh / (power_w / 1000.0) * 60.0;

    HeatDemand {
        energy_kwh: round2(energy_kwh),
        duration_minutes: round2(duration_minutes),
    }
}

/// Energy (kWh) needed to charge a battery of `capacity_wh` from `soc_now`
/// to `soc_target` percent.
pub fn battery_top_up_kwh(capacity_wh: f64, soc_now: f64, soc_target: f64) -> f64 {
    if capacity_wh <= 0.0 {
        error!(capacity_wh, "battery capacity is not configured");
        return 0.0;
    }
    let gap = (soc_target - soc_now).max(0.0);
    round2(capacity_wh / 1000.0 * gap / 100.0)
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
