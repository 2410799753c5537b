use tracing::debug;

use crate::config::{BatteryConfig, BoilerConfig};
use crate::domain::{battery_top_up_kwh, heat_demand};

/// Outcome of weighing tomorrow's PV forecast against the day's needs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyBalance {
    pub boiler_kwh: f64,
    pub battery_kwh: f64,
    pub forecast_kwh: f64,
}

impl EnergyBalance {
    pub fn required_kwh(&self) -> f64 {
        self.boiler_kwh + self.battery_kwh
    }

    /// Pre-heating is worth it only when the forecast covers everything.
    pub fn proceeds(&self) -> bool {
        self.required_kwh() <= self.forecast_kwh
    }
}

/// Decides whether forecast PV covers the day's heating plus the battery top-up.
#[derive(Debug, Clone)]
pub struct ForecastEnergyBalancer {
    boiler: BoilerConfig,
    battery: BatteryConfig,
    temp_variable_c: f64,
}

impl ForecastEnergyBalancer {
    pub fn new(boiler: BoilerConfig, battery: BatteryConfig, temp_variable_c: f64) -> Self {
        Self {
            boiler,
            battery,
            temp_variable_c,
        }
    }

    /// Lowest temperature the tank may fall to during the day.
    pub fn day_min_temp(&self, day_target_c: f64) -> f64 {
        (day_target_c - self.temp_variable_c).max(self.boiler.min_temp_c)
    }

    pub fn evaluate(
        &self,
        day_target_c: f64,
        preheat_target_c: f64,
        soc_now: f64,
        forecast_wh: f64,
    ) -> EnergyBalance {
        let min_temp = self.day_min_temp(day_target_c);
        let boiler_kwh = heat_demand(
            self.boiler.power_w,
            self.boiler.volume_l,
            preheat_target_c,
            min_temp,
        )
        .energy_kwh;
        let battery_kwh = battery_top_up_kwh(
            self.battery.capacity_wh,
            soc_now,
            self.battery.soc_top_percent,
        );
        let balance = EnergyBalance {
            boiler_kwh,
            battery_kwh,
            forecast_kwh: forecast_wh / 1000.0,
        };
        debug!(
            min_temp,
            boiler_kwh,
            battery_kwh,
            forecast_kwh = balance.forecast_kwh,
            proceeds = balance.proceeds(),
            "forecast energy balance"
        );
        balance
    }
}
