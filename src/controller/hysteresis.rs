//! # Surplus hysteresis
//!
//! Per-tick on/off decision for the heating element. Turning on is
//! conservative, staying on is lenient:
//!
//! | transition | condition |
//! |---|---|
//! | Off → On | SOC ≥ top, import ≤ threshold, PV ≥ 75% (load + boiler) |
//! | On → Off | SOC < bottom, or import > threshold, or PV < 70% of the demand |
//!
//! The "demand" for staying on includes the boiler power only once the
//! element has satisfied its thermostat (hardware reports off). While the
//! element is drawing, its power is already inside the measured flows. Both
//! PV drop-outs are confirmed against the instantaneous critical load so a
//! transient median dip cannot switch the boiler off.

use tracing::{debug, info};

use crate::config::{BatteryConfig, BoilerConfig, GridConfig};
use crate::domain::{ActuatorError, BoilerActuator, HeatingStatus};
use crate::sensors::SensorSnapshot;

const TURN_ON_RATIO: f64 = 0.75;
const STAY_ON_RATIO: f64 = 0.70;

/// Sensor figures the decision needs; all must be present.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HysteresisInputs {
    pub grid_power_w: f64,
    pub critical_load_stat_w: f64,
    pub critical_load_w: f64,
    pub pv_power_stat_w: f64,
    pub battery_soc: f64,
    pub heating_status: HeatingStatus,
}

impl HysteresisInputs {
    pub fn from_snapshot(snapshot: &SensorSnapshot) -> Option<Self> {
        Some(Self {
            grid_power_w: snapshot.grid_power_w?,
            critical_load_stat_w: snapshot.critical_load_stat_w?,
            critical_load_w: snapshot.critical_load_w?,
            pv_power_stat_w: snapshot.pv_power_stat_w?,
            battery_soc: snapshot.battery_soc?,
            heating_status: snapshot.heating_status?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HysteresisLimits {
    pub boiler_power_w: f64,
    pub soc_top: f64,
    pub soc_bottom: f64,
    pub grid_threshold_w: f64,
}

impl HysteresisLimits {
    pub fn from_config(boiler: &BoilerConfig, battery: &BatteryConfig, grid: &GridConfig) -> Self {
        Self {
            boiler_power_w: boiler.power_w,
            soc_top: battery.soc_top_percent,
            soc_bottom: battery.soc_bottom_percent,
            grid_threshold_w: grid.threshold_w,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffReason {
    LowBattery,
    GridImport,
    SurplusLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HysteresisDecision {
    TurnOn,
    TurnOff(OffReason),
    Hold,
}

/// Pure decision for one tick given whether this system commanded heating.
pub fn decide(inputs: &HysteresisInputs, limits: &HysteresisLimits, commanded_on: bool) -> HysteresisDecision {
    if commanded_on {
        if inputs.battery_soc < limits.soc_bottom {
            return HysteresisDecision::TurnOff(OffReason::LowBattery);
        }
        if inputs.grid_power_w > limits.grid_threshold_w {
            return HysteresisDecision::TurnOff(OffReason::GridImport);
        }
        let extra = match inputs.heating_status {
            HeatingStatus::Off => limits.boiler_power_w,
            HeatingStatus::On => 0.0,
        };
        let short_of = |load: f64| inputs.pv_power_stat_w < STAY_ON_RATIO * (load + extra);
        if short_of(inputs.critical_load_stat_w) && short_of(inputs.critical_load_w) {
            return HysteresisDecision::TurnOff(OffReason::SurplusLost);
        }
        HysteresisDecision::Hold
    } else {
        let soc_ok = inputs.battery_soc >= limits.soc_top;
        let grid_ok = inputs.grid_power_w <= limits.grid_threshold_w;
        let pv_ok = inputs.pv_power_stat_w
            >= TURN_ON_RATIO * (inputs.critical_load_stat_w + limits.boiler_power_w);
        if soc_ok && grid_ok && pv_ok {
            HysteresisDecision::TurnOn
        } else {
            HysteresisDecision::Hold
        }
    }
}

/// Surplus-driven boiler controller
pub struct BoilerHysteresisController {
    limits: HysteresisLimits,
}

impl BoilerHysteresisController {
    pub fn new(limits: HysteresisLimits) -> Self {
        Self { limits }
    }

    /// Decide from `snapshot` and drive the actuator. Missing figures skip the tick.
    pub async fn run(
        &self,
        snapshot: &SensorSnapshot,
        actuator: &mut BoilerActuator,
        day_target_c: f64,
    ) -> Result<HysteresisDecision, ActuatorError> {
        let Some(inputs) = HysteresisInputs::from_snapshot(snapshot) else {
            debug!("insufficient sensor data, skipping hysteresis");
            return Ok(HysteresisDecision::Hold);
        };

        let decision = decide(&inputs, &self.limits, actuator.is_commanded_on());
        match decision {
            HysteresisDecision::TurnOn => {
                info!(
                    pv_w = inputs.pv_power_stat_w,
                    load_w = inputs.critical_load_stat_w,
                    soc = inputs.battery_soc,
                    grid_w = inputs.grid_power_w,
                    "surplus available, heating"
                );
                actuator.turn_on(day_target_c).await?;
            }
            HysteresisDecision::TurnOff(reason) => {
                info!(
                    ?reason,
                    pv_w = inputs.pv_power_stat_w,
                    load_w = inputs.critical_load_stat_w,
                    soc = inputs.battery_soc,
                    grid_w = inputs.grid_power_w,
                    "stopping surplus heating"
                );
                actuator.turn_off().await?;
            }
            HysteresisDecision::Hold => {}
        }
        Ok(decision)
    }
}
