use anyhow::{Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use figment::{providers::{Env, Format, Toml}, Figment};
use serde::Deserialize;
use validator::{Validate, ValidationError};

use crate::domain::{ManagerMode, Phase};

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[validate(schema(function = "validate_cross_fields"))]
pub struct Config {
    #[serde(default)]
    #[validate(nested)]
    pub host: HostConfig,
    #[serde(default)]
    #[validate(nested)]
    pub boiler: BoilerConfig,
    #[serde(default)]
    #[validate(nested)]
    pub battery: BatteryConfig,
    #[serde(default)]
    #[validate(nested)]
    pub grid: GridConfig,
    #[serde(default)]
    #[validate(nested)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub entities: EntitiesConfig,
    #[serde(default)]
    #[validate(nested)]
    pub controls: ControlsConfig,
    #[serde(default)]
    pub forecast: Option<ForecastConfig>,
}

/// Home Assistant style REST host
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct HostConfig {
    #[validate(length(min = 1))]
    pub base_url: String,
    pub token: String,
    #[validate(range(min = 1, max = 60))]
    pub timeout_seconds: u64,
    #[validate(range(max = 10))]
    pub max_retries: u32,
    /// Seconds between polls of the grid-state and control entities
    #[validate(range(min = 1, max = 300))]
    pub watch_seconds: u64,
    /// Poll the operator control entities and apply their changes
    pub follow_controls: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            base_url: "http://homeassistant.local:8123".into(),
            token: String::new(),
            timeout_seconds: 10,
            max_retries: 3,
            watch_seconds: 5,
            follow_controls: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct BoilerConfig {
    #[validate(range(min = 1.0))]
    pub power_w: f64,
    #[validate(range(min = 1.0))]
    pub volume_l: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_temp_c: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub max_temp_c: f64,
}

impl Default for BoilerConfig {
    fn default() -> Self {
        Self { power_w: 2000.0, volume_l: 150.0, min_temp_c: 35.0, max_temp_c: 75.0 }
    }
}

impl BoilerConfig {
    pub fn clamp_temp(&self, temp_c: f64) -> f64 {
        temp_c.clamp(self.min_temp_c, self.max_temp_c)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct BatteryConfig {
    #[validate(range(min = 1.0))]
    pub capacity_wh: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub soc_top_percent: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub soc_bottom_percent: f64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self { capacity_wh: 4800.0, soc_top_percent: 65.0, soc_bottom_percent: 60.0 }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct GridConfig {
    /// Maximum tolerated grid import (W) while heating from surplus
    #[validate(range(min = 0.0))]
    pub threshold_w: f64,
    /// Active phase; discovered from transport topics when absent
    pub phase: Option<Phase>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self { threshold_w: 150.0, phase: None }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct ManagerConfig {
    #[validate(range(min = 5, max = 60))]
    pub update_interval_seconds: u64,
    /// Day minimum = day target minus this many degrees
    #[validate(range(min = 0.0, max = 100.0))]
    pub temp_variable_c: f64,
    pub timezone: Tz,
    /// Whether transport connectivity gates the manager
    pub monitor_transport: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            update_interval_seconds: 10,
            temp_variable_c: 20.0,
            timezone: chrono_tz::Europe::Bratislava,
            monitor_transport: true,
        }
    }
}

/// Host entity ids. `{phase}` is replaced with the phase number.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EntitiesConfig {
    pub grid_power: String,
    pub critical_load: String,
    pub pv_power: String,
    pub battery_soc: String,
    pub grid_lost: String,
    pub boiler_connection: String,
    pub boiler_heating_status: String,
    pub boiler_temperature: String,
    pub boiler_thermostat: String,
    pub boiler_mode_select: String,
    pub manager_status: String,
    pub forecast_today: String,
    pub forecast_tomorrow: String,
    pub mode_control: String,
    pub night_preheat_control: String,
    pub day_target_control: String,
    pub preheat_target_control: String,
    pub morning_time_control: String,
}

impl Default for EntitiesConfig {
    fn default() -> Self {
        Self {
            grid_power: "sensor.venus_grid_l{phase}_power".into(),
            critical_load: "sensor.venus_critical_loads_l{phase}_power".into(),
            pv_power: "sensor.venus_pv_power".into(),
            battery_soc: "sensor.venus_battery_soc".into(),
            grid_lost: "sensor.venus_grid_lost".into(),
            boiler_connection: "sensor.boiler_connection".into(),
            boiler_heating_status: "sensor.boiler_heating_status".into(),
            boiler_temperature: "sensor.boiler_temperature".into(),
            boiler_thermostat: "climate.boiler".into(),
            boiler_mode_select: "select.boiler_mode".into(),
            manager_status: "sensor.pv_water_heating_status".into(),
            forecast_today: "sensor.pv_generation_forecast_today".into(),
            forecast_tomorrow: "sensor.pv_generation_forecast_tomorrow".into(),
            mode_control: "input_select.pv_water_heating_mode".into(),
            night_preheat_control: "input_boolean.pv_water_heating_night_preheat".into(),
            day_target_control: "input_number.pv_water_heating_day_target".into(),
            preheat_target_control: "input_number.pv_water_heating_preheat_target".into(),
            morning_time_control: "input_datetime.pv_water_heating_morning_time".into(),
        }
    }
}

impl EntitiesConfig {
    pub fn grid_power_for(&self, phase: Phase) -> String {
        self.grid_power.replace("{phase}", &phase.number().to_string())
    }

    pub fn critical_load_for(&self, phase: Phase) -> String {
        self.critical_load.replace("{phase}", &phase.number().to_string())
    }
}

/// Initial values of the operator controls
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct ControlsConfig {
    pub mode: ManagerMode,
    #[validate(range(min = 0.0, max = 100.0))]
    pub day_target_c: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub preheat_target_c: f64,
    pub morning_time: NaiveTime,
    pub night_preheat: bool,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            mode: ManagerMode::Manual,
            day_target_c: 60.0,
            preheat_target_c: 50.0,
            morning_time: NaiveTime::from_hms_opt(6, 0, 0).unwrap_or_default(),
            night_preheat: false,
        }
    }
}

/// VRM solar forecast source
#[derive(Debug, Clone, Deserialize)]
pub struct ForecastConfig {
    #[serde(default = "default_vrm_url")]
    pub base_url: String,
    pub installation_id: String,
    pub token: String,
    #[serde(default = "default_refresh_minutes")]
    pub refresh_minutes: u64,
}

fn default_vrm_url() -> String {
    "https://vrmapi.victronenergy.com".into()
}

fn default_refresh_minutes() -> u64 {
    60
}

fn validate_cross_fields(cfg: &Config) -> Result<(), ValidationError> {
    if cfg.boiler.min_temp_c >= cfg.boiler.max_temp_c {
        return Err(ValidationError::new("boiler_min_temp_not_below_max"));
    }
    if cfg.battery.soc_bottom_percent > cfg.battery.soc_top_percent {
        return Err(ValidationError::new("soc_bottom_above_top"));
    }
    if let Some(forecast) = &cfg.forecast {
        if forecast.installation_id.is_empty() || forecast.token.is_empty() {
            return Err(ValidationError::new("forecast_credentials_missing"));
        }
        if forecast.refresh_minutes == 0 {
            return Err(ValidationError::new("forecast_refresh_zero"));
        }
    }
    Ok(())
}

impl Config {
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("PVWH__").split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let cfg: Config = figment.extract().context("invalid configuration")?;
        cfg.validate().context("configuration out of range")?;
        Ok(cfg)
    }
}
