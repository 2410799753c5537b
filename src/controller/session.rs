use chrono::{NaiveDate, NaiveTime};
use tracing::info;

use crate::config::{Config, ControlsConfig};
use crate::domain::{ManagerMode, ManagerStatus, Phase};
use crate::forecast::ForecastDay;

/// A published PV forecast and the local date it covers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DatedForecast {
    pub date: NaiveDate,
    pub wh: f64,
}

/// Forecast PV yield for today and tomorrow, as last published.
///
/// Values keep the date they were fetched for, so a figure that has rolled
/// past its day is never mistaken for a fresh one.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ForecastValues {
    pub today: Option<DatedForecast>,
    pub tomorrow: Option<DatedForecast>,
}

impl ForecastValues {
    pub fn get(&self, day: ForecastDay) -> Option<DatedForecast> {
        match day {
            ForecastDay::Today => self.today,
            ForecastDay::Tomorrow => self.tomorrow,
        }
    }

    pub fn set(&mut self, day: ForecastDay, date: NaiveDate, wh: f64) {
        let value = Some(DatedForecast { date, wh });
        match day {
            ForecastDay::Today => self.today = value,
            ForecastDay::Tomorrow => self.tomorrow = value,
        }
    }

    /// Forecast Wh for `date`. Today's slot wins when both cover it, being
    /// the later fetch.
    pub fn for_date(&self, date: NaiveDate) -> Option<f64> {
        [self.today, self.tomorrow]
            .into_iter()
            .flatten()
            .find(|f| f.date == date)
            .map(|f| f.wh)
    }
}

/// Session-wide mutable state.
///
/// Owned by the manager task and only touched between suspension points of
/// a single event, so no handler can observe it half updated.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub status: ManagerStatus,
    /// Mode in force; starts `Off` until the configured mode is applied
    pub mode: ManagerMode,
    /// Mode in force when the transport dropped, restored on reconnect
    pub mode_before_transport_loss: Option<ManagerMode>,
    pub transport_connected: bool,
    /// Set until the first completed tick or transport message
    pub component_loading: bool,
    pub phase: Option<Phase>,
    pub day_target_c: f64,
    pub preheat_target_c: f64,
    pub morning_time: NaiveTime,
    pub night_preheat: bool,
    pub forecast: ForecastValues,
}

impl SessionState {
    pub fn new(cfg: &Config) -> Self {
        let ControlsConfig {
            day_target_c,
            preheat_target_c,
            morning_time,
            night_preheat,
            ..
        } = cfg.controls.clone();
        Self {
            status: ManagerStatus::Initializing,
            mode: ManagerMode::Off,
            mode_before_transport_loss: None,
            transport_connected: true,
            component_loading: true,
            phase: cfg.grid.phase,
            day_target_c: cfg.boiler.clamp_temp(day_target_c),
            preheat_target_c: cfg.boiler.clamp_temp(preheat_target_c),
            morning_time,
            night_preheat,
            forecast: ForecastValues::default(),
        }
    }

    pub fn set_status(&mut self, status: ManagerStatus) {
        if self.status != status {
            info!(from = %self.status, to = %status, "manager status");
            self.status = status;
        }
    }
}
