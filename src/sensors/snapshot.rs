use std::time::Duration;
use tracing::{debug, warn};

use super::{SensorAggregator, Statistic};
use crate::config::EntitiesConfig;
use crate::domain::{HeatingStatus, Phase};

/// Window for the critical-load median
pub const CRITICAL_LOAD_WINDOW: Duration = Duration::from_secs(30);
/// Window for the PV percentile
pub const PV_WINDOW: Duration = Duration::from_secs(10 * 60);

const CRITICAL_LOAD_PERCENTILE: f64 = 50.0;
const PV_PERCENTILE: f64 = 70.0;

/// Sensor figures for one control tick. Never stored across ticks.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSnapshot {
    pub grid_power_w: Option<f64>,
    pub critical_load_w: Option<f64>,
    pub critical_load_stat_w: Option<f64>,
    pub pv_power_stat_w: Option<f64>,
    pub battery_soc: Option<f64>,
    pub heating_status: Option<HeatingStatus>,
}

impl SensorSnapshot {
    /// Read everything the surplus controller needs for `phase`.
    ///
    /// Unreadable entities leave their field empty.
    pub async fn collect(
        aggregator: &SensorAggregator,
        entities: &EntitiesConfig,
        phase: Phase,
    ) -> Self {
        let critical_load = entities.critical_load_for(phase);

        let heating_status = match aggregator.read_text(&entities.boiler_heating_status).await {
            Ok(state) => Some(HeatingStatus::from_state(&state)),
            Err(e) => {
                warn!(entity_id = %entities.boiler_heating_status, error = %e, "heating status unreadable");
                None
            }
        };

        let snapshot = Self {
            grid_power_w: aggregator.try_read_f64(&entities.grid_power_for(phase)).await,
            critical_load_w: aggregator.try_read_f64(&critical_load).await,
            critical_load_stat_w: aggregator
                .aggregate(
                    &critical_load,
                    CRITICAL_LOAD_WINDOW,
                    Statistic::Percentile(CRITICAL_LOAD_PERCENTILE),
                    None,
                )
                .await,
            pv_power_stat_w: aggregator
                .aggregate(
                    &entities.pv_power,
                    PV_WINDOW,
                    Statistic::Percentile(PV_PERCENTILE),
                    None,
                )
                .await,
            battery_soc: aggregator.try_read_f64(&entities.battery_soc).await,
            heating_status,
        };
        debug!(%phase, ?snapshot, "sensor snapshot");
        snapshot
    }
}
