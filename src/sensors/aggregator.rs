//! # Sensor aggregation
//!
//! Raw instantaneous readings are too noisy for a hysteretic controller.
//! Short windows (seconds) smooth critical-load spikes; longer windows
//! (minutes) smooth PV intermittency from passing clouds.

use chrono::{DateTime, FixedOffset, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{HistorySample, HistorySource, SensorError, StateSource};
use crate::domain::thermal::round2;
use crate::timer::Clock;

/// Upper bound for a single history fetch
pub const HISTORY_TIMEOUT: Duration = Duration::from_secs(10);

/// Statistic computed over a history window
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Statistic {
    Mean,
    Min,
    /// Percentile in `0..=100`, linear interpolation between closest ranks
    Percentile(f64),
}

/// Typed reads and windowed statistics over host sensors.
pub struct SensorAggregator {
    states: Arc<dyn StateSource>,
    history: Arc<dyn HistorySource>,
    clock: Arc<dyn Clock>,
}

impl SensorAggregator {
    pub fn new(
        states: Arc<dyn StateSource>,
        history: Arc<dyn HistorySource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            states,
            history,
            clock,
        }
    }

    pub async fn read_text(&self, entity_id: &str) -> Result<String, SensorError> {
        self.states.state(entity_id).await
    }

    pub async fn read_f64(&self, entity_id: &str) -> Result<f64, SensorError> {
        let state = self.states.state(entity_id).await?;
        parse_numeric(&state).ok_or_else(|| SensorError::NonNumeric {
            entity: entity_id.to_string(),
            state,
        })
    }

    /// Numeric read that logs and returns `None` instead of failing.
    pub async fn try_read_f64(&self, entity_id: &str) -> Option<f64> {
        match self.read_f64(entity_id).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(entity_id, error = %e, "sensor unavailable");
                None
            }
        }
    }

    /// Recorded states in `[start, end]`, bounded by [`HISTORY_TIMEOUT`].
    pub async fn history(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistorySample>, SensorError> {
        tokio::time::timeout(HISTORY_TIMEOUT, self.history.history(entity_id, start, end))
            .await
            .map_err(|_| SensorError::Timeout(entity_id.to_string()))?
    }

    /// `statistic` over the samples in `[reference - window, reference]`.
    ///
    /// `reference` defaults to now. Non-numeric samples are discarded; `None`
    /// when nothing numeric remains or the history could not be fetched.
    /// The result is rounded to 2 decimals.
    pub async fn aggregate(
        &self,
        entity_id: &str,
        window: Duration,
        statistic: Statistic,
        reference: Option<DateTime<FixedOffset>>,
    ) -> Option<f64> {
        let end = reference.unwrap_or_else(|| self.clock.now()).with_timezone(&Utc);
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        let start = end - window;

        let samples = match self.history(entity_id, start, end).await {
            Ok(samples) => samples,
            Err(e) => {
                warn!(entity_id, error = %e, "history fetch failed");
                return None;
            }
        };

        let values: Vec<f64> = samples
            .iter()
            .filter_map(|s| parse_numeric(&s.state))
            .collect();
        let value = compute(&values, statistic)?;
        debug!(entity_id, ?statistic, samples = values.len(), value, "aggregated history");
        Some(round2(value))
    }
}

/// Parse a host state string, rejecting "unavailable", "unknown", NaN and friends.
pub fn parse_numeric(state: &str) -> Option<f64> {
    state.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn compute(values: &[f64], statistic: Statistic) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    match statistic {
        Statistic::Mean => Some(values.iter().sum::<f64>() / values.len() as f64),
        Statistic::Min => values.iter().copied().reduce(f64::min),
        Statistic::Percentile(p) => percentile(values, p),
    }
}

/// Percentile with linear interpolation between closest ranks
/// (rank = p/100 × (n − 1)).
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}
