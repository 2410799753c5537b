use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Sensor access errors
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Entity not found: {0}")]
    NotFound(String),
    #[error("Entity {entity} has non-numeric state '{state}'")]
    NonNumeric { entity: String, state: String },
    #[error("History request for {0} timed out")]
    Timeout(String),
    #[error("Host error: {0}")]
    Host(String),
}

/// One recorded state of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySample {
    pub timestamp: DateTime<Utc>,
    pub state: String,
}

/// Current state of host entities
#[async_trait]
pub trait StateSource: Send + Sync {
    /// Raw state string; fails with [`SensorError::NotFound`] for unknown entities.
    async fn state(&self, entity_id: &str) -> Result<String, SensorError>;
}

/// Recorded history of host entities
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Samples in `[start, end]` in time order, including the state that was
    /// current at `start`. May be empty.
    async fn history(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistorySample>, SensorError>;
}

/// Entity states and history held in memory
#[derive(Debug, Default)]
pub struct InMemorySensors {
    states: Mutex<HashMap<String, String>>,
    history: Mutex<HashMap<String, Vec<HistorySample>>>,
}

impl InMemorySensors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, entity_id: &str, state: impl ToString) {
        self.states
            .lock()
            .insert(entity_id.to_string(), state.to_string());
    }

    pub fn push_sample(&self, entity_id: &str, timestamp: DateTime<Utc>, state: impl ToString) {
        let mut history = self.history.lock();
        let series = history.entry(entity_id.to_string()).or_default();
        series.push(HistorySample {
            timestamp,
            state: state.to_string(),
        });
        series.sort_by_key(|s| s.timestamp);
    }
}

#[async_trait]
impl StateSource for InMemorySensors {
    async fn state(&self, entity_id: &str) -> Result<String, SensorError> {
        self.states
            .lock()
            .get(entity_id)
            .cloned()
            .ok_or_else(|| SensorError::NotFound(entity_id.to_string()))
    }
}

#[async_trait]
impl HistorySource for InMemorySensors {
    async fn history(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistorySample>, SensorError> {
        let history = self.history.lock();
        let Some(series) = history.get(entity_id) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        if let Some(before) = series.iter().rev().find(|s| s.timestamp < start) {
            out.push(HistorySample {
                timestamp: start,
                state: before.state.clone(),
            });
        }
        out.extend(
            series
                .iter()
                .filter(|s| s.timestamp >= start && s.timestamp <= end)
                .cloned(),
        );
        Ok(out)
    }
}
