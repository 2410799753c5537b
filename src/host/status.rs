use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;

use super::HostError;
use crate::domain::ManagerStatus;
use crate::forecast::ForecastDay;

/// Where the manager reports what it is doing to the operator
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish_status(&self, status: ManagerStatus) -> Result<(), HostError>;

    /// Publish the PV forecast for `day`, which covers local `date`.
    async fn publish_forecast(&self, day: ForecastDay, date: NaiveDate, wh: f64) -> Result<(), HostError>;
}

/// Update recorded by [`RecordingStatus`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatusUpdate {
    Status(ManagerStatus),
    Forecast(ForecastDay, f64),
}

/// In-memory sink that keeps every update, for dry runs and tests.
#[derive(Debug, Default)]
pub struct RecordingStatus {
    updates: Mutex<Vec<StatusUpdate>>,
    fail: Mutex<bool>,
}

impl RecordingStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().clone()
    }

    pub fn statuses(&self) -> Vec<ManagerStatus> {
        self.updates
            .lock()
            .iter()
            .filter_map(|u| match u {
                StatusUpdate::Status(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    fn record(&self, update: StatusUpdate) -> Result<(), HostError> {
        if *self.fail.lock() {
            return Err(HostError::Status {
                status: 503,
                body: "simulated failure".into(),
            });
        }
        self.updates.lock().push(update);
        Ok(())
    }
}

#[async_trait]
impl StatusSink for RecordingStatus {
    async fn publish_status(&self, status: ManagerStatus) -> Result<(), HostError> {
        self.record(StatusUpdate::Status(status))
    }

    async fn publish_forecast(&self, day: ForecastDay, _date: NaiveDate, wh: f64) -> Result<(), HostError> {
        self.record(StatusUpdate::Forecast(day, wh))
    }
}
