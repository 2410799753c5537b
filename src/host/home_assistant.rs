use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use strum::IntoEnumIterator;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{EntitiesConfig, HostConfig};
use super::StatusSink;
use crate::domain::{ActuatorError, BoilerControls, BoilerMode, ManagerStatus};
use crate::forecast::ForecastDay;
use crate::sensors::{HistorySample, HistorySource, SensorError, StateSource};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("host request failed: {0}")]
    Request(#[from] reqwest_middleware::Error),
    #[error("host response unreadable: {0}")]
    Body(#[from] reqwest::Error),
    #[error("entity not found: {0}")]
    EntityNotFound(String),
    #[error("host rejected the access token")]
    Unauthorized,
    #[error("host API error: HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed host response: {0}")]
    Malformed(String),
}

impl From<HostError> for SensorError {
    fn from(e: HostError) -> Self {
        match e {
            HostError::EntityNotFound(id) => SensorError::NotFound(id),
            other => SensorError::Host(other.to_string()),
        }
    }
}

impl From<HostError> for ActuatorError {
    fn from(e: HostError) -> Self {
        match e {
            HostError::Request(_) | HostError::Body(_) => ActuatorError::Unreachable(e.to_string()),
            other => ActuatorError::Rejected(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EntityState {
    state: String,
}

#[derive(Debug, Deserialize)]
struct HistoryState {
    state: String,
    last_changed: DateTime<Utc>,
}

/// Home Assistant REST API adapter
#[derive(Clone)]
pub struct HomeAssistantClient {
    base_url: String,
    token: String,
    client: ClientWithMiddleware,
    thermostat: String,
    mode_select: String,
    status_entity: String,
    forecast_today: String,
    forecast_tomorrow: String,
}

impl HomeAssistantClient {
    pub fn new(cfg: &HostConfig, entities: &EntitiesConfig) -> Result<Self, HostError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(cfg.max_retries);
        let client = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        info!(base_url = %cfg.base_url, "home assistant client ready");
        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            token: cfg.token.clone(),
            client,
            thermostat: entities.boiler_thermostat.clone(),
            mode_select: entities.boiler_mode_select.clone(),
            status_entity: entities.manager_status.clone(),
            forecast_today: entities.forecast_today.clone(),
            forecast_tomorrow: entities.forecast_tomorrow.clone(),
        })
    }

    async fn check(resp: reqwest::Response, entity_id: &str) -> Result<reqwest::Response, HostError> {
        match resp.status() {
            s if s.is_success() => Ok(resp),
            StatusCode::NOT_FOUND => Err(HostError::EntityNotFound(entity_id.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(HostError::Unauthorized),
            status => Err(HostError::Status {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            }),
        }
    }

    pub async fn get_state(&self, entity_id: &str) -> Result<String, HostError> {
        let url = format!("{}/api/states/{}", self.base_url, entity_id);
        let resp = self.client.get(url).bearer_auth(&self.token).send().await?;
        let body = Self::check(resp, entity_id).await?.text().await?;
        let state: EntityState =
            serde_json::from_str(&body).map_err(|e| HostError::Malformed(e.to_string()))?;
        debug!(entity_id, state = %state.state, "entity state");
        Ok(state.state)
    }

    pub async fn get_history(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistorySample>, HostError> {
        let url = format!(
            "{}/api/history/period/{}",
            self.base_url,
            start.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .query(&[
                ("filter_entity_id", entity_id.to_string()),
                ("end_time", end.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("minimal_response", String::new()),
                ("no_attributes", String::new()),
            ])
            .send()
            .await?;
        let body = Self::check(resp, entity_id).await?.text().await?;
        let series: Vec<Vec<HistoryState>> =
            serde_json::from_str(&body).map_err(|e| HostError::Malformed(e.to_string()))?;

        let samples: Vec<HistorySample> = series
            .into_iter()
            .next()
            .unwrap_or_default()
            .into_iter()
            .map(|h| HistorySample {
                timestamp: h.last_changed,
                state: h.state,
            })
            .collect();
        debug!(entity_id, samples = samples.len(), "entity history");
        Ok(samples)
    }

    /// POST `/api/states/{entity_id}`: create or overwrite an entity's state.
    pub async fn set_state(&self, entity_id: &str, state: &str, attributes: Value) -> Result<(), HostError> {
        let url = format!("{}/api/states/{}", self.base_url, entity_id);
        let body = json!({ "state": state, "attributes": attributes });
        let payload = serde_json::to_vec(&body).map_err(|e| HostError::Malformed(e.to_string()))?;
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await?;
        Self::check(resp, entity_id).await?;
        debug!(entity_id, state, "entity state published");
        Ok(())
    }

    /// POST `/api/services/{domain}/{service}` and wait for the acknowledgement.
    pub async fn call_service(&self, domain: &str, service: &str, data: Value) -> Result<(), HostError> {
        let url = format!("{}/api/services/{}/{}", self.base_url, domain, service);
        let entity_id = data
            .get("entity_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let payload = serde_json::to_vec(&data).map_err(|e| HostError::Malformed(e.to_string()))?;
        debug!(domain, service, %data, "calling service");
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await?;
        Self::check(resp, &entity_id).await?;
        Ok(())
    }
}

#[async_trait]
impl StateSource for HomeAssistantClient {
    async fn state(&self, entity_id: &str) -> Result<String, SensorError> {
        Ok(self.get_state(entity_id).await?)
    }
}

#[async_trait]
impl HistorySource for HomeAssistantClient {
    async fn history(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistorySample>, SensorError> {
        Ok(self.get_history(entity_id, start, end).await?)
    }
}

#[async_trait]
impl BoilerControls for HomeAssistantClient {
    async fn set_temperature(&self, temperature_c: f64) -> Result<(), ActuatorError> {
        let data = json!({ "entity_id": self.thermostat, "temperature": temperature_c });
        Ok(self.call_service("climate", "set_temperature", data).await?)
    }

    async fn set_mode(&self, mode: BoilerMode) -> Result<(), ActuatorError> {
        let data = json!({ "entity_id": self.mode_select, "option": mode.as_ref() });
        Ok(self.call_service("select", "select_option", data).await?)
    }
}

#[async_trait]
impl StatusSink for HomeAssistantClient {
    async fn publish_status(&self, status: ManagerStatus) -> Result<(), HostError> {
        let options: Vec<String> = ManagerStatus::iter().map(|s| s.to_string()).collect();
        let attributes = json!({
            "friendly_name": "Manager Status",
            "device_class": "enum",
            "icon": "mdi:water-boiler",
            "options": options,
        });
        self.set_state(&self.status_entity, status.as_ref(), attributes).await
    }

    async fn publish_forecast(&self, day: ForecastDay, date: NaiveDate, wh: f64) -> Result<(), HostError> {
        let (entity_id, name) = match day {
            ForecastDay::Today => (&self.forecast_today, "PV generation forecast today"),
            ForecastDay::Tomorrow => (&self.forecast_tomorrow, "PV generation forecast tomorrow"),
        };
        let attributes = json!({
            "friendly_name": name,
            "device_class": "energy",
            "unit_of_measurement": "Wh",
            "icon": "mdi:solar-power",
            "date": date.to_string(),
        });
        let state = (wh.round() as i64).to_string();
        self.set_state(entity_id, &state, attributes).await
    }
}
