use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ForecastConfig;
use crate::controller::ManagerHandle;
use crate::timer::Clock;

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("forecast request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("forecast API error: HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed forecast response: {0}")]
    Malformed(String),
}

/// Calendar day a forecast covers, in the installation's timezone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForecastDay {
    Today,
    Tomorrow,
}

impl ForecastDay {
    pub fn date(self, now: DateTime<FixedOffset>, tz: Tz) -> NaiveDate {
        let today = now.with_timezone(&tz).date_naive();
        match self {
            ForecastDay::Today => today,
            ForecastDay::Tomorrow => today + ChronoDuration::days(1),
        }
    }
}

/// Unix timestamps of local 00:00:00 and 23:59:59 of `date`.
pub fn day_range(date: NaiveDate, tz: Tz) -> (i64, i64) {
    let start = local_timestamp(tz, date, NaiveTime::default());
    let end = local_timestamp(
        tz,
        date,
        NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default(),
    );
    (start, end)
}

fn local_timestamp(tz: Tz, date: NaiveDate, time: NaiveTime) -> i64 {
    let naive = date.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
        // nonexistent local time: fall back to reading it as UTC
        .unwrap_or_else(|| naive.and_utc().timestamp())
}

/// Day-ahead PV yield source
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    /// Forecast PV yield in Wh for the local calendar `date`.
    async fn forecast_wh(&self, date: NaiveDate) -> Result<f64, ForecastError>;
}

/// Victron VRM installation stats API
pub struct VrmForecastClient {
    base_url: String,
    installation_id: String,
    token: String,
    client: reqwest::Client,
    tz: Tz,
}

impl VrmForecastClient {
    pub fn new(cfg: &ForecastConfig, tz: Tz) -> Result<Self, ForecastError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static("pv-water-heating-controller/0.2"),
        );
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .default_headers(headers)
            .build()?;
        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            installation_id: cfg.installation_id.clone(),
            token: cfg.token.clone(),
            client,
            tz,
        })
    }
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    totals: Option<StatsTotals>,
}

#[derive(Debug, Deserialize)]
struct StatsTotals {
    solar_yield_forecast: Option<f64>,
}

#[async_trait]
impl ForecastProvider for VrmForecastClient {
    async fn forecast_wh(&self, date: NaiveDate) -> Result<f64, ForecastError> {
        let (start, end) = day_range(date, self.tz);
        let url = format!(
            "{}/v2/installations/{}/stats",
            self.base_url, self.installation_id
        );
        let resp = self
            .client
            .get(url)
            .query(&[
                ("type", "forecast".to_string()),
                ("start", start.to_string()),
                ("end", end.to_string()),
                ("interval", "days".to_string()),
            ])
            .header("x-authorization", format!("Token {}", self.token))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ForecastError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let stats: StatsResponse =
            serde_json::from_str(&body).map_err(|e| ForecastError::Malformed(e.to_string()))?;
        let wh = stats
            .totals
            .and_then(|t| t.solar_yield_forecast)
            .ok_or_else(|| ForecastError::Malformed("missing totals.solar_yield_forecast".into()))?;
        debug!(%date, start, end, wh, "forecast fetched");
        Ok(wh)
    }
}

/// Fetch today and tomorrow as seen at `now` and publish them to the
/// manager. Failures keep the old value.
pub async fn refresh_once(
    provider: &dyn ForecastProvider,
    now: DateTime<FixedOffset>,
    tz: Tz,
    handle: &ManagerHandle,
) {
    for day in [ForecastDay::Today, ForecastDay::Tomorrow] {
        let date = day.date(now, tz);
        match provider.forecast_wh(date).await {
            Ok(wh) => {
                info!(?day, %date, wh, "forecast updated");
                handle.forecast(day, date, wh);
            }
            Err(e) => warn!(?day, %date, error = %e, "forecast refresh failed, keeping previous value"),
        }
    }
}

/// Time until the next refresh: `every`, or sooner if local 00:01 comes first.
pub fn next_refresh_in(now: DateTime<FixedOffset>, tz: Tz, every: Duration) -> Duration {
    let tomorrow = now.with_timezone(&tz).date_naive() + ChronoDuration::days(1);
    let rollover = local_timestamp(
        tz,
        tomorrow,
        NaiveTime::from_hms_opt(0, 1, 0).unwrap_or_default(),
    );
    let until_rollover = (rollover - now.timestamp()).max(1) as u64;
    every.min(Duration::from_secs(until_rollover))
}

/// Refresh at start-up, every `every` and just after local midnight.
pub fn spawn_refresh(
    provider: Arc<dyn ForecastProvider>,
    clock: Arc<dyn Clock>,
    tz: Tz,
    every: Duration,
    handle: ManagerHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            refresh_once(provider.as_ref(), clock.now(), tz, &handle).await;
            if handle.is_closed() {
                break;
            }
            tokio::time::sleep(next_refresh_in(clock.now(), tz, every)).await;
        }
    })
}
