use anyhow::Result;
use pv_water_heating_controller::{config, controller, forecast, host, telemetry, timer};
use config::Config;
use controller::{ManagerController, ManagerHandle};
use std::sync::Arc;
use std::time::Duration;
use telemetry::init_tracing;
use timer::{Clock, SystemClock, TokioTimers};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = Config::load()?;
    if cfg.host.token.is_empty() {
        warn!("no host access token configured, requests will be rejected");
    }

    let tz = cfg.manager.timezone;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(tz));
    let ha = Arc::new(host::HomeAssistantClient::new(&cfg.host, &cfg.entities)?);
    let (timers, timers_rx) = TokioTimers::new(clock.clone());
    let (handle, events_rx) = ManagerHandle::channel();

    if let Some(fc) = &cfg.forecast {
        let provider = Arc::new(forecast::VrmForecastClient::new(fc, tz)?);
        forecast::spawn_refresh(
            provider,
            clock.clone(),
            tz,
            Duration::from_secs(fc.refresh_minutes * 60),
            handle.clone(),
        );
    } else {
        info!("no forecast source configured, automatic mode unavailable");
    }

    let watch_every = Duration::from_secs(cfg.host.watch_seconds);
    let grid_handle = handle.clone();
    host::spawn_state_watch(
        ha.clone(),
        cfg.entities.grid_lost.clone(),
        watch_every,
        false,
        move |state| grid_handle.grid_state(state),
    );
    if cfg.host.follow_controls {
        // current helper values arrive after start-up and take over from [controls]
        host::spawn_control_watches(ha.clone(), &cfg.entities, watch_every, handle.clone());
    }

    info!(
        base_url = %cfg.host.base_url,
        mode = %cfg.controls.mode,
        %tz,
        "starting PV water heating controller"
    );

    let manager = ManagerController::new(
        cfg,
        ha.clone(),
        ha.clone(),
        ha.clone(),
        ha,
        Arc::new(timers),
        clock,
    );
    manager
        .run(events_rx, timers_rx, telemetry::shutdown_signal())
        .await;

    drop(handle);
    warn!("shutdown complete");
    Ok(())
}
