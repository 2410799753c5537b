pub mod hysteresis;
pub mod preheat;
pub mod session;

use chrono::{NaiveDate, NaiveTime};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::domain::{
    BoilerActuator, BoilerConnection, BoilerControls, GridState, ManagerMode, ManagerStatus, Phase,
};
use crate::forecast::{ForecastDay, ForecastEnergyBalancer};
use crate::host::StatusSink;
use crate::sensors::{HistorySource, SensorAggregator, SensorSnapshot, StateSource};
use crate::timer::{Clock, TimerAction, TimerFired, TimerHandle, Timers};

pub use hysteresis::{
    decide, BoilerHysteresisController, HysteresisDecision, HysteresisInputs, HysteresisLimits,
    OffReason,
};
pub use preheat::{NightPreheatScheduler, PreheatContext, PreheatPhase, PreheatState};
pub use session::{DatedForecast, ForecastValues, SessionState};

/// How long the transport may stay down before the manager is turned off
pub const TRANSPORT_GRACE: Duration = Duration::from_secs(30);

/// Changes reported by the host and background tasks
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    SelectMode(ManagerMode),
    NightPreheatSwitch(bool),
    DayTarget(f64),
    PreheatTarget(f64),
    MorningTime(NaiveTime),
    /// Raw state of the grid-lost entity
    GridState(String),
    TransportConnection(bool),
    /// Topic of a message received over the transport
    TransportTopic(String),
    /// Forecast Wh for `day`, fetched for the local date given
    Forecast(ForecastDay, NaiveDate, f64),
}

/// Cloneable sender into the manager's event loop
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl ManagerHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns `false` once the manager has stopped.
    pub fn send(&self, event: ManagerEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn select_mode(&self, mode: ManagerMode) -> bool {
        self.send(ManagerEvent::SelectMode(mode))
    }

    pub fn grid_state(&self, state: String) -> bool {
        self.send(ManagerEvent::GridState(state))
    }

    pub fn transport_connection(&self, connected: bool) -> bool {
        self.send(ManagerEvent::TransportConnection(connected))
    }

    pub fn forecast(&self, day: ForecastDay, date: NaiveDate, wh: f64) -> bool {
        self.send(ManagerEvent::Forecast(day, date, wh))
    }
}

/// Top-level orchestrator. Owns every piece of mutable state and is driven
/// one event at a time by [`ManagerController::run`].
pub struct ManagerController {
    cfg: Config,
    session: SessionState,
    aggregator: SensorAggregator,
    actuator: BoilerActuator,
    preheat: NightPreheatScheduler,
    hysteresis: BoilerHysteresisController,
    timers: Arc<dyn Timers>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn StatusSink>,
    /// Last status the sink accepted
    published: Option<ManagerStatus>,
    tick_timer: Option<TimerHandle>,
    grace_timer: Option<TimerHandle>,
}

impl ManagerController {
    pub fn new(
        cfg: Config,
        states: Arc<dyn StateSource>,
        history: Arc<dyn HistorySource>,
        controls: Arc<dyn BoilerControls>,
        sink: Arc<dyn StatusSink>,
        timers: Arc<dyn Timers>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let balancer = ForecastEnergyBalancer::new(
            cfg.boiler.clone(),
            cfg.battery.clone(),
            cfg.manager.temp_variable_c,
        );
        let preheat = NightPreheatScheduler::new(cfg.boiler.clone(), balancer, cfg.manager.timezone);
        let hysteresis = BoilerHysteresisController::new(HysteresisLimits::from_config(
            &cfg.boiler,
            &cfg.battery,
            &cfg.grid,
        ));
        Self {
            session: SessionState::new(&cfg),
            aggregator: SensorAggregator::new(states, history, clock.clone()),
            actuator: BoilerActuator::new(controls),
            preheat,
            hysteresis,
            timers,
            clock,
            sink,
            published: None,
            tick_timer: None,
            grace_timer: None,
            cfg,
        }
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn preheat_phase(&self) -> PreheatPhase {
        self.preheat.phase()
    }

    pub fn boiler_commanded_on(&self) -> bool {
        self.actuator.is_commanded_on()
    }

    /// Apply the configured mode. Leaves `Initializing` behind.
    pub async fn start(&mut self) {
        info!(mode = %self.cfg.controls.mode, phase = ?self.session.phase, "manager starting");
        self.select_mode(self.cfg.controls.mode).await;
        self.publish_status().await;
    }

    /// Push the status to the sink when it differs from the last one accepted.
    async fn publish_status(&mut self) {
        let status = self.session.status;
        if self.published == Some(status) {
            return;
        }
        match self.sink.publish_status(status).await {
            Ok(()) => self.published = Some(status),
            Err(e) => warn!(%status, error = %e, "failed to publish manager status"),
        }
    }

    /// Serve events and timer firings until `shutdown` resolves.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ManagerEvent>,
        mut fired: mpsc::UnboundedReceiver<TimerFired>,
        shutdown: impl Future<Output = ()>,
    ) {
        self.start().await;
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                Some(event) = events.recv() => self.handle_event(event).await,
                Some(f) = fired.recv() => self.handle_timer(f).await,
                else => break,
            }
        }
        self.stop();
    }

    /// Cancel every pending timer. The boiler is left as it is.
    pub fn stop(&mut self) {
        for timer in [self.tick_timer.take(), self.grace_timer.take()].into_iter().flatten() {
            timer.cancel();
        }
        if let Some(timer) = self.preheat.state().timer() {
            timer.cancel();
        }
        info!("manager stopped");
    }

    pub async fn handle_event(&mut self, event: ManagerEvent) {
        debug!(?event, "manager event");
        match event {
            ManagerEvent::SelectMode(mode) => self.select_mode(mode).await,
            ManagerEvent::NightPreheatSwitch(on) => self.set_night_preheat(on).await,
            ManagerEvent::DayTarget(temp) => self.set_day_target(temp).await,
            ManagerEvent::PreheatTarget(temp) => {
                self.session.preheat_target_c = self.cfg.boiler.clamp_temp(temp);
                info!(target_c = self.session.preheat_target_c, "pre-heat target changed");
            }
            ManagerEvent::MorningTime(time) => self.set_morning_time(time).await,
            ManagerEvent::GridState(state) => self.on_grid_state(&state).await,
            ManagerEvent::TransportConnection(connected) => self.on_transport(connected).await,
            ManagerEvent::TransportTopic(topic) => self.on_transport_topic(&topic),
            ManagerEvent::Forecast(day, date, wh) => {
                self.session.forecast.set(day, date, wh);
                if let Err(e) = self.sink.publish_forecast(day, date, wh).await {
                    warn!(?day, error = %e, "failed to publish forecast");
                }
            }
        }
        self.publish_status().await;
    }

    pub async fn handle_timer(&mut self, fired: TimerFired) {
        match fired.action {
            TimerAction::Tick => {
                if self.tick_timer.as_ref().is_some_and(|t| t.matches(&fired)) {
                    self.tick().await;
                }
            }
            TimerAction::TransportGrace => {
                if self.grace_timer.as_ref().is_some_and(|t| t.matches(&fired)) {
                    self.grace_timer = None;
                    self.on_transport_grace_expired().await;
                }
            }
            TimerAction::PreheatCalc | TimerAction::PreheatStart | TimerAction::PreheatEnd => {
                let mut ctx = PreheatContext {
                    session: &self.session,
                    aggregator: &self.aggregator,
                    actuator: &mut self.actuator,
                    timers: self.timers.as_ref(),
                    clock: self.clock.as_ref(),
                    entities: &self.cfg.entities,
                };
                self.preheat.on_timer(&fired, &mut ctx).await;
            }
        }
        self.publish_status().await;
    }

    /// One control cycle: connectivity, then night pre-heat planning, then
    /// surplus hysteresis unless pre-heating owns the boiler.
    pub async fn tick(&mut self) {
        let connection = self
            .aggregator
            .read_text(&self.cfg.entities.boiler_connection)
            .await
            .map(|s| BoilerConnection::from_state(&s))
            .unwrap_or(BoilerConnection::Disconnected);
        if connection == BoilerConnection::Disconnected {
            warn!("boiler disconnected");
            self.session.set_status(ManagerStatus::PausedBoilerDisconnected);
            return;
        }
        if self.session.status == ManagerStatus::PausedBoilerDisconnected {
            self.session.set_status(ManagerStatus::Running);
        }

        if self.cfg.manager.monitor_transport && !self.session.transport_connected {
            warn!("transport disconnected, tick skipped");
            return;
        }

        {
            let mut ctx = PreheatContext {
                session: &self.session,
                aggregator: &self.aggregator,
                actuator: &mut self.actuator,
                timers: self.timers.as_ref(),
                clock: self.clock.as_ref(),
                entities: &self.cfg.entities,
            };
            self.preheat.on_tick(&mut ctx);
        }
        self.session.component_loading = false;

        let Some(phase) = self.session.phase else {
            debug!("phase unknown, waiting for transport data");
            return;
        };
        if self.preheat.is_active() {
            return;
        }

        let snapshot = SensorSnapshot::collect(&self.aggregator, &self.cfg.entities, phase).await;
        if let Err(e) = self
            .hysteresis
            .run(&snapshot, &mut self.actuator, self.session.day_target_c)
            .await
        {
            error!(error = %e, "boiler command failed");
        }
    }

    pub async fn select_mode(&mut self, mode: ManagerMode) {
        if mode.is_forecast_driven() && self.cfg.forecast.is_none() {
            warn!("automatic mode needs a forecast source, selection ignored");
            return;
        }

        if mode == ManagerMode::Off {
            if self.session.status != ManagerStatus::Initializing {
                if let Some(timer) = self.tick_timer.take() {
                    timer.cancel();
                }
                self.preheat.cancel_all(&mut self.actuator).await;
                if self.actuator.is_commanded_on() {
                    if let Err(e) = self.actuator.turn_off().await {
                        error!(error = %e, "failed to turn boiler off");
                    }
                }
            }
            self.session.mode = ManagerMode::Off;
            self.session.set_status(ManagerStatus::Off);
            return;
        }

        if self.session.mode == ManagerMode::Off {
            if self.cfg.manager.monitor_transport && !self.session.transport_connected {
                warn!(%mode, "transport disconnected, manager stays off");
                self.session.set_status(ManagerStatus::OffMqttLost);
                return;
            }
            if self.session.status != ManagerStatus::Initializing {
                let grid = self
                    .aggregator
                    .read_text(&self.cfg.entities.grid_lost)
                    .await
                    .map(|s| GridState::from_state(&s))
                    .unwrap_or(GridState::Unknown);
                if grid != GridState::Available {
                    warn!(?grid, %mode, "grid not available, manager stays off");
                    self.session.set_status(ManagerStatus::OffGridLost);
                    return;
                }
            }

            let every = Duration::from_secs(self.cfg.manager.update_interval_seconds);
            self.tick_timer = Some(self.timers.schedule_every(every, TimerAction::Tick));
            self.session.set_status(ManagerStatus::Running);
        }

        info!(%mode, "manager mode selected");
        self.session.mode = mode;
    }

    async fn set_night_preheat(&mut self, on: bool) {
        self.session.night_preheat = on;
        info!(on, "night pre-heat switch");
        if !on {
            self.preheat.cancel_all(&mut self.actuator).await;
        }
    }

    async fn set_day_target(&mut self, temp: f64) {
        let temp = self.cfg.boiler.clamp_temp(temp);
        self.session.day_target_c = temp;
        info!(target_c = temp, "day target changed");
        if self.preheat.is_active() {
            return;
        }
        if let Err(e) = self.actuator.set_target(temp).await {
            error!(error = %e, "failed to push day target");
        }
    }

    async fn set_morning_time(&mut self, time: NaiveTime) {
        self.session.morning_time = time;
        info!(%time, "morning time changed");
        // nothing has been committed yet: re-plan against the new deadline on the next tick
        if matches!(
            self.preheat.phase(),
            PreheatPhase::CalcPlanned | PreheatPhase::StartPlanned
        ) {
            self.preheat.cancel_all(&mut self.actuator).await;
        }
    }

    async fn on_grid_state(&mut self, state: &str) {
        if self.cfg.manager.monitor_transport && !self.session.transport_connected {
            return;
        }
        if self.session.component_loading || self.session.mode == ManagerMode::Off {
            debug!(state, "grid state ignored");
            return;
        }
        match GridState::from_state(state) {
            GridState::Lost => {
                warn!("grid lost");
                self.select_mode(ManagerMode::Off).await;
                self.session.set_status(ManagerStatus::OffGridLost);
            }
            GridState::Unknown => {
                warn!(state, "grid state unknown");
                self.select_mode(ManagerMode::Off).await;
                self.session.set_status(ManagerStatus::OffGridUnknown);
            }
            GridState::Available => info!("grid back"),
        }
    }

    async fn on_transport(&mut self, connected: bool) {
        let was_connected = self.session.transport_connected;
        self.session.transport_connected = connected;

        if !was_connected && connected {
            info!("transport connection restored");
            if let Some(timer) = self.grace_timer.take() {
                timer.cancel();
            }
            if let Some(mode) = self.session.mode_before_transport_loss.take() {
                self.select_mode(mode).await;
                if mode == ManagerMode::Off {
                    self.session.set_status(ManagerStatus::Off);
                } else if self.session.mode != ManagerMode::Off {
                    self.session.set_status(ManagerStatus::Running);
                }
            }
        } else if was_connected && !connected {
            warn!(grace_s = TRANSPORT_GRACE.as_secs(), "transport connection lost");
            self.session.mode_before_transport_loss = Some(self.session.mode);
            if self.session.mode == ManagerMode::Off {
                self.session.set_status(ManagerStatus::OffMqttLost);
            } else {
                self.session.set_status(ManagerStatus::RunningMqttLost);
            }
            let at = self.clock.now() + chrono::Duration::seconds(TRANSPORT_GRACE.as_secs() as i64);
            self.grace_timer = Some(self.timers.schedule_at(at, TimerAction::TransportGrace));
        }
    }

    async fn on_transport_grace_expired(&mut self) {
        warn!(grace_s = TRANSPORT_GRACE.as_secs(), "transport down for the grace period, manager off");
        self.select_mode(ManagerMode::Off).await;
        self.session.set_status(ManagerStatus::OffMqttLost);
    }

    fn on_transport_topic(&mut self, topic: &str) {
        self.session.component_loading = false;
        if self.session.phase.is_some() {
            return;
        }
        if let Some(phase) = Phase::from_topic(topic) {
            info!(%phase, "phase discovered");
            self.session.phase = Some(phase);
        }
    }
}
