//! Complete nights driven through the manager with a hand-moved clock.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use pv_water_heating_controller::config::{Config, ForecastConfig};
use pv_water_heating_controller::controller::{ManagerController, ManagerEvent, PreheatPhase};
use pv_water_heating_controller::domain::{
    BoilerCommand, BoilerMode, ManagerMode, ManagerStatus, Phase, RecordingBoiler,
};
use pv_water_heating_controller::forecast::ForecastDay;
use pv_water_heating_controller::host::RecordingStatus;
use pv_water_heating_controller::sensors::InMemorySensors;
use pv_water_heating_controller::timer::{Clock, ManualClock, ManualTimers, TimerAction};
use std::sync::Arc;

fn local(day: u32, h: u32, m: u32) -> DateTime<FixedOffset> {
    chrono_tz::Europe::Bratislava
        .with_ymd_and_hms(2024, 3, day, h, m, 0)
        .unwrap()
        .fixed_offset()
}

fn march(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
}

struct House {
    manager: ManagerController,
    sensors: Arc<InMemorySensors>,
    boiler: Arc<RecordingBoiler>,
    status: Arc<RecordingStatus>,
    timers: Arc<ManualTimers>,
    clock: Arc<ManualClock>,
    cfg: Config,
}

impl House {
    fn new(mode: ManagerMode) -> Self {
        let mut cfg = Config::default();
        cfg.grid.phase = Some(Phase::L1);
        cfg.controls.mode = mode;
        cfg.controls.night_preheat = true;
        cfg.controls.preheat_target_c = 50.0;
        cfg.controls.morning_time = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        cfg.forecast = Some(ForecastConfig {
            base_url: "http://vrm.invalid".into(),
            installation_id: "1".into(),
            token: "token".into(),
            refresh_minutes: 60,
        });

        let sensors = Arc::new(InMemorySensors::new());
        let e = &cfg.entities;
        sensors.set_state(&e.boiler_connection, "Connected");
        sensors.set_state(&e.grid_lost, "0");
        sensors.set_state(&e.boiler_heating_status, "off");
        sensors.set_state(&e.boiler_temperature, "38");
        sensors.set_state(&e.battery_soc, "50");
        sensors.set_state(&e.grid_power_for(Phase::L1), "40");
        sensors.set_state(&e.critical_load_for(Phase::L1), "350");

        let boiler = Arc::new(RecordingBoiler::new());
        let status = Arc::new(RecordingStatus::new());
        let timers = Arc::new(ManualTimers::new());
        let clock = Arc::new(ManualClock::new(local(10, 18, 0)));
        let manager = ManagerController::new(
            cfg.clone(),
            sensors.clone(),
            sensors.clone(),
            boiler.clone(),
            status.clone(),
            timers.clone(),
            clock.clone(),
        );
        Self {
            manager,
            sensors,
            boiler,
            status,
            timers,
            clock,
            cfg,
        }
    }

    /// Move the clock to the one-shot timer's due time and deliver it.
    async fn fire_at_due(&mut self, action: TimerAction) {
        let due = self.timers.due_at(action).expect("timer scheduled");
        self.clock.set(due);
        let fired = self.timers.fire(action).expect("timer fires");
        self.manager.handle_timer(fired).await;
    }

    async fn tick(&mut self) {
        let fired = self.timers.fire(TimerAction::Tick).expect("ticks running");
        self.manager.handle_timer(fired).await;
    }

    fn sunny_history(&self) {
        let at = (self.clock.now() - chrono::Duration::seconds(5)).with_timezone(&Utc);
        let e = &self.cfg.entities;
        self.sensors.push_sample(&e.critical_load_for(Phase::L1), at, "350");
        self.sensors.push_sample(&e.pv_power, at, "4000");
    }
}

#[tokio::test]
async fn manual_night_heats_until_the_morning() {
    let mut house = House::new(ManagerMode::Manual);
    house.manager.start().await;
    assert_eq!(house.manager.session().status, ManagerStatus::Running);

    house.tick().await;
    assert_eq!(house.manager.preheat_phase(), PreheatPhase::CalcPlanned);
    assert!(house.boiler.commands().is_empty());

    house.fire_at_due(TimerAction::PreheatCalc).await;
    assert_eq!(house.manager.preheat_phase(), PreheatPhase::StartPlanned);
    let start = house.timers.due_at(TimerAction::PreheatStart).unwrap();
    assert!(start > local(11, 3, 0) && start < local(11, 5, 0), "start at {start}");

    house.fire_at_due(TimerAction::PreheatStart).await;
    assert_eq!(house.manager.preheat_phase(), PreheatPhase::PreheatActive);
    assert!(house.manager.boiler_commanded_on());
    assert_eq!(
        house.boiler.commands(),
        vec![
            BoilerCommand::SetTemperature(50.0),
            BoilerCommand::SetMode(BoilerMode::Heat)
        ]
    );
    assert_eq!(house.timers.due_at(TimerAction::PreheatEnd), Some(local(11, 6, 0)));

    // surplus hysteresis stays out while pre-heating owns the boiler
    house.sunny_history();
    house.tick().await;
    assert_eq!(house.boiler.commands().len(), 2);

    house.fire_at_due(TimerAction::PreheatEnd).await;
    assert_eq!(house.manager.preheat_phase(), PreheatPhase::Idle);
    assert!(!house.manager.boiler_commanded_on());
    assert_eq!(house.boiler.last_mode(), Some(BoilerMode::Antifreeze));
}

#[tokio::test]
async fn automatic_night_without_enough_forecast_does_not_heat() {
    let mut house = House::new(ManagerMode::Automatic);
    house.manager.start().await;
    assert_eq!(house.manager.session().mode, ManagerMode::Automatic);

    house.tick().await;
    house.fire_at_due(TimerAction::PreheatCalc).await;
    house
        .manager
        .handle_event(ManagerEvent::Forecast(ForecastDay::Today, march(11), 500.0))
        .await;
    house.fire_at_due(TimerAction::PreheatStart).await;

    assert_eq!(house.manager.preheat_phase(), PreheatPhase::Cancelled);
    assert!(house.boiler.commands().is_empty());

    house.fire_at_due(TimerAction::PreheatEnd).await;
    assert_eq!(house.manager.preheat_phase(), PreheatPhase::Idle);
    assert!(house.boiler.commands().is_empty());
}

#[tokio::test]
async fn automatic_night_with_sunny_forecast_heats() {
    let mut house = House::new(ManagerMode::Automatic);
    house.manager.start().await;
    house
        .manager
        .handle_event(ManagerEvent::Forecast(ForecastDay::Tomorrow, march(11), 20_000.0))
        .await;

    house.tick().await;
    house.fire_at_due(TimerAction::PreheatCalc).await;
    // published again after midnight, now as today's figure
    house
        .manager
        .handle_event(ManagerEvent::Forecast(ForecastDay::Today, march(11), 20_000.0))
        .await;
    house.fire_at_due(TimerAction::PreheatStart).await;

    assert_eq!(house.manager.preheat_phase(), PreheatPhase::PreheatActive);
    assert_eq!(house.boiler.mode_commands(BoilerMode::Heat), 1);
}

#[tokio::test]
async fn turning_the_manager_off_mid_preheat_stops_the_boiler_once() {
    let mut house = House::new(ManagerMode::Manual);
    house.manager.start().await;
    house.tick().await;
    house.fire_at_due(TimerAction::PreheatCalc).await;
    house.fire_at_due(TimerAction::PreheatStart).await;
    assert!(house.manager.boiler_commanded_on());

    house
        .manager
        .handle_event(ManagerEvent::SelectMode(ManagerMode::Off))
        .await;
    assert_eq!(house.manager.session().status, ManagerStatus::Off);
    assert_eq!(house.manager.preheat_phase(), PreheatPhase::Idle);
    assert_eq!(house.boiler.mode_commands(BoilerMode::Antifreeze), 1);
    assert!(house.timers.pending().is_empty());
    assert_eq!(
        house.status.statuses(),
        vec![ManagerStatus::Running, ManagerStatus::Off]
    );
}

#[tokio::test]
async fn warm_tank_skips_the_night() {
    let mut house = House::new(ManagerMode::Manual);
    house
        .sensors
        .set_state(&house.cfg.entities.boiler_temperature, "58");
    house.manager.start().await;
    house.tick().await;
    house.fire_at_due(TimerAction::PreheatCalc).await;

    assert_eq!(house.manager.preheat_phase(), PreheatPhase::Cancelled);
    house.fire_at_due(TimerAction::PreheatEnd).await;
    assert_eq!(house.manager.preheat_phase(), PreheatPhase::Idle);
    assert!(house.boiler.commands().is_empty());
}
