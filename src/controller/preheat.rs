//! # Night pre-heat scheduler
//!
//! Plans, validates, starts and ends overnight water heating so the tank
//! reaches the pre-heat target by the morning deadline.
//!
//! ```text
//! Idle ──tick──▶ CalcPlanned ──calc──▶ StartPlanned ──start──▶ PreheatActive ──end──▶ Idle
//!                     │                    │  ▲                                   ▲
//!                     │                    └──┘ too early: re-arm start           │
//!                     └──────────────┬─────┘                                      │
//!                                    ▼                                            │
//!                                Cancelled ───────────────end (no actuation)──────┘
//! ```
//!
//! Every non-idle state owns the deadline of its cycle and the one timer that
//! moves it forward, so only one phase can ever be pending. Firings from a
//! timer that no longer belongs to the current state are ignored.

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone};
use chrono_tz::Tz;
use tracing::{debug, error, info, warn};

use super::session::SessionState;
use crate::config::{BoilerConfig, EntitiesConfig};
use crate::domain::{heat_demand, BoilerActuator, BoilerConnection, HeatDemand};
use crate::forecast::ForecastEnergyBalancer;
use crate::sensors::{SensorAggregator, Statistic};
use crate::timer::{Clock, TimerAction, TimerFired, TimerHandle, Timers};

/// Candidate times this close to now count as already passed.
pub const GUARD_BAND_MINUTES: i64 = 5;
/// Water temperature assumed when planning a cycle, and when no reading is available
pub const REFERENCE_LOW_TEMP_C: f64 = 1.0;
/// Slack added to heating durations when planning
pub const PLANNING_MARGIN_MINUTES: i64 = 60;
/// Window over yesterday's night used to estimate the coldest tank
pub const YESTERDAY_WINDOW_MINUTES: u64 = 300;
/// Passive loss expected between the start check and the deadline
pub const PASSIVE_LOSS_RESERVE_C: f64 = 3.0;
/// Lead time tolerated before a start is pushed back
pub const RESCHEDULE_TOLERANCE_MINUTES: i64 = 60;

fn planning_margin() -> Duration {
    Duration::minutes(PLANNING_MARGIN_MINUTES)
}

#[derive(Debug, Clone)]
pub enum PreheatState {
    Idle,
    CalcPlanned {
        deadline: DateTime<FixedOffset>,
        timer: TimerHandle,
    },
    StartPlanned {
        deadline: DateTime<FixedOffset>,
        timer: TimerHandle,
    },
    PreheatActive {
        deadline: DateTime<FixedOffset>,
        timer: TimerHandle,
    },
    /// Skipped for this cycle; the end firing only cleans up.
    Cancelled {
        deadline: DateTime<FixedOffset>,
        timer: TimerHandle,
    },
}

/// Phase names for logs and assertions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreheatPhase {
    Idle,
    CalcPlanned,
    StartPlanned,
    PreheatActive,
    Cancelled,
}

impl PreheatState {
    pub fn phase(&self) -> PreheatPhase {
        match self {
            PreheatState::Idle => PreheatPhase::Idle,
            PreheatState::CalcPlanned { .. } => PreheatPhase::CalcPlanned,
            PreheatState::StartPlanned { .. } => PreheatPhase::StartPlanned,
            PreheatState::PreheatActive { .. } => PreheatPhase::PreheatActive,
            PreheatState::Cancelled { .. } => PreheatPhase::Cancelled,
        }
    }

    pub fn deadline(&self) -> Option<DateTime<FixedOffset>> {
        match self {
            PreheatState::Idle => None,
            PreheatState::CalcPlanned { deadline, .. }
            | PreheatState::StartPlanned { deadline, .. }
            | PreheatState::PreheatActive { deadline, .. }
            | PreheatState::Cancelled { deadline, .. } => Some(*deadline),
        }
    }

    pub(crate) fn timer(&self) -> Option<&TimerHandle> {
        match self {
            PreheatState::Idle => None,
            PreheatState::CalcPlanned { timer, .. }
            | PreheatState::StartPlanned { timer, .. }
            | PreheatState::PreheatActive { timer, .. }
            | PreheatState::Cancelled { timer, .. } => Some(timer),
        }
    }
}

/// Collaborators a scheduler step needs, borrowed from the manager.
pub struct PreheatContext<'a> {
    pub session: &'a SessionState,
    pub aggregator: &'a SensorAggregator,
    pub actuator: &'a mut BoilerActuator,
    pub timers: &'a dyn Timers,
    pub clock: &'a dyn Clock,
    pub entities: &'a EntitiesConfig,
}

pub struct NightPreheatScheduler {
    state: PreheatState,
    boiler: BoilerConfig,
    balancer: ForecastEnergyBalancer,
    tz: Tz,
}

/// Whether `candidate` is at or before now, or within the guard band of it.
pub fn planned_to_past(candidate: DateTime<FixedOffset>, now: DateTime<FixedOffset>) -> bool {
    candidate <= now + Duration::minutes(GUARD_BAND_MINUTES)
}

/// Next occurrence of `morning` strictly after `after`, in `tz`.
pub fn next_deadline(after: DateTime<FixedOffset>, morning: NaiveTime, tz: Tz) -> DateTime<FixedOffset> {
    let mut date = after.with_timezone(&tz).date_naive();
    loop {
        let naive = date.and_time(morning);
        let local = tz
            .from_local_datetime(&naive)
            .earliest()
            // morning time falls into a DST gap: use the first valid instant after it
            .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest());
        if let Some(candidate) = local.map(|dt| dt.fixed_offset()) {
            if candidate > after {
                return candidate;
            }
        }
        date += Duration::days(1);
    }
}

impl NightPreheatScheduler {
    pub fn new(boiler: BoilerConfig, balancer: ForecastEnergyBalancer, tz: Tz) -> Self {
        Self {
            state: PreheatState::Idle,
            boiler,
            balancer,
            tz,
        }
    }

    pub fn state(&self) -> &PreheatState {
        &self.state
    }

    pub fn phase(&self) -> PreheatPhase {
        self.state.phase()
    }

    /// Pre-heating is running and owns the boiler.
    pub fn is_active(&self) -> bool {
        matches!(self.state, PreheatState::PreheatActive { .. })
    }

    fn demand(&self, from_c: f64, to_c: f64) -> HeatDemand {
        heat_demand(self.boiler.power_w, self.boiler.volume_l, from_c, to_c)
    }

    /// Idle step of the control tick: plan a new cycle when the switch is on.
    pub fn on_tick(&mut self, ctx: &mut PreheatContext<'_>) {
        if !matches!(self.state, PreheatState::Idle) || !ctx.session.night_preheat {
            return;
        }

        let now = ctx.clock.now();
        let target = ctx.session.preheat_target_c;
        let needed = self.demand(REFERENCE_LOW_TEMP_C, target).duration() + planning_margin();

        let mut deadline = next_deadline(now, ctx.session.morning_time, self.tz);
        let mut trigger = deadline - needed;
        if planned_to_past(trigger, now) {
            deadline = next_deadline(deadline, ctx.session.morning_time, self.tz);
            trigger = deadline - needed;
        }

        let timer = ctx.timers.schedule_at(trigger, TimerAction::PreheatCalc);
        info!(%deadline, %trigger, target_c = target, "night pre-heat planned");
        self.state = PreheatState::CalcPlanned { deadline, timer };
    }

    /// Route a timer firing. Stale firings are dropped.
    pub async fn on_timer(&mut self, fired: &TimerFired, ctx: &mut PreheatContext<'_>) {
        let Some(timer) = self.state.timer() else {
            debug!(?fired, "timer fired while idle, ignored");
            return;
        };
        if !timer.matches(fired) {
            debug!(?fired, "stale pre-heat timer ignored");
            return;
        }
        timer.cancel();

        match (&self.state, fired.action) {
            (PreheatState::CalcPlanned { deadline, .. }, TimerAction::PreheatCalc) => {
                let deadline = *deadline;
                self.calculate(deadline, ctx).await;
            }
            (PreheatState::StartPlanned { deadline, .. }, TimerAction::PreheatStart) => {
                let deadline = *deadline;
                self.start(deadline, ctx).await;
            }
            (PreheatState::PreheatActive { .. } | PreheatState::Cancelled { .. }, TimerAction::PreheatEnd) => {
                self.end(ctx).await;
            }
            (state, action) => {
                warn!(phase = ?state.phase(), ?action, "unexpected pre-heat timer");
            }
        }
    }

    async fn calculate(&mut self, deadline: DateTime<FixedOffset>, ctx: &mut PreheatContext<'_>) {
        let target = ctx.session.preheat_target_c;
        let sensor = &ctx.entities.boiler_temperature;
        let yesterday_min = ctx
            .aggregator
            .aggregate(
                sensor,
                std::time::Duration::from_secs(YESTERDAY_WINDOW_MINUTES * 60),
                Statistic::Min,
                Some(deadline - Duration::days(1)),
            )
            .await;
        let current = ctx.aggregator.try_read_f64(sensor).await;
        let calc_temp = match (yesterday_min, current) {
            (Some(y), Some(c)) => y.min(c),
            (Some(t), None) | (None, Some(t)) => t,
            (None, None) => REFERENCE_LOW_TEMP_C,
        };

        let demand = self.demand(calc_temp, target);
        debug!(?yesterday_min, ?current, calc_temp, ?demand, "pre-heat recalculated");
        if demand.is_zero() {
            info!(calc_temp, target_c = target, "water warm enough, no pre-heat tonight");
            self.cancel_cycle(deadline, ctx).await;
            return;
        }

        let now = ctx.clock.now();
        let start_at = deadline - (demand.duration() + planning_margin());
        if planned_to_past(start_at, now) {
            debug!(%start_at, "start time already passed, starting now");
            self.start(deadline, ctx).await;
        } else {
            let timer = ctx.timers.schedule_at(start_at, TimerAction::PreheatStart);
            info!(%start_at, %deadline, "night pre-heat start scheduled");
            self.state = PreheatState::StartPlanned { deadline, timer };
        }
    }

    async fn start(&mut self, deadline: DateTime<FixedOffset>, ctx: &mut PreheatContext<'_>) {
        let target = ctx.session.preheat_target_c;

        let Some(water_c) = ctx.aggregator.try_read_f64(&ctx.entities.boiler_temperature).await else {
            warn!("boiler temperature unavailable, skipping pre-heat");
            self.cancel_cycle(deadline, ctx).await;
            return;
        };
        let expected_c = water_c - PASSIVE_LOSS_RESERVE_C;
        if expected_c >= target {
            info!(water_c, target_c = target, "water already at pre-heat target");
            self.cancel_cycle(deadline, ctx).await;
            return;
        }

        let connection = ctx
            .aggregator
            .read_text(&ctx.entities.boiler_connection)
            .await
            .map(|s| BoilerConnection::from_state(&s))
            .unwrap_or(BoilerConnection::Disconnected);
        if connection == BoilerConnection::Disconnected {
            warn!("boiler disconnected, pre-heat cancelled");
            self.cancel_cycle(deadline, ctx).await;
            return;
        }

        let now = ctx.clock.now();
        let needed = self.demand(expected_c, target).duration();
        let spare = (deadline - now) - needed;
        if spare > Duration::minutes(RESCHEDULE_TOLERANCE_MINUTES) {
            let start_at = now + spare;
            let timer = ctx.timers.schedule_at(start_at, TimerAction::PreheatStart);
            info!(%start_at, spare_min = spare.num_minutes(), "too early for pre-heat, rescheduled");
            self.state = PreheatState::StartPlanned { deadline, timer };
            return;
        }

        if ctx.session.mode.is_forecast_driven() {
            let date = deadline.with_timezone(&self.tz).date_naive();
            let forecast_wh = ctx.session.forecast.for_date(date).unwrap_or_else(|| {
                warn!(%date, "no forecast for the pre-heat day, assuming none");
                0.0
            });
            let Some(soc) = ctx.aggregator.try_read_f64(&ctx.entities.battery_soc).await else {
                warn!("battery SOC unavailable, pre-heat cancelled");
                self.cancel_cycle(deadline, ctx).await;
                return;
            };
            let balance = self
                .balancer
                .evaluate(ctx.session.day_target_c, target, soc, forecast_wh);
            if !balance.proceeds() {
                info!(
                    required_kwh = balance.required_kwh(),
                    forecast_kwh = balance.forecast_kwh,
                    "not enough forecast PV, pre-heat cancelled"
                );
                self.cancel_cycle(deadline, ctx).await;
                return;
            }
        }

        if let Err(e) = ctx.actuator.turn_on(target).await {
            error!(error = %e, "failed to start pre-heat");
            self.cancel_cycle(deadline, ctx).await;
            return;
        }
        info!(water_c, target_c = target, %deadline, "night pre-heat started");

        if planned_to_past(deadline, now) {
            self.state = PreheatState::Idle;
            Self::stop_heating(ctx).await;
        } else {
            let timer = ctx.timers.schedule_at(deadline, TimerAction::PreheatEnd);
            self.state = PreheatState::PreheatActive { deadline, timer };
        }
    }

    /// Skip this cycle and clean up at the deadline, or right away if it is too close.
    async fn cancel_cycle(&mut self, deadline: DateTime<FixedOffset>, ctx: &mut PreheatContext<'_>) {
        let now = ctx.clock.now();
        if planned_to_past(deadline, now) {
            debug!("deadline reached, pre-heat cycle closed");
            self.state = PreheatState::Idle;
        } else {
            let timer = ctx.timers.schedule_at(deadline, TimerAction::PreheatEnd);
            self.state = PreheatState::Cancelled { deadline, timer };
        }
    }

    async fn end(&mut self, ctx: &mut PreheatContext<'_>) {
        let previous = std::mem::replace(&mut self.state, PreheatState::Idle);
        match previous {
            PreheatState::Cancelled { .. } => debug!("cancelled pre-heat cleaned up"),
            _ => Self::stop_heating(ctx).await,
        }
    }

    async fn stop_heating(ctx: &mut PreheatContext<'_>) {
        match ctx.actuator.turn_off().await {
            Ok(()) => info!("night pre-heat ended"),
            Err(e) => error!(error = %e, "failed to end pre-heat"),
        }
    }

    /// Abandon the cycle: cancel the pending timer, stop heating this
    /// scheduler started, return to idle.
    pub async fn cancel_all(&mut self, actuator: &mut BoilerActuator) {
        let previous = std::mem::replace(&mut self.state, PreheatState::Idle);
        if let Some(timer) = previous.timer() {
            timer.cancel();
        }
        if matches!(previous, PreheatState::PreheatActive { .. }) && actuator.is_commanded_on() {
            match actuator.turn_off().await {
                Ok(()) => info!("night pre-heat aborted"),
                Err(e) => error!(error = %e, "failed to stop pre-heat"),
            }
        }
        if previous.phase() != PreheatPhase::Idle {
            info!(from = ?previous.phase(), "night pre-heat reset");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::domain::{
        ActuatorError, BoilerCommand, BoilerControls, BoilerMode, ManagerMode, MockBoilerControls,
        RecordingBoiler,
    };
    use crate::forecast::ForecastDay;
    use crate::sensors::InMemorySensors;
    use crate::timer::{ManualClock, ManualTimers};
    use chrono::{NaiveDate, Utc};
    use std::sync::Arc;

    const TZ: Tz = chrono_tz::Europe::Bratislava;

    fn local(day: u32, h: u32, m: u32) -> DateTime<FixedOffset> {
        TZ.with_ymd_and_hms(2024, 3, day, h, m, 0).unwrap().fixed_offset()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    struct Rig {
        cfg: Config,
        session: SessionState,
        sensors: Arc<InMemorySensors>,
        clock: Arc<ManualClock>,
        timers: ManualTimers,
        aggregator: SensorAggregator,
        boiler: Arc<RecordingBoiler>,
        actuator: BoilerActuator,
        scheduler: NightPreheatScheduler,
    }

    impl Rig {
        fn new(now: DateTime<FixedOffset>) -> Self {
            Self::with_controls(now, Arc::new(RecordingBoiler::new()), None)
        }

        fn with_controls(
            now: DateTime<FixedOffset>,
            boiler: Arc<RecordingBoiler>,
            controls: Option<Arc<dyn BoilerControls>>,
        ) -> Self {
            let cfg = Config::default();
            let mut session = SessionState::new(&cfg);
            session.night_preheat = true;
            session.preheat_target_c = 50.0;
            session.morning_time = NaiveTime::from_hms_opt(6, 0, 0).unwrap();

            let sensors = Arc::new(InMemorySensors::new());
            sensors.set_state(&cfg.entities.boiler_connection, "Connected");
            sensors.set_state(&cfg.entities.battery_soc, "50");
            let clock = Arc::new(ManualClock::new(now));
            let aggregator = SensorAggregator::new(sensors.clone(), sensors.clone(), clock.clone());
            let actuator =
                BoilerActuator::new(controls.unwrap_or_else(|| boiler.clone() as Arc<dyn BoilerControls>));
            let balancer = ForecastEnergyBalancer::new(
                cfg.boiler.clone(),
                cfg.battery.clone(),
                cfg.manager.temp_variable_c,
            );
            let scheduler = NightPreheatScheduler::new(cfg.boiler.clone(), balancer, TZ);
            Self {
                cfg,
                session,
                sensors,
                clock,
                timers: ManualTimers::new(),
                aggregator,
                boiler,
                actuator,
                scheduler,
            }
        }

        fn water(&self, temp: f64) {
            self.sensors
                .set_state(&self.cfg.entities.boiler_temperature, temp);
        }

        fn tick(&mut self) {
            let mut ctx = PreheatContext {
                session: &self.session,
                aggregator: &self.aggregator,
                actuator: &mut self.actuator,
                timers: &self.timers,
                clock: self.clock.as_ref(),
                entities: &self.cfg.entities,
            };
            self.scheduler.on_tick(&mut ctx);
        }

        /// Jump the clock to the timer's due time and deliver it.
        async fn fire(&mut self, action: TimerAction) {
            let due = self.timers.due_at(action).expect("timer pending");
            self.clock.set(due);
            let fired = self.timers.fire(action).expect("timer fires");
            self.deliver(fired).await;
        }

        async fn deliver(&mut self, fired: TimerFired) {
            let mut ctx = PreheatContext {
                session: &self.session,
                aggregator: &self.aggregator,
                actuator: &mut self.actuator,
                timers: &self.timers,
                clock: self.clock.as_ref(),
                entities: &self.cfg.entities,
            };
            self.scheduler.on_timer(&fired, &mut ctx).await;
        }

        fn pending_count(&self) -> usize {
            self.timers.pending().len()
        }
    }

    #[test]
    fn test_guard_band() {
        let now = local(10, 22, 0);
        assert!(planned_to_past(now - Duration::minutes(1), now));
        assert!(planned_to_past(now, now));
        assert!(planned_to_past(now + Duration::minutes(5), now));
        assert!(!planned_to_past(now + Duration::minutes(6), now));
    }

    #[test]
    fn test_next_deadline_rolls_to_tomorrow() {
        let six = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        assert_eq!(next_deadline(local(10, 22, 0), six, TZ), local(11, 6, 0));
        assert_eq!(next_deadline(local(11, 3, 0), six, TZ), local(11, 6, 0));
        assert_eq!(next_deadline(local(11, 6, 0), six, TZ), local(12, 6, 0));
    }

    #[test]
    fn test_idle_plans_calc_before_deadline() {
        let mut rig = Rig::new(local(10, 18, 0));
        rig.tick();
        assert_eq!(rig.scheduler.phase(), PreheatPhase::CalcPlanned);
        assert_eq!(rig.scheduler.state().deadline(), Some(local(11, 6, 0)));

        // 1 -> 50 °C over 150 L at 2 kW takes ~256 min, plus the margin
        let trigger = rig.timers.due_at(TimerAction::PreheatCalc).unwrap();
        let lead = local(11, 6, 0) - trigger;
        assert_eq!(lead, heat_demand(2000.0, 150.0, 1.0, 50.0).duration() + planning_margin());
        assert_eq!(lead.num_minutes(), 316);
    }

    #[test]
    fn test_late_planning_moves_to_next_night() {
        // 04:00: the trigger for 06:00 has passed
        let mut rig = Rig::new(local(11, 4, 0));
        rig.tick();
        assert_eq!(rig.scheduler.state().deadline(), Some(local(12, 6, 0)));
    }

    #[test]
    fn test_switch_off_keeps_idle() {
        let mut rig = Rig::new(local(10, 18, 0));
        rig.session.night_preheat = false;
        rig.tick();
        assert_eq!(rig.scheduler.phase(), PreheatPhase::Idle);
        assert_eq!(rig.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_full_manual_night() {
        let mut rig = Rig::new(local(10, 18, 0));
        rig.water(38.0);
        rig.tick();
        rig.fire(TimerAction::PreheatCalc).await;

        // 38 -> 50: 2.09 kWh, 62.79 min; start = 06:00 - 122.79 min
        assert_eq!(rig.scheduler.phase(), PreheatPhase::StartPlanned);
        let start_at = rig.timers.due_at(TimerAction::PreheatStart).unwrap();
        assert!(start_at > local(11, 3, 57) && start_at < local(11, 3, 58));

        rig.fire(TimerAction::PreheatStart).await;
        assert_eq!(rig.scheduler.phase(), PreheatPhase::PreheatActive);
        assert!(rig.actuator.is_commanded_on());
        assert_eq!(rig.timers.due_at(TimerAction::PreheatEnd), Some(local(11, 6, 0)));

        rig.fire(TimerAction::PreheatEnd).await;
        assert_eq!(rig.scheduler.phase(), PreheatPhase::Idle);
        assert!(!rig.actuator.is_commanded_on());
        assert_eq!(rig.boiler.mode_commands(BoilerMode::Heat), 1);
        assert_eq!(rig.boiler.mode_commands(BoilerMode::Antifreeze), 1);
        assert_eq!(rig.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_yesterday_minimum_drives_calculation() {
        let mut rig = Rig::new(local(10, 18, 0));
        rig.water(48.0);
        let yesterday_night = local(10, 4, 0).with_timezone(&Utc);
        rig.sensors
            .push_sample(&rig.cfg.entities.boiler_temperature, yesterday_night, "30");
        rig.tick();
        rig.fire(TimerAction::PreheatCalc).await;

        // 30 -> 50: 3.49 kWh, 104.65 min; start = 06:00 - 164.65 min
        let start_at = rig.timers.due_at(TimerAction::PreheatStart).unwrap();
        assert!(start_at > local(11, 3, 15) && start_at < local(11, 3, 16));
    }

    #[tokio::test]
    async fn test_warm_water_cancels_then_cleans_up_without_actuation() {
        let mut rig = Rig::new(local(10, 18, 0));
        rig.water(55.0);
        rig.tick();
        rig.fire(TimerAction::PreheatCalc).await;

        assert_eq!(rig.scheduler.phase(), PreheatPhase::Cancelled);
        assert_eq!(rig.timers.due_at(TimerAction::PreheatEnd), Some(local(11, 6, 0)));

        rig.fire(TimerAction::PreheatEnd).await;
        assert_eq!(rig.scheduler.phase(), PreheatPhase::Idle);
        assert!(rig.boiler.commands().is_empty());
    }

    #[tokio::test]
    async fn test_start_reserve_skips_nearly_warm_tank() {
        let mut rig = Rig::new(local(10, 18, 0));
        rig.water(40.0);
        rig.tick();
        rig.fire(TimerAction::PreheatCalc).await;
        assert_eq!(rig.scheduler.phase(), PreheatPhase::StartPlanned);

        // warmed by daytime use of the element: 53 - 3 >= 50
        rig.water(53.0);
        rig.fire(TimerAction::PreheatStart).await;
        assert_eq!(rig.scheduler.phase(), PreheatPhase::Cancelled);
        assert!(rig.boiler.commands().is_empty());
    }

    #[tokio::test]
    async fn test_disconnected_boiler_cancels_start() {
        let mut rig = Rig::new(local(10, 18, 0));
        rig.water(40.0);
        rig.tick();
        rig.fire(TimerAction::PreheatCalc).await;
        rig.sensors
            .set_state(&rig.cfg.entities.boiler_connection, "Disconnected");

        rig.fire(TimerAction::PreheatStart).await;
        assert_eq!(rig.scheduler.phase(), PreheatPhase::Cancelled);
        assert!(rig.boiler.commands().is_empty());
    }

    #[tokio::test]
    async fn test_early_start_is_rescheduled() {
        let mut rig = Rig::new(local(10, 18, 0));
        rig.water(20.0);
        rig.tick();
        rig.fire(TimerAction::PreheatCalc).await;
        assert_eq!(rig.scheduler.phase(), PreheatPhase::StartPlanned);

        // water warmed since: 47 - 3 = 44 -> 50 needs ~31 min
        rig.water(47.0);
        rig.fire(TimerAction::PreheatStart).await;
        assert_eq!(rig.scheduler.phase(), PreheatPhase::StartPlanned);
        let again = rig.timers.due_at(TimerAction::PreheatStart).unwrap();
        let needed = heat_demand(2000.0, 150.0, 44.0, 50.0).duration();
        assert_eq!(again, local(11, 6, 0) - needed);
        assert_eq!(rig.pending_count(), 1);

        rig.fire(TimerAction::PreheatStart).await;
        assert_eq!(rig.scheduler.phase(), PreheatPhase::PreheatActive);
    }

    #[tokio::test]
    async fn test_start_in_the_past_starts_immediately() {
        // 04:30 with a 06:00 deadline already fixed by an earlier plan
        let mut rig = Rig::new(local(10, 18, 0));
        rig.water(30.0);
        rig.tick();
        let calc = rig.timers.fire(TimerAction::PreheatCalc).unwrap();
        rig.clock.set(local(11, 4, 30));
        rig.deliver(calc).await;

        assert_eq!(rig.scheduler.phase(), PreheatPhase::PreheatActive);
        assert!(!rig.timers.is_pending(TimerAction::PreheatStart));
        assert!(rig.actuator.is_commanded_on());
    }

    #[tokio::test]
    async fn test_forecast_shortfall_cancels() {
        let mut rig = Rig::new(local(10, 18, 0));
        rig.session.mode = ManagerMode::Automatic;
        rig.session.forecast.set(ForecastDay::Today, day(11), 500.0);
        rig.water(40.0);
        rig.tick();
        rig.fire(TimerAction::PreheatCalc).await;
        rig.fire(TimerAction::PreheatStart).await;

        // SOC 50 -> 65 needs 0.72 kWh
        assert_eq!(rig.scheduler.phase(), PreheatPhase::Cancelled);
        assert!(rig.boiler.commands().is_empty());
    }

    #[tokio::test]
    async fn test_forecast_surplus_starts() {
        let mut rig = Rig::new(local(10, 18, 0));
        rig.session.mode = ManagerMode::Automatic;
        rig.session.forecast.set(ForecastDay::Today, day(11), 720.0);
        rig.session.forecast.set(ForecastDay::Tomorrow, day(12), 0.0);
        rig.water(40.0);
        rig.tick();
        rig.fire(TimerAction::PreheatCalc).await;
        rig.fire(TimerAction::PreheatStart).await;
        assert_eq!(rig.scheduler.phase(), PreheatPhase::PreheatActive);
    }

    #[tokio::test]
    async fn test_forecast_from_before_midnight_covers_the_morning() {
        let mut rig = Rig::new(local(10, 18, 0));
        rig.session.mode = ManagerMode::Automatic;
        // published on the 10th as tomorrow's figure, no refresh since
        rig.session.forecast.set(ForecastDay::Tomorrow, day(11), 20_000.0);
        rig.water(40.0);
        rig.tick();
        rig.fire(TimerAction::PreheatCalc).await;
        rig.fire(TimerAction::PreheatStart).await;
        assert_eq!(rig.scheduler.phase(), PreheatPhase::PreheatActive);
    }

    #[tokio::test]
    async fn test_yesterdays_forecast_is_not_reused() {
        let mut rig = Rig::new(local(10, 18, 0));
        rig.session.mode = ManagerMode::Automatic;
        // the 10th's own figure: stale once the deadline is on the 11th
        rig.session.forecast.set(ForecastDay::Today, day(10), 20_000.0);
        rig.water(40.0);
        rig.tick();
        rig.fire(TimerAction::PreheatCalc).await;
        rig.fire(TimerAction::PreheatStart).await;

        assert_eq!(rig.scheduler.phase(), PreheatPhase::Cancelled);
        assert!(rig.boiler.commands().is_empty());
    }

    #[tokio::test]
    async fn test_start_check_near_deadline_closes_cycle() {
        let mut rig = Rig::new(local(10, 18, 0));
        rig.water(38.0);
        rig.tick();
        rig.fire(TimerAction::PreheatCalc).await;
        assert_eq!(rig.scheduler.phase(), PreheatPhase::StartPlanned);

        // start delivered late, 3 min before the deadline, tank already warm
        let start = rig.timers.fire(TimerAction::PreheatStart).unwrap();
        rig.clock.set(local(11, 5, 57));
        rig.water(58.0);
        rig.deliver(start).await;

        assert_eq!(rig.scheduler.phase(), PreheatPhase::Idle);
        assert!(!rig.timers.is_pending(TimerAction::PreheatEnd));
        assert_eq!(rig.pending_count(), 0);
        assert!(rig.boiler.commands().is_empty());
    }

    #[tokio::test]
    async fn test_start_inside_guard_band_heats_then_stops() {
        let mut rig = Rig::new(local(10, 18, 0));
        rig.water(38.0);
        rig.tick();
        rig.fire(TimerAction::PreheatCalc).await;

        let start = rig.timers.fire(TimerAction::PreheatStart).unwrap();
        rig.clock.set(local(11, 5, 57));
        rig.deliver(start).await;

        assert_eq!(rig.scheduler.phase(), PreheatPhase::Idle);
        assert!(!rig.actuator.is_commanded_on());
        assert_eq!(rig.pending_count(), 0);
        assert_eq!(
            rig.boiler.commands(),
            vec![
                BoilerCommand::SetTemperature(50.0),
                BoilerCommand::SetMode(BoilerMode::Heat),
                BoilerCommand::SetMode(BoilerMode::Antifreeze),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_turn_on_cancels_until_deadline() {
        let mut mock = MockBoilerControls::new();
        mock.expect_set_temperature().times(1).returning(|_| Ok(()));
        mock.expect_set_mode()
            .withf(|m| *m == BoilerMode::Heat)
            .times(1)
            .returning(|_| Err(ActuatorError::Unreachable("boiler offline".into())));

        let mut rig = Rig::with_controls(
            local(10, 18, 0),
            Arc::new(RecordingBoiler::new()),
            Some(Arc::new(mock)),
        );
        rig.water(38.0);
        rig.tick();
        rig.fire(TimerAction::PreheatCalc).await;
        rig.fire(TimerAction::PreheatStart).await;

        assert_eq!(rig.scheduler.phase(), PreheatPhase::Cancelled);
        assert!(!rig.actuator.is_commanded_on());
        assert_eq!(rig.timers.due_at(TimerAction::PreheatEnd), Some(local(11, 6, 0)));

        // the cleanup does not touch the boiler: any further call would fail the mock
        rig.fire(TimerAction::PreheatEnd).await;
        assert_eq!(rig.scheduler.phase(), PreheatPhase::Idle);
    }

    #[tokio::test]
    async fn test_stale_timer_is_ignored() {
        let mut rig = Rig::new(local(10, 18, 0));
        rig.water(40.0);
        rig.tick();
        let stale = TimerFired {
            id: 999,
            action: TimerAction::PreheatCalc,
        };
        rig.deliver(stale).await;
        assert_eq!(rig.scheduler.phase(), PreheatPhase::CalcPlanned);
    }

    #[tokio::test]
    async fn test_states_are_mutually_exclusive_through_a_night() {
        let mut rig = Rig::new(local(10, 18, 0));
        rig.water(38.0);
        rig.tick();
        let mut seen = vec![rig.scheduler.phase()];
        for action in [TimerAction::PreheatCalc, TimerAction::PreheatStart, TimerAction::PreheatEnd] {
            assert!(rig.pending_count() <= 1);
            rig.fire(action).await;
            seen.push(rig.scheduler.phase());
        }
        assert_eq!(
            seen,
            vec![
                PreheatPhase::CalcPlanned,
                PreheatPhase::StartPlanned,
                PreheatPhase::PreheatActive,
                PreheatPhase::Idle
            ]
        );
    }

    #[tokio::test]
    async fn test_switch_off_mid_preheat_turns_off_exactly_once() {
        let mut mock = MockBoilerControls::new();
        mock.expect_set_temperature().times(1).returning(|_| Ok(()));
        mock.expect_set_mode()
            .withf(|m| *m == BoilerMode::Heat)
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_set_mode()
            .withf(|m| *m == BoilerMode::Antifreeze)
            .times(1)
            .returning(|_| Ok(()));

        let mut rig = Rig::with_controls(
            local(10, 18, 0),
            Arc::new(RecordingBoiler::new()),
            Some(Arc::new(mock)),
        );
        rig.water(38.0);
        rig.tick();
        rig.fire(TimerAction::PreheatCalc).await;
        rig.fire(TimerAction::PreheatStart).await;
        assert!(rig.scheduler.is_active());

        rig.scheduler.cancel_all(&mut rig.actuator).await;
        rig.scheduler.cancel_all(&mut rig.actuator).await;
        assert_eq!(rig.scheduler.phase(), PreheatPhase::Idle);
        assert_eq!(rig.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_switch_off_while_planned_sends_nothing() {
        let mut rig = Rig::new(local(10, 18, 0));
        rig.water(38.0);
        rig.tick();
        rig.scheduler.cancel_all(&mut rig.actuator).await;
        assert_eq!(rig.scheduler.phase(), PreheatPhase::Idle);
        assert_eq!(rig.pending_count(), 0);
        assert!(rig.boiler.commands().is_empty());
    }
}
