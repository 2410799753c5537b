//! Operator controls kept as host helper entities.
//!
//! Each control is polled with [`spawn_state_watch`]. Its current value is
//! applied at start-up and every later change is forwarded to the manager
//! as a [`ManagerEvent`].

use chrono::NaiveTime;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::spawn_state_watch;
use crate::config::EntitiesConfig;
use crate::controller::{ManagerEvent, ManagerHandle};
use crate::domain::ManagerMode;
use crate::sensors::{parse_numeric, StateSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Mode,
    NightPreheat,
    DayTarget,
    PreheatTarget,
    MorningTime,
}

impl Control {
    pub const ALL: [Control; 5] = [
        Control::Mode,
        Control::NightPreheat,
        Control::DayTarget,
        Control::PreheatTarget,
        Control::MorningTime,
    ];

    pub fn entity_id(self, entities: &EntitiesConfig) -> &str {
        match self {
            Control::Mode => &entities.mode_control,
            Control::NightPreheat => &entities.night_preheat_control,
            Control::DayTarget => &entities.day_target_control,
            Control::PreheatTarget => &entities.preheat_target_control,
            Control::MorningTime => &entities.morning_time_control,
        }
    }

    /// Translate the entity state into a manager event, `None` if it does not parse.
    pub fn parse(self, state: &str) -> Option<ManagerEvent> {
        let state = state.trim();
        match self {
            Control::Mode => ManagerMode::from_str(state).ok().map(ManagerEvent::SelectMode),
            Control::NightPreheat => match state {
                "on" => Some(ManagerEvent::NightPreheatSwitch(true)),
                "off" => Some(ManagerEvent::NightPreheatSwitch(false)),
                _ => None,
            },
            Control::DayTarget => parse_numeric(state).map(ManagerEvent::DayTarget),
            Control::PreheatTarget => parse_numeric(state).map(ManagerEvent::PreheatTarget),
            Control::MorningTime => NaiveTime::parse_from_str(state, "%H:%M:%S")
                .or_else(|_| NaiveTime::parse_from_str(state, "%H:%M"))
                .ok()
                .map(ManagerEvent::MorningTime),
        }
    }
}

/// Watch every control entity and forward its values to `handle`.
///
/// Watches end when the manager stops listening.
pub fn spawn_control_watches(
    source: Arc<dyn StateSource>,
    entities: &EntitiesConfig,
    every: Duration,
    handle: ManagerHandle,
) -> Vec<JoinHandle<()>> {
    Control::ALL
        .into_iter()
        .map(|control| {
            let entity_id = control.entity_id(entities).to_string();
            let handle = handle.clone();
            let watched = entity_id.clone();
            info!(?control, entity_id = %entity_id, "following operator control");
            spawn_state_watch(source.clone(), entity_id, every, true, move |state| {
                match control.parse(&state) {
                    Some(event) => handle.send(event),
                    None => {
                        warn!(entity_id = %watched, %state, "unusable control value ignored");
                        !handle.is_closed()
                    }
                }
            })
        })
        .collect()
}
