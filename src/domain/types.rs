use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

// ============================================================================
// Manager status and mode
// ============================================================================

/// Process-wide status of the manager, as shown to the operator.
///
/// Exactly one value is active at a time. Every handler that changes an
/// external condition (grid, transport, boiler link, mode) leaves the status
/// consistent with that condition before returning.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr, EnumIter,
)]
pub enum ManagerStatus {
    #[strum(serialize = "Initializing")]
    Initializing,
    #[strum(serialize = "Running")]
    Running,
    #[strum(serialize = "Off")]
    Off,
    #[strum(serialize = "Off - Warning (Grid Lost)")]
    OffGridLost,
    #[strum(serialize = "Off - Warning (Grid Unknown)")]
    OffGridUnknown,
    #[strum(serialize = "Off - Warning (MQTT connection lost)")]
    OffMqttLost,
    #[strum(serialize = "Running - Warning (MQTT connection lost)")]
    RunningMqttLost,
    #[strum(serialize = "Paused - Warning (Boiler Disconnected)")]
    PausedBoilerDisconnected,
}

/// Operator-selected manager mode.
///
/// `Automatic` is the forecast-driven mode: night pre-heating is gated by the
/// next-day PV forecast. It can only be selected when a forecast source is
/// configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum ManagerMode {
    Automatic,
    Manual,
    Off,
}

impl ManagerMode {
    pub fn is_forecast_driven(&self) -> bool {
        matches!(self, ManagerMode::Automatic)
    }
}

// ============================================================================
// Boiler
// ============================================================================

/// Operating mode of the boiler's mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
pub enum BoilerMode {
    /// Heat to the thermostat target
    #[strum(serialize = "MANUAL")]
    Heat,
    /// Keep the tank above freezing only
    #[strum(serialize = "ANTIFREEZE")]
    Antifreeze,
}

/// Link state between the host and the boiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum BoilerConnection {
    Connected,
    Disconnected,
}

impl BoilerConnection {
    /// Anything other than an explicit "Disconnected" counts as connected.
    pub fn from_state(state: &str) -> Self {
        if state == "Disconnected" {
            BoilerConnection::Disconnected
        } else {
            BoilerConnection::Connected
        }
    }
}

/// Heating-element status as reported by the boiler hardware.
///
/// The hardware reports `Off` once the thermostat target is reached, even if
/// the commanded mode is still heat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeatingStatus {
    On,
    Off,
}

impl HeatingStatus {
    pub fn from_state(state: &str) -> Self {
        if state.eq_ignore_ascii_case("on") {
            HeatingStatus::On
        } else {
            HeatingStatus::Off
        }
    }
}

// ============================================================================
// Installation
// ============================================================================

/// Electrical phase the boiler and critical loads sit on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl Phase {
    pub fn number(&self) -> u8 {
        match self {
            Phase::L1 => 1,
            Phase::L2 => 2,
            Phase::L3 => 3,
        }
    }

    /// Discover the phase from a critical-load topic of the shape
    /// `.../system/<n>/Ac/ConsumptionOnOutput/L<d>/Power`.
    pub fn from_topic(topic: &str) -> Option<Self> {
        let parts: Vec<&str> = topic.split('/').collect();
        parts.windows(6).find_map(|w| {
            let is_match = w[0] == "system"
                && !w[1].is_empty()
                && w[1].chars().all(|c| c.is_ascii_digit())
                && w[2] == "Ac"
                && w[3] == "ConsumptionOnOutput"
                && w[5] == "Power";
            if !is_match {
                return None;
            }
            let digit = w[4].strip_prefix('L')?;
            if digit.len() != 1 {
                return None;
            }
            digit.parse::<u8>().ok().and_then(|n| Phase::try_from(n).ok())
        })
    }
}

impl TryFrom<u8> for Phase {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Phase::L1),
            2 => Ok(Phase::L2),
            3 => Ok(Phase::L3),
            other => Err(format!("Unknown phase: {}", other)),
        }
    }
}

impl From<Phase> for u8 {
    fn from(p: Phase) -> Self {
        p.number()
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.number())
    }
}

/// Grid availability as reported by the inverter's grid-lost alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridState {
    Available,
    Lost,
    Unknown,
}

impl GridState {
    pub fn from_state(state: &str) -> Self {
        match state {
            "0" => GridState::Available,
            "1" => GridState::Lost,
            _ => GridState::Unknown,
        }
    }
}
