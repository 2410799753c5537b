use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::BoilerMode;

/// Boiler actuation errors
#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("Boiler command rejected: {0}")]
    Rejected(String),
    #[error("Boiler unreachable: {0}")]
    Unreachable(String),
}

/// The two physical commands the boiler accepts.
///
/// Both calls wait for the host to acknowledge the command before returning.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BoilerControls: Send + Sync {
    async fn set_temperature(&self, temperature_c: f64) -> Result<(), ActuatorError>;
    async fn set_mode(&self, mode: BoilerMode) -> Result<(), ActuatorError>;
}

/// Drives the boiler and remembers whether this system commanded heating.
///
/// The commanded flag can disagree with the hardware heating status: the
/// element reports off once its thermostat target is reached while the
/// commanded mode is still heat.
pub struct BoilerActuator {
    controls: Arc<dyn BoilerControls>,
    commanded_on: bool,
}

impl BoilerActuator {
    pub fn new(controls: Arc<dyn BoilerControls>) -> Self {
        Self {
            controls,
            commanded_on: false,
        }
    }

    pub fn is_commanded_on(&self) -> bool {
        self.commanded_on
    }

    /// Set the thermostat target, then switch the mode to heat.
    pub async fn turn_on(&mut self, temperature_c: f64) -> Result<(), ActuatorError> {
        debug!(temperature_c, "boiler on");
        self.controls.set_temperature(temperature_c).await?;
        self.controls.set_mode(BoilerMode::Heat).await?;
        self.commanded_on = true;
        info!(temperature_c, "boiler heating commanded");
        Ok(())
    }

    /// Switch the mode to antifreeze.
    pub async fn turn_off(&mut self) -> Result<(), ActuatorError> {
        debug!("boiler off");
        self.controls.set_mode(BoilerMode::Antifreeze).await?;
        self.commanded_on = false;
        info!("boiler set to antifreeze");
        Ok(())
    }

    /// Push a new thermostat target without touching the mode.
    pub async fn set_target(&self, temperature_c: f64) -> Result<(), ActuatorError> {
        self.controls.set_temperature(temperature_c).await
    }
}

/// Command recorded by [`RecordingBoiler`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoilerCommand {
    SetTemperature(f64),
    SetMode(BoilerMode),
}

/// In-memory boiler that records every command it receives.
///
/// Used for dry runs and tests in place of a real thermostat.
#[derive(Debug, Default)]
pub struct RecordingBoiler {
    commands: Mutex<Vec<BoilerCommand>>,
    fail: Mutex<bool>,
}

impl RecordingBoiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<BoilerCommand> {
        self.commands.lock().clone()
    }

    pub fn mode_commands(&self, mode: BoilerMode) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|c| **c == BoilerCommand::SetMode(mode))
            .count()
    }

    pub fn last_mode(&self) -> Option<BoilerMode> {
        self.commands.lock().iter().rev().find_map(|c| match c {
            BoilerCommand::SetMode(m) => Some(*m),
            _ => None,
        })
    }

    /// Make every following command fail as unreachable.
    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    fn record(&self, command: BoilerCommand) -> Result<(), ActuatorError> {
        if *self.fail.lock() {
            return Err(ActuatorError::Unreachable("simulated failure".to_string()));
        }
        self.commands.lock().push(command);
        Ok(())
    }
}

#[async_trait]
impl BoilerControls for RecordingBoiler {
    async fn set_temperature(&self, temperature_c: f64) -> Result<(), ActuatorError> {
        self.record(BoilerCommand::SetTemperature(temperature_c))
    }

    async fn set_mode(&self, mode: BoilerMode) -> Result<(), ActuatorError> {
        self.record(BoilerCommand::SetMode(mode))
    }
}
