pub mod controls;
pub mod home_assistant;
pub mod status;
pub mod watch;

pub use controls::{spawn_control_watches, Control};
pub use home_assistant::{HomeAssistantClient, HostError};
pub use status::{RecordingStatus, StatusSink, StatusUpdate};
pub use watch::spawn_state_watch;
