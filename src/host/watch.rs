use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::sensors::StateSource;

/// Poll `entity_id` and call `on_change` with each new state.
///
/// The first state read is passed on only when `report_initial` is set,
/// otherwise it is just remembered. Read errors are logged and the last known
/// state is kept. Stops when `on_change` returns `false`.
pub fn spawn_state_watch<F>(
    source: Arc<dyn StateSource>,
    entity_id: String,
    every: Duration,
    report_initial: bool,
    mut on_change: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnMut(String) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last: Option<String> = None;
        loop {
            interval.tick().await;
            let state = match source.state(&entity_id).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(entity_id = %entity_id, error = %e, "state watch read failed");
                    continue;
                }
            };
            let report = match &last {
                None => {
                    debug!(entity_id = %entity_id, %state, "state watch started");
                    report_initial
                }
                Some(prev) if *prev != state => {
                    debug!(entity_id = %entity_id, from = %prev, to = %state, "state changed");
                    true
                }
                Some(_) => false,
            };
            if report && !on_change(state.clone()) {
                break;
            }
            last = Some(state);
        }
    })
}
