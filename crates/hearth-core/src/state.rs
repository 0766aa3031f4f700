use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::{DeviceEvent, EventKind, ThermostatMode};
use crate::ids::DeviceId;

/// Derived snapshot of a device's current state.
///
/// Always reproducible by replaying events `1..=as_of_sequence` through
/// [`DeviceState::apply`]; the event log is the single source of truth and
/// any cached snapshot may be discarded and rebuilt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: DeviceId,
    pub setpoint: Option<f64>,
    pub mode: Option<ThermostatMode>,
    pub last_sensed_temperature: Option<f64>,
    pub last_sensed_at: Option<DateTime<Utc>>,
    pub as_of_sequence: i64,
}

impl DeviceState {
    /// Empty initial state, watermark 0.
    pub fn initial(device_id: DeviceId) -> Self {
        Self {
            device_id,
            setpoint: None,
            mode: None,
            last_sensed_temperature: None,
            last_sensed_at: None,
            as_of_sequence: 0,
        }
    }

    /// Fold one event into the snapshot. Events must be applied in
    /// ascending sequence order; applying a prefix and then the remainder
    /// yields the same state as one full replay.
    pub fn apply(&mut self, event: &DeviceEvent) {
        match &event.kind {
            EventKind::SetpointChanged { setpoint } => {
                self.setpoint = Some(*setpoint);
            }
            EventKind::ModeChanged { mode } => {
                self.mode = Some(*mode);
            }
            EventKind::TemperatureSensed { temperature } => {
                self.last_sensed_temperature = Some(*temperature);
                self.last_sensed_at = Some(event.occurred_at);
            }
        }
        self.as_of_sequence = event.sequence;
    }
}
