use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::DeviceId;

/// Thermostat operating mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermostatMode {
    Off,
    Heat,
    Cool,
    Auto,
}

impl std::fmt::Display for ThermostatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::Heat => write!(f, "heat"),
            Self::Cool => write!(f, "cool"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

impl std::str::FromStr for ThermostatMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Self::Off),
            "heat" => Ok(Self::Heat),
            "cool" => Ok(Self::Cool),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown thermostat mode: {other}")),
        }
    }
}

/// Event payload. Closed set: one variant per event type, each carrying
/// only its relevant fields. Unknown types fail deserialization at the
/// ingest edge and never reach the store or the fold.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    SetpointChanged { setpoint: f64 },
    ModeChanged { mode: ThermostatMode },
    TemperatureSensed { temperature: f64 },
}

impl EventKind {
    /// Stable type string, stored in the `type` column.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SetpointChanged { .. } => "setpoint_changed",
            Self::ModeChanged { .. } => "mode_changed",
            Self::TemperatureSensed { .. } => "temperature_sensed",
        }
    }
}

/// An immutable stored device event.
///
/// `sequence` is assigned by the store: per device, unique, contiguous from
/// 1, strictly increasing. Once assigned, an event is never mutated or
/// deleted. `occurred_at` comes from the producer; `recorded_at` from the
/// store at append time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub device_id: DeviceId,
    pub sequence: i64,
    #[serde(flatten)]
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}
