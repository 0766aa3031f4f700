pub mod deadline;
pub mod events;
pub mod ids;
pub mod state;

pub use deadline::Deadline;
pub use events::{DeviceEvent, EventKind, ThermostatMode};
pub use ids::DeviceId;
pub use state::DeviceState;
